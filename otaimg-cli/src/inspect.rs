//! `inspect-index` and `inspect-blob` subcommands.

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use otaimg::artifact::ImageSource;
use otaimg::Sha256Digest;

#[derive(Args)]
pub struct InspectIndexArgs {
    /// An extracted image directory or an OTA image artifact.
    pub path: PathBuf,
}

pub fn inspect_index(args: InspectIndexArgs) -> Result<()> {
    let source = ImageSource::detect(&args.path)?;
    let raw = source.open()?.index_bytes()?;
    let value: serde_json::Value =
        serde_json::from_slice(&raw).context("index.json is not valid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[derive(Args)]
pub struct InspectBlobArgs {
    /// The sha256 checksum of the blob, `sha256:<hex>`.
    #[arg(long)]
    pub checksum: String,

    /// Save the blob to a file instead of printing it.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print the blob as raw bytes; only respected without `--output`.
    #[arg(long)]
    pub bytes: bool,

    /// An extracted image directory or an OTA image artifact.
    pub path: PathBuf,
}

pub fn inspect_blob(args: InspectBlobArgs) -> Result<()> {
    let digest = Sha256Digest::parse(&args.checksum)
        .context("not a valid checksum, only sha256 checksums are supported")?;
    let source = ImageSource::detect(&args.path)?;
    let mut reader = source.open()?;
    let contents = reader.read_blob(&digest)?;

    match args.output {
        Some(output) => {
            eprintln!("Save blob to {} ...", output.display());
            std::fs::write(output, contents)?;
        }
        None if args.bytes => {
            std::io::stdout().write_all(&contents)?;
        }
        None => {
            print!("{}", String::from_utf8_lossy(&contents));
        }
    }
    Ok(())
}
