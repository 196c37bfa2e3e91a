//! `verify-resources` and `verify-sign` subcommands.

use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use clap::Args;
use otaimg::artifact::ImageSource;
use otaimg::sign::{verify_image_signature, CaStore};
use otaimg::verify::verify_image_blobs;
use otaimg::Sha256Digest;
use tracing::warn;

#[derive(Args)]
pub struct VerifyResourcesArgs {
    /// Check only the blob of this sha256 checksum; repeatable.
    #[arg(long = "blob-checksum")]
    pub blob_checksum: Vec<String>,

    /// Number of worker threads used for hashing.
    #[arg(long, default_value_t = 6)]
    pub worker_threads: usize,

    /// An extracted image directory or an OTA image artifact.
    pub image_root: PathBuf,
}

pub fn verify_resources(args: VerifyResourcesArgs) -> Result<()> {
    let source = ImageSource::detect(&args.image_root)?;
    let digests = if args.blob_checksum.is_empty() {
        println!(
            "Verifying all blobs of the OTA image at {} ...",
            args.image_root.display()
        );
        None
    } else {
        println!(
            "Verifying {} specified blobs of the OTA image at {} ...",
            args.blob_checksum.len(),
            args.image_root.display()
        );
        Some(
            args.blob_checksum
                .iter()
                .map(|raw| {
                    // accept both the prefixed and the bare hex form
                    Sha256Digest::parse(raw).or_else(|_| Sha256Digest::from_hex(raw))
                })
                .collect::<otaimg::Result<Vec<_>>>()
                .context("invalid blob checksum")?,
        )
    };

    let count = verify_image_blobs(&source, digests, args.worker_threads)?;
    println!("Total {count} blobs verified.");
    Ok(())
}

#[derive(Args)]
pub struct VerifySignArgs {
    /// Folder holding the CA certificates to verify the sign cert against.
    #[arg(long)]
    pub ca_dir: Option<PathBuf>,

    /// An extracted image directory or an OTA image artifact.
    pub image_root: PathBuf,
}

pub fn verify_sign(args: VerifySignArgs) -> Result<()> {
    let source = ImageSource::detect(&args.image_root)?;
    let mut reader = source.open()?;

    let index = reader.parse_index()?;
    if !index.signed() {
        bail!("OTA image at {} is not signed", args.image_root.display());
    }
    let Some(token) = reader.jwt_raw()? else {
        bail!("index.jwt not found, broken OTA image?");
    };

    let ca_store = match &args.ca_dir {
        Some(dir) => {
            println!("Verifying the sign cert against the given root of trust ...");
            Some(CaStore::load_dir(dir).context("failed to load CA directory")?)
        }
        None => {
            warn!("no --ca-dir provided, SKIPPING sign cert verification");
            None
        }
    };

    println!("Verifying the index.jwt signature ...");
    let index_bytes = reader.index_bytes()?;
    let claims = verify_image_signature(&index_bytes, &token, ca_store.as_ref())?;
    println!("Verified index.jwt claims:");
    println!("{}", serde_json::to_string_pretty(&claims)?);
    Ok(())
}
