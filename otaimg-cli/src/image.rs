//! `list-image` and `lookup-image` subcommands.

use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use clap::Args;
use otaimg::artifact::ImageSource;
use otaimg::meta::{ImageConfig, ImageIdentifier, ImageManifest, Metafile as _, ReleaseKey};

#[derive(Args)]
pub struct ListImageArgs {
    /// An extracted image directory or an OTA image artifact.
    pub path: PathBuf,
}

pub fn list_image(args: ListImageArgs) -> Result<()> {
    let source = ImageSource::detect(&args.path)?;
    let mut reader = source.open()?;
    let index = reader.parse_index()?;

    let identifiers = index.image_identifiers();
    if identifiers.is_empty() {
        println!("No image payloads found.");
        return Ok(());
    }
    println!("Image payloads ({}):", identifiers.len());
    for id in &identifiers {
        let descriptor = index
            .find_image(id)
            .context("index listed an identifier it cannot find")?;
        println!("  {id}\t{}\t{} bytes", descriptor.digest, descriptor.size);
    }
    Ok(())
}

#[derive(Args)]
pub struct LookupImageArgs {
    /// The ECU id of the image payload to use.
    #[arg(long)]
    pub ecu_id: String,

    /// The release key of the image payload to use.
    #[arg(short = 'k', long, default_value = "dev")]
    pub release_key: String,

    /// Print the image config instead of the image manifest.
    #[arg(long)]
    pub image_config: bool,

    /// An extracted image directory or an OTA image artifact.
    pub path: PathBuf,
}

pub fn lookup_image(args: LookupImageArgs) -> Result<()> {
    let release_key: ReleaseKey = args.release_key.parse()?;
    let image_id = ImageIdentifier::new(&args.ecu_id, release_key);

    let source = ImageSource::detect(&args.path)?;
    let mut reader = source.open()?;
    let index = reader.parse_index()?;
    let Some(descriptor) = index.find_image(&image_id) else {
        bail!("image payload {image_id} not found");
    };
    let manifest = ImageManifest::parse(&reader.read_blob(&descriptor.digest)?)?;

    if args.image_config {
        let config = ImageConfig::parse(&reader.read_blob(&manifest.config.digest)?)?;
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
    }
    Ok(())
}
