//! CLI for the otaimg OTA image toolkit.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod deploy;
mod image;
mod inspect;
mod verify;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "otaimg",
    version,
    about = "OTA image toolkit for ECU firmware distribution"
)]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the index.json of an OTA image.
    InspectIndex(inspect::InspectIndexArgs),

    /// Print or save a blob from an OTA image.
    InspectBlob(inspect::InspectBlobArgs),

    /// Enumerate the image payloads of an OTA image.
    ListImage(image::ListImageArgs),

    /// Look up one image payload by ECU id and release key.
    LookupImage(image::LookupImageArgs),

    /// Deploy a system image payload from an OTA image artifact to a folder.
    DeployImage(deploy::DeployImageArgs),

    /// Verify the blobs in an OTA image.
    VerifyResources(verify::VerifyResourcesArgs),

    /// Verify the signature of an OTA image.
    VerifySign(verify::VerifySignArgs),

    /// Print the toolkit version.
    Version,
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = cli.dispatch() {
        eprintln!("ERR: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        match self.command {
            Command::InspectIndex(args) => inspect::inspect_index(args),
            Command::InspectBlob(args) => inspect::inspect_blob(args),
            Command::ListImage(args) => image::list_image(args),
            Command::LookupImage(args) => image::lookup_image(args),
            Command::DeployImage(args) => deploy::deploy_image(args),
            Command::VerifyResources(args) => verify::verify_resources(args),
            Command::VerifySign(args) => verify::verify_sign(args),
            Command::Version => {
                println!("otaimg v{}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}
