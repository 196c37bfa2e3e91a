//! `deploy-image` subcommand.

use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use clap::Args;
use otaimg::artifact::ImageSource;
use otaimg::deploy::{
    default_workers, deploy_resources, DeployOptions, DeploySetup, RootfsDeployer,
};
use otaimg::ft::FileTable;
use otaimg::meta::{ImageIdentifier, ReleaseKey};
use tracing::info;

/// Resource directory under the rootfs dir, aligned with the OTA client's
/// on-ECU convention.
const RESOURCE_DIR_NAME: &str = ".ota-resources";

#[derive(Args)]
pub struct DeployImageArgs {
    /// The OTA image artifact to use.
    #[arg(short, long)]
    pub image: PathBuf,

    /// The ECU id of the system image payload to use.
    #[arg(long)]
    pub ecu_id: String,

    /// The release key of the system image payload to use.
    #[arg(short = 'k', long, default_value = "dev")]
    pub release_key: String,

    /// The target folder to deploy the system rootfs to.
    #[arg(short = 'o', long)]
    pub rootfs_dir: PathBuf,

    /// Temporary directory base; defaults to the current directory.
    #[arg(short, long)]
    pub tmp_dir: Option<PathBuf>,

    /// Worker thread count.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum concurrent jobs pending in the worker pool.
    #[arg(long)]
    pub concurrent: Option<usize>,

    /// Read buffer size in bytes for artifact streaming.
    #[arg(long)]
    pub read_size: Option<usize>,
}

pub fn deploy_image(args: DeployImageArgs) -> Result<()> {
    if !args.image.exists() {
        bail!("input image {} not found", args.image.display());
    }
    if args.rootfs_dir.exists() {
        bail!("{} already exists", args.rootfs_dir.display());
    }

    let defaults = DeployOptions::default();
    let opts = DeployOptions {
        workers: args.workers.unwrap_or_else(default_workers),
        concurrent: args.concurrent.unwrap_or(defaults.concurrent),
        read_size: args.read_size.unwrap_or(defaults.read_size),
    };

    fs::create_dir_all(&args.rootfs_dir)?;
    fs::set_permissions(&args.rootfs_dir, fs::Permissions::from_mode(0o750))?;
    let resource_dir = args.rootfs_dir.join(RESOURCE_DIR_NAME);
    fs::create_dir(&resource_dir)?;
    fs::set_permissions(&resource_dir, fs::Permissions::from_mode(0o700))?;

    let tmp_base = match &args.tmp_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let tmp_dir = tempfile::Builder::new()
        .prefix(".otaimg-deploy-")
        .tempdir_in(&tmp_base)
        .context("failed to create temporary working directory")?;

    let workdir = tmp_dir.path().join("workdir");
    fs::create_dir(&workdir)?;
    let staging_dir = tmp_dir.path().join("staging");
    fs::create_dir(&staging_dir)?;

    let release_key: ReleaseKey = args.release_key.parse()?;
    let image_id = ImageIdentifier::new(&args.ecu_id, release_key);
    info!(image = %image_id, "selecting system image payload");

    let source = ImageSource::detect(&args.image)?;
    let setup = DeploySetup::new(source, &image_id, &workdir)?;

    let index_labels = serde_json::to_string(&setup.index.annotations)?;
    info!(annotations = %index_labels, "image index labels");
    let image_stats = serde_json::to_string(&setup.config.labels)?;
    info!(labels = %image_stats, "system image statistics");

    info!("staging resources for rootfs setup");
    let (count, size) = deploy_resources(&setup, &resource_dir, &staging_dir, &opts)?;
    info!(count, size, "resources staged");

    info!(rootfs = %args.rootfs_dir.display(), "setting up rootfs");
    let ft = FileTable::open(&setup.ft_db)?;
    RootfsDeployer::new(&args.rootfs_dir, &resource_dir, &opts).setup_rootfs(&ft)?;

    info!(image = %image_id, rootfs = %args.rootfs_dir.display(), "deployment finished");
    Ok(())
}
