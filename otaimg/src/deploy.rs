//! Deploying an image payload: stage resources, then build the rootfs.
//!
//! Both phases run a bounded worker pool: a single dispatcher thread
//! walks the file table and submits entries through a counting
//! semaphore; the first worker failure latches, the dispatcher stops
//! submitting, in-flight tasks drain, and the aggregated error surfaces.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{BufWriter, Read as _, Write as _};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex};
use std::thread;

use tracing::{debug, info};

use crate::artifact::{ImageReader, ImageSource};
use crate::consts::{FILE_TABLE_FNAME, RESOURCE_TABLE_FNAME, ZSTD_COMPRESSION_ALG};
use crate::ft::fs_ops::{
    prepare_dir, prepare_non_regular, prepare_regular_copy, prepare_regular_hardlink,
    prepare_regular_inlined,
};
use crate::ft::{FileTable, RegularEntry};
use crate::meta::{
    load_metafile_bytes, ImageConfig, ImageIdentifier, ImageIndex, ImageManifest, Metafile as _,
    SysConfig,
};
use crate::rst::{ResourceDownloadInfo, ResourcePreparer, ResourceTable};
use crate::util::{tmp_fname, FailLatch, Semaphore};
use crate::{Error, Result, Sha256Digest};

/// Tuning knobs of the deployment worker pools.
#[derive(Debug, Clone, Copy)]
#[allow(clippy::exhaustive_structs)]
pub struct DeployOptions {
    /// Worker thread count.
    pub workers: usize,
    /// Maximum pending submissions gated by the semaphore.
    pub concurrent: usize,
    /// Read buffer size for artifact streaming.
    pub read_size: usize,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            concurrent: 1024,
            read_size: 1024 * 1024,
        }
    }
}

/// Default worker count: `min(8, cores + 4)`.
pub fn default_workers() -> usize {
    let cores = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    (cores + 4).min(8)
}

/// Metadata extracted from an image for one payload deployment.
///
/// Holds the parsed index/manifest/config plus the file table and
/// resource table databases extracted (and decompressed) into the
/// caller's working directory.
#[derive(Debug)]
pub struct DeploySetup {
    /// The source the image is read from.
    pub source: ImageSource,
    /// Parsed image index.
    pub index: ImageIndex,
    /// Parsed manifest of the selected payload.
    pub manifest: ImageManifest,
    /// Parsed image config of the selected payload.
    pub config: ImageConfig,
    /// Parsed sys config, when the payload carries one.
    pub sys_config: Option<SysConfig>,
    /// Extracted file table database.
    pub ft_db: PathBuf,
    /// Extracted resource table database.
    pub rst_db: PathBuf,
}

impl DeploySetup {
    /// Prepares a working directory for deploying `image_id` from `source`.
    pub fn new(source: ImageSource, image_id: &ImageIdentifier, workdir: &Path) -> Result<Self> {
        let mut reader = source.open()?;
        let index = reader.parse_index()?;

        let rst_descriptor = index
            .resource_table()
            .ok_or_else(|| Error::NotFound("resource table descriptor in index".to_owned()))?
            .clone();
        let rst_db = workdir.join(RESOURCE_TABLE_FNAME);
        reader.export_blob(&rst_descriptor.digest, &rst_descriptor.media_type, &rst_db, true)?;

        let manifest_descriptor = index
            .find_image(image_id)
            .ok_or_else(|| Error::NotFound(format!("image payload {image_id}")))?
            .clone();
        let manifest = ImageManifest::parse(&reader.read_blob(&manifest_descriptor.digest)?)?;
        let config = ImageConfig::parse(&reader.read_blob(&manifest.config.digest)?)?;
        let sys_config = match &config.sys_config {
            Some(descriptor) => Some(load_metafile_bytes::<SysConfig>(
                descriptor,
                &reader.read_blob(&descriptor.digest)?,
            )?),
            None => None,
        };

        let ft_descriptor = manifest.file_table()?.clone();
        let ft_db = workdir.join(FILE_TABLE_FNAME);
        reader.export_blob(&ft_descriptor.digest, &ft_descriptor.media_type, &ft_db, true)?;

        debug!(image = %image_id, "deployment workdir prepared");
        Ok(Self {
            source,
            index,
            manifest,
            config,
            sys_config,
            ft_db,
            rst_db,
        })
    }
}

/// Stages every non-inlined resource of the payload into `resource_dir`.
///
/// Returns `(count, total_size)` over the staged resources. Each worker
/// owns its artifact reader, resource-table connection and decompressor
/// context; none of them is shareable across threads.
pub fn deploy_resources(
    setup: &DeploySetup,
    resource_dir: &Path,
    tmp_dir: &Path,
    opts: &DeployOptions,
) -> Result<(u64, u64)> {
    let ft = FileTable::open(&setup.ft_db)?;
    let preparer = ResourcePreparer::new(resource_dir, tmp_dir)?;
    let sem = Semaphore::new(opts.concurrent.max(1));
    let latch = FailLatch::new();
    let (tx, rx) = mpsc::channel::<Sha256Digest>();
    let rx = Mutex::new(rx);

    let mut count: u64 = 0;
    let mut size: u64 = 0;

    thread::scope(|scope| {
        for _ in 0..opts.workers.max(1) {
            scope.spawn(|| resource_worker(setup, &preparer, &rx, &sem, &latch, opts.read_size));
        }

        let dispatch = ft.for_each_unique_resource(|digest, resource_size| {
            if latch.is_set() {
                return Ok(ControlFlow::Break(()));
            }
            count += 1;
            size += resource_size;
            sem.acquire();
            if tx.send(digest).is_err() {
                return Ok(ControlFlow::Break(()));
            }
            Ok(ControlFlow::Continue(()))
        });
        drop(tx);
        if let Err(e) = dispatch {
            latch.set(e);
        }
    });

    match latch.take() {
        Some(e) => Err(e),
        None => {
            info!(count, size, "resources staged");
            Ok((count, size))
        }
    }
}

fn resource_worker(
    setup: &DeploySetup,
    preparer: &ResourcePreparer,
    rx: &Mutex<mpsc::Receiver<Sha256Digest>>,
    sem: &Semaphore,
    latch: &FailLatch,
    read_size: usize,
) {
    let ctx = (|| -> Result<(ResourceTable, ImageReader)> {
        Ok((ResourceTable::open(&setup.rst_db)?, setup.source.open()?))
    })();
    let (rt, mut reader) = match ctx {
        Ok(ctx) => ctx,
        Err(e) => {
            latch.set(e);
            // drain the queue so the dispatcher never blocks on the semaphore
            while rx.lock().unwrap_or_else(|p| p.into_inner()).recv().is_ok() {
                sem.release();
            }
            return;
        }
    };
    let mut buf = vec![0u8; read_size.max(4096)];

    loop {
        let job = rx.lock().unwrap_or_else(|p| p.into_inner()).recv();
        let Ok(digest) = job else { break };
        let mut fetch =
            |info: &ResourceDownloadInfo| fetch_blob_from_image(&mut reader, &mut buf, info);
        let result = preparer.prepare(&rt, &digest, &mut fetch);
        sem.release();
        if let Err(e) = result {
            latch.set(e);
        }
    }
}

/// Fulfills one download-plan item from the image being deployed.
fn fetch_blob_from_image(
    reader: &mut ImageReader,
    buf: &mut [u8],
    info: &ResourceDownloadInfo,
) -> Result<()> {
    let parent = info
        .save_dst
        .parent()
        .ok_or_else(|| Error::NotFound(format!("{} has no parent", info.save_dst.display())))?;
    let tmp = parent.join(tmp_fname("fetch"));

    let copy = (|| -> Result<()> {
        let mut src = reader.open_blob(&info.digest)?;
        let mut out = BufWriter::new(fs::File::create(&tmp)?);
        match info.compression_alg.as_deref() {
            None => loop {
                let n = src.read(buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            },
            Some(ZSTD_COMPRESSION_ALG) => {
                // decompressor contexts live and die on this worker thread
                zstd::stream::copy_decode(&mut src, &mut out)?;
            }
            Some(other) => {
                return Err(Error::CompressedRecreateFailed {
                    digest: info.digest.hex(),
                    reason: format!("unknown compression alg: {other}"),
                });
            }
        }
        out.flush()?;
        Ok(())
    })();
    if let Err(e) = copy {
        fs::remove_file(&tmp).ok();
        return Err(e);
    }
    fs::rename(&tmp, &info.save_dst)?;
    Ok(())
}

/// One unit of regular-file work handed from the dispatcher to a worker.
struct RegularJob {
    entry: RegularEntry,
    first_to_prepare: bool,
}

/// Materializes a rootfs from a file table and a staged resource directory.
#[derive(Debug)]
pub struct RootfsDeployer {
    rootfs_dir: PathBuf,
    resource_dir: PathBuf,
    workers: usize,
    concurrent: usize,
}

impl RootfsDeployer {
    /// Creates a deployer writing into `rootfs_dir`.
    pub fn new(rootfs_dir: &Path, resource_dir: &Path, opts: &DeployOptions) -> Self {
        Self {
            rootfs_dir: rootfs_dir.to_path_buf(),
            resource_dir: resource_dir.to_path_buf(),
            workers: opts.workers.max(1),
            concurrent: opts.concurrent.max(1),
        }
    }

    /// Builds the rootfs. Phases in strict order: directories,
    /// non-regular files, then regular files concurrently.
    pub fn setup_rootfs(&self, ft: &FileTable) -> Result<()> {
        fs::create_dir_all(&self.rootfs_dir)?;
        self.process_dirs(ft)
            .and_then(|()| self.process_non_regular(ft))
            .and_then(|()| self.process_regular(ft))
            .map_err(|e| match e {
                already @ Error::SetupRootfsFailed(_) => already,
                other => Error::SetupRootfsFailed(Box::new(other)),
            })
    }

    fn process_dirs(&self, ft: &FileTable) -> Result<()> {
        info!("processing directory entries");
        ft.for_each_dir(|entry| {
            prepare_dir(&entry, &self.rootfs_dir)
                .map(drop)
                .map_err(|e| Error::prepare_entry(&entry.path, e))
        })
    }

    fn process_non_regular(&self, ft: &FileTable) -> Result<()> {
        info!("processing non-regular entries");
        ft.for_each_non_regular(|entry| {
            prepare_non_regular(&entry, &self.rootfs_dir)
                .map(drop)
                .map_err(|e| Error::prepare_entry(&entry.path, e))
        })
    }

    fn process_regular(&self, ft: &FileTable) -> Result<()> {
        info!("processing regular file entries");
        let sem = Semaphore::new(self.concurrent);
        let latch = FailLatch::new();
        let hardlink_group: Mutex<HashMap<i64, PathBuf>> = Mutex::new(HashMap::new());
        let (tx, rx) = mpsc::channel::<RegularJob>();
        let rx = Mutex::new(rx);

        let rootfs_dir = self.rootfs_dir.as_path();
        let resource_dir = self.resource_dir.as_path();
        let mut first_prepared: HashSet<[u8; 32]> = HashSet::new();

        thread::scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(|| loop {
                    let job = rx.lock().unwrap_or_else(|p| p.into_inner()).recv();
                    let Ok(job) = job else { break };
                    let result =
                        run_regular_entry(rootfs_dir, resource_dir, &job, &hardlink_group);
                    sem.release();
                    if let Err(e) = result {
                        latch.set(Error::prepare_entry(&job.entry.path, e));
                    }
                });
            }

            let dispatch = ft.for_each_regular(|entry| {
                if latch.is_set() {
                    return Ok(ControlFlow::Break(()));
                }
                // The first-to-prepare decision happens here, under the
                // single dispatcher thread, before the entry is handed
                // to a worker; workers never race on it.
                let first_to_prepare = first_prepared.insert(*entry.digest.as_bytes());
                sem.acquire();
                if tx
                    .send(RegularJob {
                        entry,
                        first_to_prepare,
                    })
                    .is_err()
                {
                    return Ok(ControlFlow::Break(()));
                }
                Ok(ControlFlow::Continue(()))
            });
            drop(tx);
            if let Err(e) = dispatch {
                latch.set(e);
            }
        });

        match latch.take() {
            Some(e) => Err(Error::SetupRootfsFailed(Box::new(e))),
            None => Ok(()),
        }
    }
}

/// Materializes one regular-file entry.
///
/// The resource blob is consumed by the first hardlink made to it: its
/// permissions become authoritative at that moment, so every later
/// non-group entry of the same digest must copy instead of link.
fn run_regular_entry(
    rootfs_dir: &Path,
    resource_dir: &Path,
    job: &RegularJob,
    hardlink_group: &Mutex<HashMap<i64, PathBuf>>,
) -> Result<()> {
    let entry = &job.entry;
    let resource = resource_dir.join(entry.digest.hex());

    if entry.links_count.is_some_and(|links| links > 1) {
        let mut groups = hardlink_group.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(head) = groups.get(&entry.inode_id) {
            // group tail: link to the head, whose inode is already fixed up
            prepare_regular_hardlink(entry, head, rootfs_dir, true)?;
            return Ok(());
        }
        let head = if entry.is_inlined() {
            prepare_regular_inlined(entry, rootfs_dir)?
        } else if job.first_to_prepare {
            prepare_regular_hardlink(entry, &resource, rootfs_dir, false)?
        } else {
            prepare_regular_copy(entry, &resource, rootfs_dir)?
        };
        groups.insert(entry.inode_id, head);
        return Ok(());
    }

    if entry.is_inlined() {
        prepare_regular_inlined(entry, rootfs_dir).map(drop)
    } else if job.first_to_prepare {
        prepare_regular_hardlink(entry, &resource, rootfs_dir, false).map(drop)
    } else {
        prepare_regular_copy(entry, &resource, rootfs_dir).map(drop)
    }
}
