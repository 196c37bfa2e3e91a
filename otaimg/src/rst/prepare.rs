//! The resource reconstruction engine.
//!
//! Turns a target digest into bytes in the resource directory,
//! recursively fetching or rebuilding filtered ancestors. The engine is
//! transport-agnostic: it emits [`ResourceDownloadInfo`] items through a
//! caller-supplied fetch callback, and the caller obtains the named raw
//! blobs however it likes (artifact member, local directory, network).

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter, Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest as _, Sha256};
use tracing::{debug, warn};

use crate::consts::ZSTD_COMPRESSION_ALG;
use crate::digest::file_sha256;
use crate::filters::ResourceFilter;
use crate::rst::{ResourceRow, ResourceTable};
use crate::util::tmp_fname;
use crate::{Error, Result, Sha256Digest};

/// Hard cap on filter-graph recursion depth.
pub const MAX_FILTER_DEPTH: u32 = 6;

/// Retry iterations while waiting on another worker's bundle build.
const BUNDLE_WAIT_ITERS: u32 = 6;

/// Sleep between bundle readiness re-checks.
const BUNDLE_WAIT_INTERVAL: Duration = Duration::from_secs(3);

/// Attempts at extracting from a prepared bundle before giving up.
const BUNDLE_EXTRACT_ATTEMPTS: u32 = 2;

/// One item of a download plan.
///
/// The caller MUST fulfill the item by streaming the blob named by
/// `digest` into `save_dst`. When `compression_alg` is set the blob must
/// be decompressed on the fly; `compressed_origin_*` then describe the
/// logical resource the decompression produces.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ResourceDownloadInfo {
    /// Digest of the raw blob to fetch.
    pub digest: Sha256Digest,
    /// Size of the raw blob.
    pub size: u64,
    /// Where the (possibly decompressed) bytes must land.
    pub save_dst: PathBuf,
    /// Streaming decompression requested from the caller.
    pub compression_alg: Option<String>,
    /// Digest of the decompressed resource, when `compression_alg` is set.
    pub compressed_origin_digest: Option<Sha256Digest>,
    /// Size of the decompressed resource, when `compression_alg` is set.
    pub compressed_origin_size: Option<u64>,
}

impl ResourceDownloadInfo {
    fn leaf(digest: Sha256Digest, size: u64, save_dst: PathBuf) -> Self {
        Self {
            digest,
            size,
            save_dst,
            compression_alg: None,
            compressed_origin_digest: None,
            compressed_origin_size: None,
        }
    }
}

/// Per-bundle coordination: a build lock plus a revision-counted ready flag.
#[derive(Debug, Default)]
struct BundleState {
    build_lock: Mutex<()>,
    ready: Mutex<ReadyFlag>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReadyFlag {
    ready: bool,
    revision: u64,
}

/// Rebuilds target digests into a resource directory.
///
/// Safe to share across worker threads; each thread brings its own
/// [`ResourceTable`] connection and fetch callback.
#[derive(Debug)]
pub struct ResourcePreparer {
    resource_dir: PathBuf,
    download_dir: PathBuf,
    bundles: Mutex<HashMap<i64, Arc<BundleState>>>,
}

impl ResourcePreparer {
    /// Creates a preparer writing results into `resource_dir` and staging
    /// intermediates (bundles, slices) into `download_dir`.
    pub fn new(resource_dir: &Path, download_dir: &Path) -> Result<Self> {
        fs::create_dir_all(resource_dir)?;
        fs::create_dir_all(download_dir)?;
        Ok(Self {
            resource_dir: resource_dir.to_path_buf(),
            download_dir: download_dir.to_path_buf(),
            bundles: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the resource directory results land in.
    pub fn resource_dir(&self) -> &Path {
        &self.resource_dir
    }

    /// Materializes `digest` into the resource directory.
    ///
    /// Re-running for an already-materialized digest is a no-op. Fails
    /// with `NotInResourceTable` when the digest has no row.
    pub fn prepare<F>(
        &self,
        rt: &ResourceTable,
        digest: &Sha256Digest,
        fetch: &mut F,
    ) -> Result<PathBuf>
    where
        F: FnMut(&ResourceDownloadInfo) -> Result<()>,
    {
        let dst = self.resource_dir.join(digest.hex());
        if dst.is_file() {
            return Ok(dst);
        }
        let entry = rt
            .get_by_digest(digest)?
            .ok_or_else(|| Error::NotInResourceTable(digest.to_string()))?;
        self.prepare_entry(rt, &entry, &dst, fetch, 0)?;
        Ok(dst)
    }

    fn prepare_entry<F>(
        &self,
        rt: &ResourceTable,
        entry: &ResourceRow,
        dst: &Path,
        fetch: &mut F,
        depth: u32,
    ) -> Result<()>
    where
        F: FnMut(&ResourceDownloadInfo) -> Result<()>,
    {
        if depth > MAX_FILTER_DEPTH {
            return Err(Error::FilterTooDeep(entry.digest.to_string()));
        }
        if dst.is_file() {
            return Ok(());
        }
        match entry.filter.clone() {
            None => fetch(&ResourceDownloadInfo::leaf(
                entry.digest,
                entry.size,
                dst.to_path_buf(),
            )),
            Some(ResourceFilter::Slice { slices }) => {
                self.prepare_sliced(rt, entry, &slices, dst, fetch)
            }
            Some(ResourceFilter::Compress {
                resource_id,
                compression_alg,
            }) => self.prepare_compressed(rt, entry, resource_id, &compression_alg, dst, fetch, depth),
            Some(ResourceFilter::Bundle {
                bundle_resource_id,
                offset,
                len,
            }) => self.prepare_bundled(rt, entry, bundle_resource_id, offset, len, dst, fetch, depth),
        }
    }

    /// Reconstitutes a sliced resource by appending its leaves in order.
    ///
    /// Slice files carry the consuming resource id as a filename suffix:
    /// the same slice leaf may feed multiple derived resources at once.
    fn prepare_sliced<F>(
        &self,
        rt: &ResourceTable,
        entry: &ResourceRow,
        slices: &[i64],
        dst: &Path,
        fetch: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&ResourceDownloadInfo) -> Result<()>,
    {
        let failed = |reason: String| Error::SlicedRecreateFailed {
            digest: entry.digest.hex(),
            reason,
        };

        let mut slice_paths = Vec::with_capacity(slices.len());
        for slice_id in slices {
            let row = rt
                .get_by_id(*slice_id)?
                .ok_or_else(|| Error::NotInResourceTable(format!("resource id {slice_id}")))?;
            if !row.is_leaf() {
                return Err(failed(format!("slice referent {slice_id} is not a leaf")));
            }
            let slice_path = self
                .download_dir
                .join(format!("{}_{}", row.digest.hex(), entry.resource_id));
            if !slice_path.is_file() {
                fetch(&ResourceDownloadInfo::leaf(row.digest, row.size, slice_path.clone()))?;
            }
            slice_paths.push(slice_path);
        }

        let parent = dst.parent().unwrap_or(&self.download_dir);
        let tmp = parent.join(tmp_fname(&entry.resource_id.to_string()));
        let concat = (|| -> Result<()> {
            let mut out = BufWriter::new(fs::File::create(&tmp)?);
            for slice_path in &slice_paths {
                let mut reader = BufReader::new(fs::File::open(slice_path)?);
                std::io::copy(&mut reader, &mut out)?;
            }
            out.flush()?;
            Ok(())
        })();
        if let Err(e) = concat {
            fs::remove_file(&tmp).ok();
            return Err(failed(e.to_string()));
        }
        fs::rename(&tmp, dst)?;
        Ok(())
    }

    /// Rebuilds a compressed resource.
    ///
    /// A compressed leaf is delegated to the caller as a streamed
    /// decompression; a compressed derived resource (typically sliced)
    /// is first reconstructed to disk, then decompressed here.
    #[allow(clippy::too_many_arguments)]
    fn prepare_compressed<F>(
        &self,
        rt: &ResourceTable,
        entry: &ResourceRow,
        resource_id: i64,
        compression_alg: &str,
        dst: &Path,
        fetch: &mut F,
        depth: u32,
    ) -> Result<()>
    where
        F: FnMut(&ResourceDownloadInfo) -> Result<()>,
    {
        let failed = |reason: String| Error::CompressedRecreateFailed {
            digest: entry.digest.hex(),
            reason,
        };
        if compression_alg != ZSTD_COMPRESSION_ALG {
            return Err(failed(format!("unknown compression alg: {compression_alg}")));
        }
        let inner = rt
            .get_by_id(resource_id)?
            .ok_or_else(|| Error::NotInResourceTable(format!("resource id {resource_id}")))?;

        if inner.is_leaf() {
            return fetch(&ResourceDownloadInfo {
                digest: inner.digest,
                size: inner.size,
                save_dst: dst.to_path_buf(),
                compression_alg: Some(ZSTD_COMPRESSION_ALG.to_owned()),
                compressed_origin_digest: Some(entry.digest),
                compressed_origin_size: Some(entry.size),
            });
        }

        let inner_path = self.download_dir.join(inner.digest.hex());
        self.prepare_entry(rt, &inner, &inner_path, fetch, depth + 1)?;

        let parent = dst.parent().unwrap_or(&self.download_dir);
        let tmp = parent.join(tmp_fname(&entry.resource_id.to_string()));
        let decompress = (|| -> Result<()> {
            let reader = BufReader::new(fs::File::open(&inner_path)?);
            let mut out = BufWriter::new(fs::File::create(&tmp)?);
            zstd::stream::copy_decode(reader, &mut out)?;
            out.flush()?;
            Ok(())
        })();
        if let Err(e) = decompress {
            fs::remove_file(&tmp).ok();
            return Err(failed(e.to_string()));
        }
        fs::rename(&tmp, dst)?;
        Ok(())
    }

    /// Extracts a byte window of a bundle, with at-most-one concurrent
    /// bundle build across the worker fleet.
    #[allow(clippy::too_many_arguments)]
    fn prepare_bundled<F>(
        &self,
        rt: &ResourceTable,
        entry: &ResourceRow,
        bundle_resource_id: i64,
        offset: u64,
        len: u64,
        dst: &Path,
        fetch: &mut F,
        depth: u32,
    ) -> Result<()>
    where
        F: FnMut(&ResourceDownloadInfo) -> Result<()>,
    {
        let bundle_row = rt
            .get_by_id(bundle_resource_id)?
            .ok_or_else(|| Error::NotInResourceTable(format!("resource id {bundle_resource_id}")))?;
        let bundle_path = self.download_dir.join(bundle_row.digest.hex());
        let state = self.bundle_state(bundle_resource_id);

        let mut wait_iters: u32 = 0;
        let mut extract_attempts: u32 = 0;
        loop {
            let seen = *state.ready.lock().unwrap_or_else(|e| e.into_inner());
            if seen.ready {
                match self.extract_bundle_range(entry, &bundle_path, offset, len, dst) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        extract_attempts += 1;
                        warn!(
                            bundle = bundle_resource_id,
                            attempt = extract_attempts,
                            "bundle extraction failed: {e}"
                        );
                        // Only clear readiness if no newer build advanced
                        // the revision; a later successful re-preparation
                        // must not be thrown away.
                        let mut flag = state.ready.lock().unwrap_or_else(|p| p.into_inner());
                        if flag.revision == seen.revision {
                            flag.ready = false;
                        }
                        drop(flag);
                        if extract_attempts >= BUNDLE_EXTRACT_ATTEMPTS {
                            return Err(Error::BundledRecreateFailed {
                                digest: entry.digest.hex(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            } else if let Ok(_guard) = state.build_lock.try_lock() {
                self.materialize_bundle(rt, &bundle_row, &bundle_path, fetch, depth)?;
                let mut flag = state.ready.lock().unwrap_or_else(|p| p.into_inner());
                flag.ready = true;
                flag.revision += 1;
            } else {
                wait_iters += 1;
                if wait_iters >= BUNDLE_WAIT_ITERS {
                    return Err(Error::BundleTimeout(bundle_resource_id));
                }
                std::thread::sleep(BUNDLE_WAIT_INTERVAL);
            }
        }
    }

    /// Puts the bundle blob on disk, verified by hash.
    ///
    /// A bundle already on disk is reused only after re-hashing it.
    fn materialize_bundle<F>(
        &self,
        rt: &ResourceTable,
        bundle_row: &ResourceRow,
        bundle_path: &Path,
        fetch: &mut F,
        depth: u32,
    ) -> Result<()>
    where
        F: FnMut(&ResourceDownloadInfo) -> Result<()>,
    {
        if bundle_path.is_file() {
            if file_sha256(bundle_path)? == bundle_row.digest {
                debug!(bundle = bundle_row.resource_id, "reusing on-disk bundle");
                return Ok(());
            }
            fs::remove_file(bundle_path)?;
        }

        if bundle_row.is_leaf() {
            let tmp = self.download_dir.join(tmp_fname("bundle"));
            let fetched = fetch(&ResourceDownloadInfo::leaf(
                bundle_row.digest,
                bundle_row.size,
                tmp.clone(),
            ))
            .and_then(|()| {
                let actual = file_sha256(&tmp)?;
                if actual != bundle_row.digest {
                    return Err(Error::BadDigest {
                        expected: bundle_row.digest.hex(),
                        actual: actual.hex(),
                    });
                }
                Ok(())
            });
            if let Err(e) = fetched {
                fs::remove_file(&tmp).ok();
                return Err(e);
            }
            fs::rename(&tmp, bundle_path)?;
            Ok(())
        } else {
            self.prepare_entry(rt, bundle_row, bundle_path, fetch, depth + 1)
        }
    }

    /// Copies `[offset, offset + len)` of the bundle into `dst`, verifying
    /// that the extracted window hashes to the entry digest.
    fn extract_bundle_range(
        &self,
        entry: &ResourceRow,
        bundle_path: &Path,
        offset: u64,
        len: u64,
        dst: &Path,
    ) -> Result<()> {
        let parent = dst.parent().unwrap_or(&self.download_dir);
        let tmp = parent.join(tmp_fname(&entry.resource_id.to_string()));
        let extract = (|| -> Result<()> {
            let mut src = fs::File::open(bundle_path)?;
            src.seek(SeekFrom::Start(offset))?;
            let mut reader = BufReader::new(src).take(len);
            let mut hasher = Sha256::new();
            let mut out = BufWriter::new(fs::File::create(&tmp)?);
            let mut buf = vec![0u8; 64 * 1024];
            let mut copied: u64 = 0;
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n])?;
                copied += n as u64;
            }
            out.flush()?;
            if copied != len {
                return Err(Error::BadDigest {
                    expected: format!("{len} bytes at offset {offset}"),
                    actual: format!("{copied} bytes before bundle end"),
                });
            }
            let actual = Sha256Digest::new(hasher.finalize().into());
            if actual != entry.digest {
                return Err(Error::BadDigest {
                    expected: entry.digest.hex(),
                    actual: actual.hex(),
                });
            }
            Ok(())
        })();
        if let Err(e) = extract {
            fs::remove_file(&tmp).ok();
            return Err(e);
        }
        fs::rename(&tmp, dst)?;
        Ok(())
    }

    fn bundle_state(&self, bundle_resource_id: i64) -> Arc<BundleState> {
        let mut registry = self.bundles.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(registry.entry(bundle_resource_id).or_default())
    }
}

/// Outcome of a staging-directory scan.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct ScanReport {
    /// Files retained as valid partial results.
    pub kept: u64,
    /// Files removed as garbage.
    pub removed: u64,
}

/// Inspects an interrupted run's staging directory.
///
/// Removes `tmp*` leftovers, files whose names are not a valid digest
/// (optionally suffixed `_<resource-id>`), files whose resource id no
/// longer exists, and files whose bytes do not hash to their name. Good
/// partials are retained for reuse.
pub fn scan_download_dir(rt: &ResourceTable, dir: &Path) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }
        let path = dir_entry.path();
        let name = dir_entry.file_name().to_string_lossy().into_owned();

        let keep = scan_one(rt, &path, &name)?;
        if keep {
            report.kept += 1;
        } else {
            debug!(file = %path.display(), "removing stale staging file");
            fs::remove_file(&path)?;
            report.removed += 1;
        }
    }
    Ok(report)
}

fn scan_one(rt: &ResourceTable, path: &Path, name: &str) -> Result<bool> {
    if name.starts_with("tmp") {
        return Ok(false);
    }
    let (hex_part, id_part) = match name.split_once('_') {
        Some((hex_part, id_part)) => (hex_part, Some(id_part)),
        None => (name, None),
    };
    if hex_part.bytes().any(|b| b.is_ascii_uppercase()) {
        return Ok(false);
    }
    let Ok(digest) = Sha256Digest::from_hex(hex_part) else {
        return Ok(false);
    };
    if let Some(id_part) = id_part {
        let Ok(resource_id) = id_part.parse::<i64>() else {
            return Ok(false);
        };
        if !rt.contains_id(resource_id)? {
            return Ok(false);
        }
    }
    Ok(file_sha256(path)? == digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_keeps_good_partials_and_drops_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        let rt = ResourceTable::create(&db.path().join("rst.sqlite3")).unwrap();

        let good = Sha256Digest::of(b"good");
        let id = rt.insert(&good, 4, None, None).unwrap();

        // valid leaf partial
        fs::write(dir.path().join(good.hex()), b"good").unwrap();
        // valid slice partial referencing a live resource id
        fs::write(dir.path().join(format!("{}_{id}", good.hex())), b"good").unwrap();
        // slice partial referencing a dead resource id
        fs::write(dir.path().join(format!("{}_9999", good.hex())), b"good").unwrap();
        // corrupt partial: name does not match content
        fs::write(dir.path().join(Sha256Digest::of(b"other").hex()), b"good").unwrap();
        // tmp leftovers and junk names
        fs::write(dir.path().join("tmp_bundle_0badcafe"), b"x").unwrap();
        fs::write(dir.path().join("README"), b"x").unwrap();

        let report = scan_download_dir(&rt, dir.path()).unwrap();
        assert_eq!(report.kept, 2);
        assert_eq!(report.removed, 4);
        assert!(dir.path().join(good.hex()).is_file());
        assert!(dir.path().join(format!("{}_{id}", good.hex())).is_file());
    }

    #[test]
    fn prepare_unknown_digest_fails() {
        let dirs = tempfile::tempdir().unwrap();
        let rt = ResourceTable::create(&dirs.path().join("rst.sqlite3")).unwrap();
        let preparer =
            ResourcePreparer::new(&dirs.path().join("rs"), &dirs.path().join("dl")).unwrap();
        let err = preparer
            .prepare(&rt, &Sha256Digest::of(b"nope"), &mut |_info| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::NotInResourceTable(_)));
    }
}
