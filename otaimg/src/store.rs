//! Content-addressed blob storage.
//!
//! A single flat directory where every file is named by the lowercase hex
//! SHA-256 of its own content. Blobs are written through a
//! write-to-temp-then-rename ceremony so partial blobs are never visible;
//! concurrent writers of the same digest are safe by rename idempotence.

use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::digest::{file_sha256, HashingWriter, Sha256Digest, HASH_READ_SIZE};
use crate::meta::media_types;
use crate::util::tmp_fname;
use crate::{Error, Result};

/// Zstd compression level used when a media type requests compression.
const ZSTD_LEVEL: i32 = 3;

/// Manages a flat content-addressed blob directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Opens (or creates) the blob directory.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Wraps an existing blob directory without creating it.
    pub fn at(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Returns the directory this store lives in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the filesystem path a blob with `digest` would occupy.
    pub fn blob_path(&self, digest: &Sha256Digest) -> PathBuf {
        self.root.join(digest.hex())
    }

    /// Returns `true` if a blob with the given digest exists.
    pub fn contains(&self, digest: &Sha256Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Returns the path of an existing blob, or `NotFound`.
    pub fn get(&self, digest: &Sha256Digest) -> Result<PathBuf> {
        let path = self.blob_path(digest);
        if !path.is_file() {
            return Err(Error::NotFound(format!("blob {digest}")));
        }
        Ok(path)
    }

    /// Adds a byte slice as a blob, returning its digest and stored size.
    ///
    /// Re-adding identical content is a no-op.
    pub fn put_bytes(&self, contents: &[u8]) -> Result<(Sha256Digest, u64)> {
        let digest = Sha256Digest::of(contents);
        let dst = self.blob_path(&digest);
        if dst.is_file() {
            return Ok((digest, contents.len() as u64));
        }
        let tmp = self.root.join(tmp_fname("blob"));
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &dst)?;
        Ok((digest, contents.len() as u64))
    }

    /// Streams a file into the store, returning the digest and stored size.
    ///
    /// If `media_type` carries a `+zstd` suffix the stream passes through a
    /// zstd compressor (checksum and content-size frames enabled) and the
    /// returned digest names the *compressed* bytes as written to disk.
    pub fn put_file(
        &self,
        src: &Path,
        media_type: &str,
        remove_origin: bool,
    ) -> Result<(Sha256Digest, u64)> {
        let tmp = self.root.join(tmp_fname("blob"));
        let result = self.put_file_inner(src, media_type, &tmp);
        if result.is_err() {
            fs::remove_file(&tmp).ok();
        }
        let (digest, size) = result?;
        if remove_origin {
            fs::remove_file(src).ok();
        }
        Ok((digest, size))
    }

    fn put_file_inner(
        &self,
        src: &Path,
        media_type: &str,
        tmp: &Path,
    ) -> Result<(Sha256Digest, u64)> {
        let src_size = fs::metadata(src)?.len();
        let mut reader = BufReader::with_capacity(HASH_READ_SIZE, fs::File::open(src)?);
        let out = HashingWriter::new(BufWriter::new(fs::File::create(tmp)?));

        let (digest, written) = if media_types::is_zstd(media_type) {
            let mut encoder = zstd::stream::write::Encoder::new(out, ZSTD_LEVEL)?;
            encoder.include_checksum(true)?;
            encoder.include_contentsize(true)?;
            encoder.set_pledged_src_size(Some(src_size))?;
            io::copy(&mut reader, &mut encoder)?;
            let mut out = encoder.finish()?;
            out.flush()?;
            out.finish()
        } else {
            let mut out = out;
            io::copy(&mut reader, &mut out)?;
            out.flush()?;
            let (digest, written) = out.finish();
            if written != src_size {
                warn!(written, src_size, "stored size differs from source size");
            }
            (digest, written)
        };

        fs::rename(tmp, self.blob_path(&digest))?;
        Ok((digest, written))
    }

    /// Reads a whole blob into memory.
    ///
    /// For large blobs prefer [`Self::open_blob`].
    pub fn read(&self, digest: &Sha256Digest) -> Result<Vec<u8>> {
        Ok(fs::read(self.get(digest)?)?)
    }

    /// Opens a blob for streaming reads.
    pub fn open_blob(&self, digest: &Sha256Digest) -> Result<fs::File> {
        Ok(fs::File::open(self.get(digest)?)?)
    }

    /// Copies a blob out of the store.
    ///
    /// With `auto_decompress` set and a `+zstd` media type, the blob is
    /// streamed through a zstd decompressor; otherwise it is copied as-is.
    pub fn export(
        &self,
        digest: &Sha256Digest,
        media_type: &str,
        dst: &Path,
        auto_decompress: bool,
    ) -> Result<PathBuf> {
        let src = self.get(digest)?;
        if auto_decompress && media_types::is_zstd(media_type) {
            let reader = BufReader::with_capacity(HASH_READ_SIZE, fs::File::open(&src)?);
            let mut writer = BufWriter::new(fs::File::create(dst)?);
            zstd::stream::copy_decode(reader, &mut writer)?;
            writer.flush()?;
        } else {
            fs::copy(&src, dst)?;
        }
        Ok(dst.to_path_buf())
    }

    /// Removes a blob; absence is tolerated silently.
    pub fn remove(&self, digest: &Sha256Digest) -> Result<()> {
        match fs::remove_file(self.blob_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Verifies that a stored blob hashes to its own name.
    pub fn verify(&self, digest: &Sha256Digest) -> Result<()> {
        let actual = file_sha256(&self.get(digest)?)?;
        if actual != *digest {
            return Err(Error::BadDigest {
                expected: digest.hex(),
                actual: actual.hex(),
            });
        }
        Ok(())
    }

    /// Copies a stream into the store under a declared digest, verifying it.
    pub fn put_stream(&self, digest: &Sha256Digest, reader: impl Read) -> Result<u64> {
        let dst = self.blob_path(digest);
        if dst.is_file() {
            return Ok(fs::metadata(&dst)?.len());
        }
        let tmp = self.root.join(tmp_fname("blob"));
        let mut out = HashingWriter::new(BufWriter::new(fs::File::create(&tmp)?));
        let mut reader = BufReader::with_capacity(HASH_READ_SIZE, reader);
        let copied = io::copy(&mut reader, &mut out);
        let flushed = copied.and_then(|_| out.flush().map(|()| ()));
        if let Err(e) = flushed {
            fs::remove_file(&tmp).ok();
            return Err(e.into());
        }
        let (actual, written) = out.finish();
        if actual != *digest {
            fs::remove_file(&tmp).ok();
            return Err(Error::BadDigest {
                expected: digest.hex(),
                actual: actual.hex(),
            });
        }
        fs::rename(&tmp, &dst)?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_bytes_names_blob_by_digest() {
        let (_dir, store) = store();
        let (digest, size) = store.put_bytes(b"abc").unwrap();
        assert_eq!(size, 3);
        assert_eq!(store.read(&digest).unwrap(), b"abc");
        assert_eq!(file_sha256(&store.blob_path(&digest)).unwrap(), digest);
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = store();
        let (d1, _) = store.put_bytes(b"same").unwrap();
        let (d2, _) = store.put_bytes(b"same").unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn put_file_zstd_roundtrips_through_export() {
        let (_dir, store) = store();
        let work = tempfile::tempdir().unwrap();
        let src = work.path().join("payload");
        let payload = vec![0x58u8; 100_000];
        fs::write(&src, &payload).unwrap();

        let (digest, size) = store
            .put_file(&src, "application/vnd.example.table.v1.sqlite3+zstd", false)
            .unwrap();
        // the blob on disk is the compressed form
        assert!(size < payload.len() as u64);
        store.verify(&digest).unwrap();

        let out = work.path().join("restored");
        store
            .export(
                &digest,
                "application/vnd.example.table.v1.sqlite3+zstd",
                &out,
                true,
            )
            .unwrap();
        assert_eq!(fs::read(&out).unwrap(), payload);
    }

    #[test]
    fn put_stream_rejects_digest_mismatch() {
        let (_dir, store) = store();
        let wrong = Sha256Digest::of(b"something else");
        let err = store.put_stream(&wrong, &b"actual bytes"[..]).unwrap_err();
        assert!(matches!(err, Error::BadDigest { .. }));
        assert!(!store.contains(&wrong));
    }

    #[test]
    fn get_missing_blob_is_not_found() {
        let (_dir, store) = store();
        let missing = Sha256Digest::of(b"missing");
        assert!(matches!(store.get(&missing), Err(Error::NotFound(_))));
        // removal of an absent blob is silent
        store.remove(&missing).unwrap();
    }
}
