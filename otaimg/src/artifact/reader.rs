//! Reading images, either from an artifact ZIP or an extracted directory.
//!
//! An [`ArtifactReader`] opens blobs through ZIP random access without
//! extracting to disk. It is not safe to share across threads; a worker
//! pool holds one open reader per thread.

use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::consts::{IMAGE_INDEX_FNAME, INDEX_JWT_FNAME, RESOURCE_DIR};
use crate::layout::ImageDir;
use crate::meta::{media_types, ImageIndex, Metafile as _};
use crate::{Error, Result, Sha256Digest};

/// Reader over an artifact ZIP.
pub struct ArtifactReader {
    archive: zip::ZipArchive<fs::File>,
}

impl std::fmt::Debug for ArtifactReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactReader").finish_non_exhaustive()
    }
}

impl ArtifactReader {
    /// Opens an artifact ZIP.
    pub fn open(path: &Path) -> Result<Self> {
        let archive = zip::ZipArchive::new(fs::File::open(path)?)?;
        Ok(Self { archive })
    }

    /// Checks validity by the presence of an openable `index.json`.
    pub fn is_valid_image(&mut self) -> bool {
        self.archive.by_name(IMAGE_INDEX_FNAME).is_ok()
    }

    /// Reads and parses the image index.
    pub fn parse_index(&mut self) -> Result<ImageIndex> {
        ImageIndex::parse(&self.index_bytes()?)
    }

    /// Reads the raw `index.json` bytes.
    pub fn index_bytes(&mut self) -> Result<Vec<u8>> {
        let mut member = self
            .archive
            .by_name(IMAGE_INDEX_FNAME)
            .map_err(|_| Error::NotFound(format!("{IMAGE_INDEX_FNAME} in artifact")))?;
        let mut buf = Vec::with_capacity(member.size() as usize);
        member.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Reads the raw `index.jwt`, or `None` if the image is unsigned.
    pub fn jwt_raw(&mut self) -> Result<Option<String>> {
        match self.archive.by_name(INDEX_JWT_FNAME) {
            Ok(mut member) => {
                let mut buf = String::new();
                member.read_to_string(&mut buf)?;
                Ok(Some(buf))
            }
            Err(_) => Ok(None),
        }
    }

    /// Opens a blob for streaming; `NotFound` if the member is absent.
    pub fn open_blob(&mut self, digest: &Sha256Digest) -> Result<impl Read + '_> {
        let member_name = format!("{RESOURCE_DIR}/{}", digest.hex());
        self.archive
            .by_name(&member_name)
            .map_err(|_| Error::NotFound(format!("blob {digest} in artifact")))
    }

    /// Reads a whole blob into memory.
    pub fn read_blob(&mut self, digest: &Sha256Digest) -> Result<Vec<u8>> {
        let mut reader = self.open_blob(digest)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Lists every blob digest present in the artifact.
    pub fn list_blobs(&self) -> Vec<Sha256Digest> {
        let prefix = format!("{RESOURCE_DIR}/");
        self.archive
            .file_names()
            .filter_map(|name| name.strip_prefix(&prefix))
            .filter_map(|hex_name| Sha256Digest::from_hex(hex_name).ok())
            .collect()
    }
}

/// Reader over an extracted image directory.
#[derive(Debug)]
pub struct DirReader {
    layout: ImageDir,
}

impl DirReader {
    /// Opens a directory-form image.
    pub fn open(root: &Path) -> Result<Self> {
        Ok(Self {
            layout: ImageDir::open(root)?,
        })
    }

    fn blob_path(&self, digest: &Sha256Digest) -> Result<PathBuf> {
        let path = self.layout.resource_dir().join(digest.hex());
        if !path.is_file() {
            return Err(Error::NotFound(format!("blob {digest} in image directory")));
        }
        Ok(path)
    }
}

/// Where an image lives on disk: extracted directory or artifact ZIP.
///
/// Cheap to clone; `open` creates an independent reader, which is how a
/// worker pool gets its one-reader-per-thread instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ImageSource {
    /// An extracted image directory.
    Dir(PathBuf),
    /// A packed artifact ZIP.
    Artifact(PathBuf),
}

impl ImageSource {
    /// Selects the image form automatically from the path type.
    pub fn detect(path: &Path) -> Result<Self> {
        if path.is_dir() {
            Ok(Self::Dir(path.to_path_buf()))
        } else if path.is_file() {
            Ok(Self::Artifact(path.to_path_buf()))
        } else {
            Err(Error::NotFound(format!(
                "{} is neither an image directory nor an artifact",
                path.display()
            )))
        }
    }

    /// Opens a fresh reader over this source.
    pub fn open(&self) -> Result<ImageReader> {
        match self {
            Self::Dir(root) => Ok(ImageReader::Dir(DirReader::open(root)?)),
            Self::Artifact(path) => Ok(ImageReader::Artifact(ArtifactReader::open(path)?)),
        }
    }
}

/// A reader over either image form.
#[derive(Debug)]
#[non_exhaustive]
pub enum ImageReader {
    /// Directory-form image.
    Dir(DirReader),
    /// Artifact-form image.
    Artifact(ArtifactReader),
}

impl ImageReader {
    /// Reads the raw `index.json` bytes.
    pub fn index_bytes(&mut self) -> Result<Vec<u8>> {
        match self {
            Self::Dir(r) => Ok(fs::read(r.layout.index_path())?),
            Self::Artifact(r) => r.index_bytes(),
        }
    }

    /// Reads and parses the image index.
    pub fn parse_index(&mut self) -> Result<ImageIndex> {
        ImageIndex::parse(&self.index_bytes()?)
    }

    /// Reads the raw `index.jwt`, or `None` if the image is unsigned.
    pub fn jwt_raw(&mut self) -> Result<Option<String>> {
        match self {
            Self::Dir(r) => {
                let path = r.layout.jwt_path();
                if path.is_file() {
                    Ok(Some(fs::read_to_string(path)?))
                } else {
                    Ok(None)
                }
            }
            Self::Artifact(r) => r.jwt_raw(),
        }
    }

    /// Opens a blob for streaming reads.
    pub fn open_blob(&mut self, digest: &Sha256Digest) -> Result<Box<dyn Read + '_>> {
        match self {
            Self::Dir(r) => Ok(Box::new(fs::File::open(r.blob_path(digest)?)?)),
            Self::Artifact(r) => Ok(Box::new(r.open_blob(digest)?)),
        }
    }

    /// Reads a whole blob into memory.
    pub fn read_blob(&mut self, digest: &Sha256Digest) -> Result<Vec<u8>> {
        let mut reader = self.open_blob(digest)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Lists every blob digest the image holds.
    ///
    /// In directory form, files in the blob directory whose names are
    /// not a valid digest are reported via a warning and skipped.
    pub fn list_blobs(&mut self) -> Result<Vec<Sha256Digest>> {
        match self {
            Self::Dir(r) => {
                let mut digests = Vec::new();
                for entry in fs::read_dir(r.layout.resource_dir())? {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    match Sha256Digest::from_hex(&name) {
                        Ok(digest) => digests.push(digest),
                        Err(_) => {
                            tracing::warn!(file = %name, "not-a-blob file in resource directory");
                        }
                    }
                }
                Ok(digests)
            }
            Self::Artifact(r) => Ok(r.list_blobs()),
        }
    }

    /// Streams a blob to `dst`, optionally decompressing `+zstd` blobs.
    pub fn export_blob(
        &mut self,
        digest: &Sha256Digest,
        media_type: &str,
        dst: &Path,
        auto_decompress: bool,
    ) -> Result<()> {
        let mut src = self.open_blob(digest)?;
        let mut out = BufWriter::new(fs::File::create(dst)?);
        if auto_decompress && media_types::is_zstd(media_type) {
            zstd::stream::copy_decode(&mut src, &mut out)?;
        } else {
            io::copy(&mut src, &mut out)?;
        }
        out.flush()?;
        Ok(())
    }
}
