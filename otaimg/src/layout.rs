//! Directory-form image layout: `oci-layout`, `index.json`, `blobs/sha256/`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::error;

use crate::consts::{
    IMAGE_INDEX_FNAME, INDEX_JWT_FNAME, OCI_LAYOUT_CONTENT, OCI_LAYOUT_FNAME, RESOURCE_DIR,
};
use crate::meta::{Descriptor, ImageIndex, Metafile as _};
use crate::store::BlobStore;
use crate::{Error, Result, Sha256Digest};

/// Checks whether `image_root` holds a valid directory-form image.
pub fn is_valid_image_dir(image_root: &Path) -> bool {
    let oci_layout = image_root.join(OCI_LAYOUT_FNAME);
    let layout_ok = fs::read_to_string(&oci_layout)
        .ok()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .is_some_and(|v| {
            serde_json::from_str::<serde_json::Value>(OCI_LAYOUT_CONTENT)
                .is_ok_and(|expected| v == expected)
        });
    if !layout_ok {
        error!(path = %oci_layout.display(), "OCI layout marker missing or invalid");
        return false;
    }
    if !image_root.join(IMAGE_INDEX_FNAME).is_file() {
        error!(path = %image_root.display(), "image index file not found");
        return false;
    }
    if !image_root.join(RESOURCE_DIR).is_dir() {
        error!(path = %image_root.display(), "resource directory not found");
        return false;
    }
    true
}

/// A directory-form image on disk.
#[derive(Debug, Clone)]
pub struct ImageDir {
    root: PathBuf,
}

impl ImageDir {
    /// Opens an existing image directory, validating the layout.
    pub fn open(root: &Path) -> Result<Self> {
        if !is_valid_image_dir(root) {
            return Err(Error::NotFound(format!(
                "{} does not hold a valid OTA image",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Initializes an empty image directory with a fresh, unfinalized index.
    pub fn init(root: &Path, build_tool_version: &str) -> Result<Self> {
        fs::create_dir_all(root.join(RESOURCE_DIR))?;
        fs::write(root.join(OCI_LAYOUT_FNAME), OCI_LAYOUT_CONTENT)?;
        let image_dir = Self {
            root: root.to_path_buf(),
        };
        image_dir.write_index(&ImageIndex::new(build_tool_version))?;
        Ok(image_dir)
    }

    /// Returns the image root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of `index.json`.
    pub fn index_path(&self) -> PathBuf {
        self.root.join(IMAGE_INDEX_FNAME)
    }

    /// Returns the path of `index.jwt`.
    pub fn jwt_path(&self) -> PathBuf {
        self.root.join(INDEX_JWT_FNAME)
    }

    /// Returns the flat blob directory.
    pub fn resource_dir(&self) -> PathBuf {
        self.root.join(RESOURCE_DIR)
    }

    /// Opens the blob store over the resource directory.
    pub fn blob_store(&self) -> BlobStore {
        BlobStore::at(&self.resource_dir())
    }

    /// Loads and parses `index.json`.
    pub fn load_index(&self) -> Result<ImageIndex> {
        ImageIndex::parse(&fs::read(self.index_path())?)
    }

    /// Writes the index back and returns its fresh descriptor.
    pub fn write_index(&self, index: &ImageIndex) -> Result<Descriptor> {
        let contents = index.to_bytes()?;
        fs::write(self.index_path(), &contents)?;
        Ok(Descriptor::new(
            ImageIndex::MEDIA_TYPE,
            Sha256Digest::of(&contents),
            contents.len() as u64,
        ))
    }

    /// Counts blobs and sums their sizes, for finalization totals.
    pub fn blob_totals(&self) -> Result<(u64, u64)> {
        let mut count = 0;
        let mut size = 0;
        for entry in fs::read_dir(self.resource_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                count += 1;
                size += entry.metadata()?.len();
            }
        }
        Ok((count, size))
    }
}
