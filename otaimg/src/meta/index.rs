//! Top-level image index metafile.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::meta::{
    media_types, Descriptor, ImageIdentifier, ManifestDescriptorAnnotations, Metafile,
};
use crate::{Error, Result};

/// Annotations carried by the image index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexAnnotations {
    /// Version of the tool that built this image.
    #[serde(rename = "vnd.tier4.ota.ota-image-builder.version")]
    pub build_tool_version: String,
    /// Finalization timestamp (unix seconds); set once, never cleared.
    #[serde(
        rename = "vnd.tier4.ota.image.created-at",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<i64>,
    /// Signing timestamp (unix seconds).
    #[serde(
        rename = "vnd.tier4.ota.image.signed-at",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub signed_at: Option<i64>,
    /// Total blob count, computed at finalization.
    #[serde(rename = "vnd.tier4.ota.image.blobs-count", default)]
    pub total_blobs_count: u64,
    /// Total blob size in bytes, computed at finalization.
    #[serde(rename = "vnd.tier4.ota.image.blobs-size", default)]
    pub total_blobs_size: u64,
    /// Platform label.
    #[serde(
        rename = "vnd.tier4.pilot-auto.platform",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub platform: Option<String>,
    /// Source repository label.
    #[serde(
        rename = "vnd.tier4.pilot-auto.project.source-repo",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source_repo: Option<String>,
    /// Project version label.
    #[serde(
        rename = "vnd.tier4.pilot-auto.project.version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub project_version: Option<String>,
    /// Release commit label.
    #[serde(
        rename = "vnd.tier4.pilot-auto.project.release-commit",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub release_commit: Option<String>,
    /// Release branch label.
    #[serde(
        rename = "vnd.tier4.pilot-auto.project.release-branch",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub release_branch: Option<String>,
    /// Web-auto project label.
    #[serde(
        rename = "vnd.tier4.web-auto.project",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub web_auto_project: Option<String>,
    /// Web-auto project id.
    #[serde(
        rename = "vnd.tier4.web-auto.project-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub web_auto_project_id: Option<String>,
    /// Web-auto catalog label.
    #[serde(
        rename = "vnd.tier4.web-auto.catalog",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub web_auto_catalog: Option<String>,
    /// Web-auto catalog id.
    #[serde(
        rename = "vnd.tier4.web-auto.catalog-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub web_auto_catalog_id: Option<String>,
    /// Web-auto environment label.
    #[serde(
        rename = "vnd.tier4.web-auto.env",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub web_auto_env: Option<String>,
    /// Unknown annotation keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl IndexAnnotations {
    /// Creates a fresh annotation set for a new, unfinalized image.
    pub fn new(build_tool_version: impl Into<String>) -> Self {
        Self {
            build_tool_version: build_tool_version.into(),
            created_at: None,
            signed_at: None,
            total_blobs_count: 0,
            total_blobs_size: 0,
            platform: None,
            source_repo: None,
            project_version: None,
            release_commit: None,
            release_branch: None,
            web_auto_project: None,
            web_auto_project_id: None,
            web_auto_catalog: None,
            web_auto_catalog_id: None,
            web_auto_env: None,
            extra: BTreeMap::new(),
        }
    }
}

/// The top-level metafile of an OTA image.
///
/// Holds an ordered list of child descriptors: image manifests, at most
/// one resource table, and optional OTA-client package manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageIndex {
    /// Child descriptors.
    pub manifests: Vec<Descriptor>,
    /// Index annotations.
    pub annotations: IndexAnnotations,
}

impl Metafile for ImageIndex {
    const MEDIA_TYPE: &'static str = media_types::IMAGE_INDEX;
    const SCHEMA_VERSION: Option<u64> = Some(2);
}

fn is_image_manifest(d: &Descriptor) -> bool {
    d.is_media_type(media_types::IMAGE_MANIFEST)
        && d.has_artifact_type(media_types::OTA_IMAGE_ARTIFACT)
}

fn is_resource_table(d: &Descriptor) -> bool {
    d.is_media_type(media_types::OTA_IMAGE_RESOURCETABLE)
        || d.is_media_type(media_types::OTA_IMAGE_RESOURCETABLE_ZSTD)
}

fn is_otaclient_package(d: &Descriptor) -> bool {
    d.is_media_type(media_types::OTACLIENT_PACKAGE_MANIFEST)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

impl ImageIndex {
    /// Creates an empty, unfinalized index.
    pub fn new(build_tool_version: impl Into<String>) -> Self {
        Self {
            manifests: Vec::new(),
            annotations: IndexAnnotations::new(build_tool_version),
        }
    }

    /// An image is finalized once `created_at` is stamped.
    pub fn finalized(&self) -> bool {
        self.annotations.created_at.is_some()
    }

    /// An image is signed once `signed_at` is stamped.
    pub fn signed(&self) -> bool {
        self.annotations.signed_at.is_some()
    }

    /// Returns the resource table descriptor, if any.
    pub fn resource_table(&self) -> Option<&Descriptor> {
        self.manifests.iter().find(|d| is_resource_table(d))
    }

    /// Lists the identifiers of all image payloads.
    pub fn image_identifiers(&self) -> Vec<ImageIdentifier> {
        self.manifests
            .iter()
            .filter(|d| is_image_manifest(d))
            .filter_map(|d| {
                d.annotations_as::<ManifestDescriptorAnnotations>()
                    .ok()
                    .flatten()
            })
            .map(|a| a.image_identifier())
            .collect()
    }

    /// Finds the manifest descriptor for an image payload.
    pub fn find_image(&self, id: &ImageIdentifier) -> Option<&Descriptor> {
        self.manifests.iter().filter(|d| is_image_manifest(d)).find(|d| {
            d.annotations_as::<ManifestDescriptorAnnotations>()
                .ok()
                .flatten()
                .is_some_and(|a| a.image_identifier() == *id)
        })
    }

    /// Lists all OTA-client package manifest descriptors.
    pub fn otaclient_packages(&self) -> Vec<&Descriptor> {
        self.manifests
            .iter()
            .filter(|d| is_otaclient_package(d))
            .collect()
    }

    /// Adds an image payload manifest descriptor.
    ///
    /// Refused once the image is finalized; duplicate identifiers are
    /// rejected.
    pub fn add_image(&mut self, descriptor: Descriptor) -> Result<()> {
        if self.finalized() || self.signed() {
            return Err(Error::Finalized);
        }
        let id = descriptor
            .annotations_as::<ManifestDescriptorAnnotations>()?
            .ok_or_else(|| {
                Error::BadMediaType("image manifest descriptor lacks identifier annotations".into())
            })?
            .image_identifier();
        if self.find_image(&id).is_some() {
            return Err(Error::DuplicateImage(id.to_string()));
        }
        self.manifests.push(descriptor);
        Ok(())
    }

    /// Adds an OTA-client package manifest descriptor.
    pub fn add_otaclient_package(&mut self, descriptor: Descriptor) -> Result<()> {
        if self.finalized() || self.signed() {
            return Err(Error::Finalized);
        }
        self.manifests.push(descriptor);
        Ok(())
    }

    /// Replaces the resource table descriptor.
    ///
    /// Passing `None` removes the existing descriptor. Returns the old
    /// descriptor if one was present.
    pub fn update_resource_table(&mut self, descriptor: Option<Descriptor>) -> Option<Descriptor> {
        let old = self
            .manifests
            .iter()
            .position(|d| is_resource_table(d))
            .map(|idx| self.manifests.remove(idx));
        if let Some(d) = descriptor {
            self.manifests.push(d);
        }
        old
    }

    /// Finalizes the image: stamps `created_at` and the blob totals.
    pub fn finalize(&mut self, total_blobs_count: u64, total_blobs_size: u64) -> Result<()> {
        if self.finalized() {
            return Err(Error::Finalized);
        }
        self.annotations.created_at = Some(unix_now());
        self.annotations.total_blobs_count = total_blobs_count;
        self.annotations.total_blobs_size = total_blobs_size;
        Ok(())
    }

    /// Marks the image as signed by stamping `signed_at`.
    ///
    /// Requires finalization; re-signing requires `force`.
    pub fn finalize_signing(&mut self, force: bool) -> Result<()> {
        if !self.finalized() {
            return Err(Error::NotFinalized);
        }
        if self.signed() && !force {
            return Err(Error::AlreadySigned);
        }
        self.annotations.signed_at = Some(unix_now());
        Ok(())
    }
}
