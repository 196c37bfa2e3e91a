//! OTA-client release package manifest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::{media_types, Descriptor, Metafile};
use crate::Sha256Digest;

/// Annotations carried by an OTA-client payload descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadAnnotations {
    /// Package version string.
    pub version: String,
    /// Payload type; squashfs application images.
    #[serde(rename = "type", default = "default_payload_type")]
    pub payload_type: String,
    /// Target CPU architecture (`arm64` or `x86_64`).
    pub architecture: String,
    /// Payload size in bytes.
    pub size: u64,
    /// Payload checksum.
    pub checksum: Sha256Digest,
}

fn default_payload_type() -> String {
    "squashfs".to_owned()
}

/// Manifest annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifestAnnotations {
    /// Release date string.
    pub date: String,
    /// Unknown annotation keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Manifest of an OTA-client release package shipped inside an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtaClientPackageManifest {
    /// Descriptor of the original release `manifest.json` blob.
    pub config: Descriptor,
    /// Squashfs payload descriptors.
    pub layers: Vec<Descriptor>,
    /// Manifest annotations.
    pub annotations: PackageManifestAnnotations,
}

impl Metafile for OtaClientPackageManifest {
    const MEDIA_TYPE: &'static str = media_types::IMAGE_MANIFEST;
    const SCHEMA_VERSION: Option<u64> = Some(2);
}

impl OtaClientPackageManifest {
    /// Finds a payload descriptor by version and architecture.
    pub fn find_package(&self, version: &str, architecture: &str) -> Option<&Descriptor> {
        self.layers.iter().find(|d| {
            d.annotations_as::<PayloadAnnotations>()
                .ok()
                .flatten()
                .is_some_and(|a| a.version == version && a.architecture == architecture)
        })
    }
}
