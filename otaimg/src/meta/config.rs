//! Per-image configuration metafile.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::consts::SUPPORTED_HASH_ALG;
use crate::meta::{media_types, Descriptor, Metafile};

/// Rootfs statistics and provenance labels of an image payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigLabels {
    /// Base image this payload was derived from.
    #[serde(rename = "vnd.tier4.image.base-image")]
    pub base_image: String,
    /// Operating system name.
    #[serde(
        rename = "vnd.tier4.image.os",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os: Option<String>,
    /// Operating system version.
    #[serde(
        rename = "vnd.tier4.image.os.version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os_version: Option<String>,
    /// Number of blobs backing this payload.
    #[serde(rename = "vnd.tier4.ota.image.blobs-count")]
    pub image_blobs_count: u64,
    /// Total byte size of the blobs backing this payload.
    #[serde(rename = "vnd.tier4.ota.image.blobs-size")]
    pub image_blobs_size: u64,
    /// Total rootfs size in bytes.
    #[serde(
        rename = "vnd.tier4.image.rootfs.size",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sys_image_size: Option<u64>,
    /// Count of regular files in the rootfs.
    #[serde(rename = "vnd.tier4.image.rootfs.regular-files-count")]
    pub regular_files_count: u64,
    /// Count of non-regular files (symlinks, char devices).
    #[serde(rename = "vnd.tier4.image.rootfs.non-regular-files-count")]
    pub non_regular_files_count: u64,
    /// Count of directories.
    #[serde(rename = "vnd.tier4.image.rootfs.dirs-count")]
    pub dirs_count: u64,
    /// Count of unique file entries (distinct digests).
    #[serde(rename = "vnd.tier4.image.rootfs.unique-files-entries-count")]
    pub unique_file_entries: u64,
    /// Total byte size of unique file entries.
    #[serde(rename = "vnd.tier4.image.rootfs.unique-files-entries-size")]
    pub unique_file_entries_size: u64,
    /// Unknown annotation keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Per-image metafile pointing at the file table and optional sys config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Digest algorithm the resource layer uses; always `sha256`.
    #[serde(default = "default_digest_alg")]
    pub resource_digest_alg: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Creation timestamp string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// CPU architecture of the payload.
    pub architecture: String,
    /// Operating system name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    /// Operating system version.
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Descriptor of the optional sys-config metafile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sys_config: Option<Descriptor>,
    /// Descriptor of the file table database.
    pub file_table: Descriptor,
    /// Statistics and provenance labels.
    pub labels: ConfigLabels,
}

fn default_digest_alg() -> String {
    SUPPORTED_HASH_ALG.to_owned()
}

impl Metafile for ImageConfig {
    const MEDIA_TYPE: &'static str = media_types::OTA_IMAGE_CONFIG_JSON;
    const SCHEMA_VERSION: Option<u64> = Some(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sha256Digest;

    #[test]
    fn metafile_roundtrip() {
        let config = ImageConfig {
            resource_digest_alg: default_digest_alg(),
            description: None,
            created: Some("2026-01-19T00:00:00Z".to_owned()),
            architecture: "arm64".to_owned(),
            os: Some("linux".to_owned()),
            os_version: None,
            sys_config: None,
            file_table: Descriptor::new(
                media_types::OTA_IMAGE_FILETABLE_ZSTD,
                Sha256Digest::of(b"ft"),
                128,
            ),
            labels: ConfigLabels {
                base_image: "ubuntu:22.04".to_owned(),
                os: None,
                os_version: None,
                image_blobs_count: 4,
                image_blobs_size: 4096,
                sys_image_size: Some(9000),
                regular_files_count: 3,
                non_regular_files_count: 0,
                dirs_count: 1,
                unique_file_entries: 2,
                unique_file_entries_size: 2048,
                extra: BTreeMap::new(),
            },
        };
        let parsed = ImageConfig::parse(&config.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
