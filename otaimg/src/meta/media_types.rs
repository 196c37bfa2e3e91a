//! Media type enumeration of the OTA image format.
//!
//! Canonical values are always used on emit; alternates are accepted on
//! ingest only.

/// OCI image index.
pub const IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// OCI image manifest.
pub const IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OTA image artifact (used as `artifactType`).
pub const OTA_IMAGE_ARTIFACT: &str = "application/vnd.tier4.ota.file-based-ota-image.v1";
/// File table database.
pub const OTA_IMAGE_FILETABLE: &str =
    "application/vnd.tier4.ota.file-based-ota-image.file_table.v1.sqlite3";
/// Zstd-compressed file table database.
pub const OTA_IMAGE_FILETABLE_ZSTD: &str =
    "application/vnd.tier4.ota.file-based-ota-image.file_table.v1.sqlite3+zstd";
/// Resource table database.
pub const OTA_IMAGE_RESOURCETABLE: &str =
    "application/vnd.tier4.ota.file-based-ota-image.resource_table.v1.sqlite3";
/// Zstd-compressed resource table database.
pub const OTA_IMAGE_RESOURCETABLE_ZSTD: &str =
    "application/vnd.tier4.ota.file-based-ota-image.resource_table.v1.sqlite3+zstd";
/// Image config metafile.
pub const OTA_IMAGE_CONFIG_JSON: &str =
    "application/vnd.tier4.ota.file-based-ota-image.config.v1+json";
/// Sys-config metafile (canonical).
pub const SYS_CONFIG_YAML: &str = "application/vnd.tier4.ota.sys-config.v1+yaml";
/// Sys-config metafile media type emitted by early builders; ingest only.
pub const SYS_CONFIG_YAML_LEGACY: &str =
    "application/vnd.tier4.ota.file-based-ota-image.config.v1+yaml";

/// OTA-client release package artifact type.
pub const OTACLIENT_PACKAGE_ARTIFACT: &str = "application/vnd.tier4.otaclient.release-package.v1";
/// OTA-client release package manifest.
pub const OTACLIENT_PACKAGE_MANIFEST: &str =
    "application/vnd.tier4.otaclient.release-package.manifest.v1+json";
/// OTA-client application payload (squashfs).
pub const OTACLIENT_APP_IMAGE: &str = "application/vnd.tier4.otaclient.release-package.v1.squashfs";

/// Returns `true` if the media type marks a zstd-compressed blob.
pub fn is_zstd(media_type: &str) -> bool {
    media_type.ends_with("+zstd")
}
