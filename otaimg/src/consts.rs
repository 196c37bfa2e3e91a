//! Layout and protocol constants of the OTA image format.

/// File name of the top-level image index metafile.
pub const IMAGE_INDEX_FNAME: &str = "index.json";

/// File name of the detached JWS over the image index.
pub const INDEX_JWT_FNAME: &str = "index.jwt";

/// Relative path of the content-addressed blob directory.
pub const RESOURCE_DIR: &str = "blobs/sha256";

/// File name of the OCI layout marker.
pub const OCI_LAYOUT_FNAME: &str = "oci-layout";

/// Exact content of the OCI layout marker file.
pub const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// The only JWS algorithm accepted for index signing.
pub const ALLOWED_JWT_ALG: &str = "ES256";

/// The only digest algorithm accepted in descriptors.
pub const SUPPORTED_HASH_ALG: &str = "sha256";

/// The only compression algorithm accepted in resource filters.
pub const ZSTD_COMPRESSION_ALG: &str = "zstd";

/// Canonical file name for a file table database extracted to disk.
pub const FILE_TABLE_FNAME: &str = "file_table.sqlite3";

/// Canonical file name for a resource table database extracted to disk.
pub const RESOURCE_TABLE_FNAME: &str = "resource_table.sqlite3";

/// Marker file carrying the media type of a saved file table.
pub const MEDIA_TYPE_FNAME: &str = "mediaType";
