//! Error types for OTA image operations.

/// Alias for `Result<T, otaimg::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by OTA image operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A blob, metafile or table row is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A computed digest does not match the declared one.
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    BadDigest {
        /// The digest declared by the descriptor or filename.
        expected: String,
        /// The digest computed over the actual bytes.
        actual: String,
    },

    /// Descriptor or metafile media type does not match the declared set.
    #[error("unexpected media type: {0}")]
    BadMediaType(String),

    /// Metafile schema version does not match the declared value.
    #[error("unexpected schema version: expected {expected}, got {got}")]
    BadSchemaVersion {
        /// The schema version the metafile kind declares.
        expected: u64,
        /// The value found in the input document.
        got: String,
    },

    /// Certificate chain construction failed.
    #[error("certificate chain: {0}")]
    BadChain(String),

    /// Certificate chain exceeds the maximum allowed length.
    #[error("certificate chain exceeds maximum length of {0}")]
    ChainTooLong(usize),

    /// A self-signed root CA was found inside the signing chain.
    #[error("root CA must not appear in the signing chain")]
    RootInChain,

    /// JWS signature verification failed.
    #[error("signature verification failed: {0}")]
    BadSignature(String),

    /// The JWS declares an algorithm other than ES256.
    #[error("unsupported JWS algorithm: {0}")]
    WrongAlg(String),

    /// The signing certificate does not carry a P-256 ECDSA key.
    #[error("signing certificate does not carry a P-256 ECDSA key")]
    NonEcdsaKey,

    /// The signed index digest does not match the local `index.json`.
    #[error("signed index digest does not match the local index.json")]
    IndexDigestMismatch,

    /// A resource filter tag is not registered.
    #[error("unknown resource filter tag: {0}")]
    UnknownFilter(String),

    /// A serialized filter body exceeds the 1 MiB cap.
    #[error("filter body exceeds maximum size: {0} bytes")]
    FilterTooLarge(usize),

    /// The filter graph recursion exceeded the documented depth cap.
    #[error("filter graph too deep while rebuilding resource {0}")]
    FilterTooDeep(String),

    /// A digest was requested that has no resource-table row.
    #[error("resource {0} not present in the resource table")]
    NotInResourceTable(String),

    /// The retry budget for a bundle download was exhausted.
    #[error("timed out waiting for bundle resource {0}")]
    BundleTimeout(i64),

    /// Rebuilding a sliced resource failed.
    #[error("failed to recreate sliced resource {digest}: {reason}")]
    SlicedRecreateFailed {
        /// Digest of the resource being rebuilt.
        digest: String,
        /// Failure description.
        reason: String,
    },

    /// Rebuilding a compressed resource failed.
    #[error("failed to recreate compressed resource {digest}: {reason}")]
    CompressedRecreateFailed {
        /// Digest of the resource being rebuilt.
        digest: String,
        /// Failure description.
        reason: String,
    },

    /// Rebuilding a bundled resource failed.
    #[error("failed to recreate bundled resource {digest}: {reason}")]
    BundledRecreateFailed {
        /// Digest of the resource being rebuilt.
        digest: String,
        /// Failure description.
        reason: String,
    },

    /// Preparing a single file-table entry on disk failed.
    #[error("failed to prepare entry {path}")]
    PrepareEntryFailed {
        /// Canonical path of the offending entry.
        path: String,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Rootfs deployment failed.
    #[error("failed to set up rootfs")]
    SetupRootfsFailed(#[source] Box<Error>),

    /// The image is finalized; further mutation is refused.
    #[error("image is finalized and cannot be modified")]
    Finalized,

    /// The image is not finalized yet; signing is refused.
    #[error("image is not finalized; finalize before signing")]
    NotFinalized,

    /// The image is already signed; re-signing needs `force`.
    #[error("image is already signed")]
    AlreadySigned,

    /// An image payload with the same identifier already exists.
    #[error("duplicate image payload: {0}")]
    DuplicateImage(String),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing or serialization error.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite error.
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    /// ZIP archive error.
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    /// Msgpack encoding error.
    #[error("msgpack encode: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    /// Msgpack decoding error.
    #[error("msgpack decode: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    /// A `nix` syscall failed.
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}

impl Error {
    /// Wraps an error as a per-entry deployment failure for `path`.
    pub(crate) fn prepare_entry(path: &str, source: Error) -> Self {
        Self::PrepareEntryFailed {
            path: path.to_owned(),
            source: Box::new(source),
        }
    }
}
