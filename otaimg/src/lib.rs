//! Content-addressed OTA system-image toolkit.
//!
//! Reads, writes, verifies and deploys signed system-image bundles in a
//! layered, content-addressed, OCI-compatible format.
//!
//! # Architecture
//!
//! ```text
//! artifact  — deterministic ZIP container (STORED members) over the layout
//! store     — flat content-addressed blob directory `blobs/sha256/<hex>`
//! meta      — typed metafiles: image index, manifest, config, sys-config
//! filters   — bundle / compress / slice derivation rules (msgpack-tagged)
//! rst       — resource table + reconstruction engine
//! ft        — file table (rootfs description) + filesystem materialization
//! deploy    — worker-pool driven resource + rootfs deployment
//! sign      — ES256 detached JWS over the index, x5c chain handling
//! ```

pub mod artifact;
pub mod consts;
pub mod deploy;
pub mod digest;
mod error;
pub mod filters;
pub mod ft;
pub mod layout;
pub mod meta;
pub mod rst;
pub mod sign;
pub mod store;
pub(crate) mod util;
pub mod verify;

pub use digest::Sha256Digest;
pub use error::{Error, Result};
