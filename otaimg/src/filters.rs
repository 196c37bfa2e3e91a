//! Resource derivation filters: bundle, compress, slice.
//!
//! A filter is stored in the resource table's `filter_applied` column as
//! `<tag>:<msgpack-body>` where the tag is a single registered byte and
//! the body is a positional msgpack array. A row without a filter is a
//! leaf: its logical content equals the blob named by its digest.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Upper bound on a serialized filter string.
pub const FILTER_MAX_SIZE: usize = 1024 * 1024;

/// Tag byte for [`ResourceFilter::Bundle`].
pub const TAG_BUNDLE: u8 = b'b';
/// Tag byte for [`ResourceFilter::Compress`].
pub const TAG_COMPRESS: u8 = b'c';
/// Tag byte for [`ResourceFilter::Slice`].
pub const TAG_SLICE: u8 = b's';

/// Derivation rule attached to a resource-table row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResourceFilter {
    /// A byte range `[offset, offset + len)` of a larger bundle resource.
    Bundle {
        /// Resource id of the bundle this resource is carved from.
        bundle_resource_id: i64,
        /// Byte offset of this resource inside the bundle.
        offset: u64,
        /// Length of this resource in bytes.
        len: u64,
    },
    /// The decompression of another resource's reconstructed content.
    Compress {
        /// Resource id of the compressed payload.
        resource_id: i64,
        /// Compression algorithm; only `zstd` is supported.
        compression_alg: String,
    },
    /// The in-order concatenation of the listed leaf resources.
    Slice {
        /// Resource ids of the slices, in concatenation order.
        slices: Vec<i64>,
    },
}

#[derive(Serialize, Deserialize)]
struct BundleBody(i64, u64, u64);

#[derive(Serialize, Deserialize)]
struct CompressBody(i64, String);

impl ResourceFilter {
    /// Serializes to the `<tag>:<msgpack-body>` wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let (tag, body) = match self {
            Self::Bundle {
                bundle_resource_id,
                offset,
                len,
            } => (
                TAG_BUNDLE,
                rmp_serde::to_vec(&BundleBody(*bundle_resource_id, *offset, *len))?,
            ),
            Self::Compress {
                resource_id,
                compression_alg,
            } => (
                TAG_COMPRESS,
                rmp_serde::to_vec(&CompressBody(*resource_id, compression_alg.clone()))?,
            ),
            Self::Slice { slices } => (TAG_SLICE, rmp_serde::to_vec(slices)?),
        };
        if body.len() > FILTER_MAX_SIZE {
            return Err(Error::FilterTooLarge(body.len()));
        }
        let mut out = Vec::with_capacity(body.len() + 2);
        out.push(tag);
        out.push(b':');
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parses the `<tag>:<msgpack-body>` wire form.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() > FILTER_MAX_SIZE + 2 {
            return Err(Error::FilterTooLarge(raw.len()));
        }
        let sep = raw
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| Error::UnknownFilter(String::from_utf8_lossy(raw).into_owned()))?;
        let (tag, body) = (&raw[..sep], &raw[sep + 1..]);
        match tag {
            [TAG_BUNDLE] => {
                let BundleBody(bundle_resource_id, offset, len) = rmp_serde::from_slice(body)?;
                Ok(Self::Bundle {
                    bundle_resource_id,
                    offset,
                    len,
                })
            }
            [TAG_COMPRESS] => {
                let CompressBody(resource_id, compression_alg) = rmp_serde::from_slice(body)?;
                Ok(Self::Compress {
                    resource_id,
                    compression_alg,
                })
            }
            [TAG_SLICE] => Ok(Self::Slice {
                slices: rmp_serde::from_slice(body)?,
            }),
            other => Err(Error::UnknownFilter(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    /// Lists the resource ids this filter draws from.
    ///
    /// Bundle and compress reference a single id, slice a list; callers
    /// get a uniform flattened view.
    pub fn referenced_resources(&self) -> Vec<i64> {
        match self {
            Self::Bundle {
                bundle_resource_id, ..
            } => vec![*bundle_resource_id],
            Self::Compress { resource_id, .. } => vec![*resource_id],
            Self::Slice { slices } => slices.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_roundtrip() {
        let f = ResourceFilter::Bundle {
            bundle_resource_id: 42,
            offset: 65536,
            len: 16384,
        };
        let raw = f.to_bytes().unwrap();
        assert_eq!(raw[0], TAG_BUNDLE);
        assert_eq!(raw[1], b':');
        assert_eq!(ResourceFilter::from_bytes(&raw).unwrap(), f);
    }

    #[test]
    fn compress_roundtrip() {
        let f = ResourceFilter::Compress {
            resource_id: 7,
            compression_alg: "zstd".to_owned(),
        };
        let raw = f.to_bytes().unwrap();
        assert_eq!(ResourceFilter::from_bytes(&raw).unwrap(), f);
    }

    #[test]
    fn slice_roundtrip_and_references() {
        let f = ResourceFilter::Slice {
            slices: vec![3, 1, 4, 1, 5],
        };
        let raw = f.to_bytes().unwrap();
        assert_eq!(ResourceFilter::from_bytes(&raw).unwrap(), f);
        assert_eq!(f.referenced_resources(), vec![3, 1, 4, 1, 5]);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = ResourceFilter::from_bytes(b"x:\x90").unwrap_err();
        assert!(matches!(err, Error::UnknownFilter(_)));
    }

    #[test]
    fn missing_separator_is_rejected() {
        assert!(ResourceFilter::from_bytes(b"b\x93\x01\x02\x03").is_err());
    }
}
