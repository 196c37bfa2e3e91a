//! SHA-256 digest primitives shared by every layer of the image format.

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::consts::SUPPORTED_HASH_ALG;
use crate::{Error, Result};

/// Chunk size for streaming hash loops.
pub const HASH_READ_SIZE: usize = 8 * 1024 * 1024;

/// A SHA-256 digest value.
///
/// Two presentations exist: bare lowercase hex (blob file names) and the
/// prefixed string `sha256:<hex>` (descriptors, CLI arguments). Equality
/// and hashing go by the raw byte value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha256Digest([u8; 32]);

impl Sha256Digest {
    /// Digest of the empty byte sequence.
    pub const EMPTY: Self = Self([
        0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9,
        0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52,
        0xb8, 0x55,
    ]);

    /// Wraps a raw 32-byte digest.
    pub const fn new(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    /// Computes the digest of a byte slice.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the bare lowercase hex presentation.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses the bare hex presentation.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let raw = hex::decode(hex_str)
            .map_err(|e| Error::BadDigest {
                expected: hex_str.to_owned(),
                actual: format!("unparsable hex: {e}"),
            })?
            .try_into()
            .map_err(|_| Error::BadDigest {
                expected: hex_str.to_owned(),
                actual: "wrong digest length".to_owned(),
            })?;
        Ok(Self(raw))
    }

    /// Parses a raw 32-byte slice, as stored in table BLOB columns.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let raw = raw.try_into().map_err(|_| Error::BadDigest {
            expected: "32-byte sha256".to_owned(),
            actual: format!("{}-byte blob", raw.len()),
        })?;
        Ok(Self(raw))
    }

    /// Parses the prefixed string form `sha256:<hex>`.
    ///
    /// Digest algorithms other than sha256 are rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let (alg, hex_str) = s.split_once(':').ok_or_else(|| Error::BadDigest {
            expected: "sha256:<hex>".to_owned(),
            actual: s.to_owned(),
        })?;
        if alg != SUPPORTED_HASH_ALG {
            return Err(Error::BadDigest {
                expected: "sha256:<hex>".to_owned(),
                actual: s.to_owned(),
            });
        }
        Self::from_hex(hex_str)
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SUPPORTED_HASH_ALG}:{}", self.hex())
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl Serialize for Sha256Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl rusqlite::types::ToSql for Sha256Digest {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::Borrowed(
            rusqlite::types::ValueRef::Blob(&self.0),
        ))
    }
}

impl rusqlite::types::FromSql for Sha256Digest {
    fn column_result(
        value: rusqlite::types::ValueRef<'_>,
    ) -> rusqlite::types::FromSqlResult<Self> {
        let blob = value.as_blob()?;
        Self::from_slice(blob)
            .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
    }
}

/// Computes the SHA-256 digest of a file, streaming in 8 MiB chunks.
pub fn file_sha256(path: &Path) -> io::Result<Sha256Digest> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_READ_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Sha256Digest(hasher.finalize().into()))
}

/// Writer that computes SHA-256 while forwarding data to an inner writer.
pub(crate) struct HashingWriter<W> {
    writer: W,
    hasher: Sha256,
    written: u64,
}

impl<W> HashingWriter<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Consumes the writer and returns the digest and byte count seen.
    pub(crate) fn finish(self) -> (Sha256Digest, u64) {
        (Sha256Digest(self.hasher.finalize().into()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_roundtrip() {
        let d = Sha256Digest::of(b"hello");
        let s = d.to_string();
        assert!(s.starts_with("sha256:"));
        assert_eq!(Sha256Digest::parse(&s).unwrap(), d);
        assert_eq!(Sha256Digest::from_hex(&d.hex()).unwrap(), d);
    }

    #[test]
    fn reject_non_sha256_algorithms() {
        assert!(Sha256Digest::parse("sha512:00").is_err());
        assert!(Sha256Digest::parse("deadbeef").is_err());
    }

    #[test]
    fn empty_digest_matches_hash_of_nothing() {
        assert_eq!(Sha256Digest::of(b""), Sha256Digest::EMPTY);
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        std::fs::write(&p, b"some file content").unwrap();
        assert_eq!(
            file_sha256(&p).unwrap(),
            Sha256Digest::of(b"some file content")
        );
    }
}
