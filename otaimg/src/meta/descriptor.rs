//! OCI-style content descriptors.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, Sha256Digest};

/// Binds a blob to a semantic type.
///
/// See the OCI image-spec descriptor definition; this toolkit restricts
/// `digest` to SHA-256. `annotations` keeps unknown keys verbatim so a
/// parse/serialize round trip is lossless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced blob.
    pub media_type: String,
    /// SHA-256 digest of the referenced blob.
    pub digest: Sha256Digest,
    /// Size of the referenced blob in bytes.
    pub size: u64,
    /// Artifact type, for descriptors that carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Free-form annotations; typed views are parsed on demand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Descriptor {
    /// Creates a descriptor with the given media type, digest and size.
    pub fn new(media_type: impl Into<String>, digest: Sha256Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            artifact_type: None,
            annotations: None,
        }
    }

    /// Sets the artifact type.
    #[must_use]
    pub fn with_artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = Some(artifact_type.into());
        self
    }

    /// Attaches a typed annotation struct, serialized key-by-key.
    pub fn with_annotations<T: Serialize>(mut self, annotations: &T) -> Result<Self> {
        match serde_json::to_value(annotations)? {
            serde_json::Value::Object(map) => {
                self.annotations = Some(map);
                Ok(self)
            }
            other => Err(Error::Json(serde::de::Error::custom(format!(
                "annotations must serialize to an object, got {other}"
            )))),
        }
    }

    /// Parses the annotations into a typed view.
    ///
    /// Returns `None` when the descriptor carries no annotations.
    pub fn annotations_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.annotations {
            None => Ok(None),
            Some(map) => Ok(Some(serde_json::from_value(serde_json::Value::Object(
                map.clone(),
            ))?)),
        }
    }

    /// Validates the media type against a pinned set.
    pub fn expect_media_type(&self, allowed: &[&str]) -> Result<()> {
        if allowed.contains(&self.media_type.as_str()) {
            Ok(())
        } else {
            Err(Error::BadMediaType(format!(
                "descriptor carries {}, expected one of {allowed:?}",
                self.media_type
            )))
        }
    }

    /// Returns `true` if the descriptor has the given media type.
    pub fn is_media_type(&self, media_type: &str) -> bool {
        self.media_type == media_type
    }

    /// Returns `true` if the descriptor carries the given artifact type.
    pub fn has_artifact_type(&self, artifact_type: &str) -> bool {
        self.artifact_type.as_deref() == Some(artifact_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_preserves_unknown_annotation_keys() {
        let raw = serde_json::json!({
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": Sha256Digest::of(b"x").to_string(),
            "size": 1,
            "artifactType": "application/vnd.tier4.ota.file-based-ota-image.v1",
            "annotations": {
                "vnd.tier4.pilot-auto.platform.ecu": "main",
                "x-totally-unknown-key": "kept",
            },
        });
        let descriptor: Descriptor = serde_json::from_value(raw.clone()).unwrap();
        let round = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(raw, round);
    }

    #[test]
    fn expect_media_type_rejects_mismatch() {
        let d = Descriptor::new("application/a", Sha256Digest::of(b"x"), 1);
        assert!(d.expect_media_type(&["application/a"]).is_ok());
        assert!(matches!(
            d.expect_media_type(&["application/b"]),
            Err(Error::BadMediaType(_))
        ));
    }

    #[test]
    fn non_sha256_digest_fails_to_parse() {
        let raw = serde_json::json!({
            "mediaType": "application/a",
            "digest": "sha512:00ff",
            "size": 1,
        });
        assert!(serde_json::from_value::<Descriptor>(raw).is_err());
    }
}
