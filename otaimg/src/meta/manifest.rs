//! Per-payload image manifest.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::meta::{media_types, Descriptor, Metafile};
use crate::{Error, Result};

/// Release key distinguishing development from production payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseKey {
    /// Development payload.
    Dev,
    /// Production payload.
    Prd,
}

impl Default for ReleaseKey {
    fn default() -> Self {
        Self::Dev
    }
}

impl fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dev => f.write_str("dev"),
            Self::Prd => f.write_str("prd"),
        }
    }
}

impl FromStr for ReleaseKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dev" => Ok(Self::Dev),
            "prd" => Ok(Self::Prd),
            other => Err(Error::NotFound(format!("unknown release key: {other}"))),
        }
    }
}

/// Uniquely names an image payload inside an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageIdentifier {
    /// Target ECU id.
    pub ecu_id: String,
    /// Release key of the payload.
    pub release_key: ReleaseKey,
}

impl ImageIdentifier {
    /// Creates an identifier from its parts.
    pub fn new(ecu_id: impl Into<String>, release_key: ReleaseKey) -> Self {
        Self {
            ecu_id: ecu_id.into(),
            release_key,
        }
    }

    /// Parses the CLI form `<ecu_id>[:<release_key>]`, defaulting to `dev`.
    pub fn parse_cli(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((ecu, key)) => Ok(Self::new(ecu, key.parse()?)),
            None => Ok(Self::new(s, ReleaseKey::Dev)),
        }
    }
}

impl fmt::Display for ImageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ecu_id, self.release_key)
    }
}

/// Annotations carried by the manifest metafile itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestAnnotations {
    /// Target ECU id.
    #[serde(rename = "vnd.tier4.pilot-auto.platform.ecu")]
    pub ecu_id: String,
    /// Release key of this payload.
    #[serde(rename = "vnd.tier4.ota.release-key", default)]
    pub release_key: ReleaseKey,
    /// Platform name.
    #[serde(
        rename = "vnd.tier4.pilot-auto.platform",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub platform: Option<String>,
    /// ECU hardware model.
    #[serde(rename = "vnd.tier4.pilot-auto.platform.ecu.hardware-model")]
    pub hardware_model: String,
    /// ECU hardware series.
    #[serde(
        rename = "vnd.tier4.pilot-auto.platform.ecu.hardware-series",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hardware_series: Option<String>,
    /// ECU CPU architecture.
    #[serde(rename = "vnd.tier4.pilot-auto.platform.ecu.architecture")]
    pub arch: String,
    /// Unknown annotation keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The annotation subset carried on a manifest *descriptor* in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDescriptorAnnotations {
    /// Target ECU id.
    #[serde(rename = "vnd.tier4.pilot-auto.platform.ecu")]
    pub ecu_id: String,
    /// Release key of this payload.
    #[serde(rename = "vnd.tier4.ota.release-key", default)]
    pub release_key: ReleaseKey,
}

impl ManifestDescriptorAnnotations {
    /// Returns the identifier this annotation pair encodes.
    pub fn image_identifier(&self) -> ImageIdentifier {
        ImageIdentifier::new(self.ecu_id.clone(), self.release_key)
    }
}

/// Per-payload metafile pointing at the image config and file table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Descriptor of the image config metafile.
    pub config: Descriptor,
    /// Layer descriptors; the first layer is the file table.
    pub layers: Vec<Descriptor>,
    /// Manifest annotations.
    pub annotations: ManifestAnnotations,
}

impl Metafile for ImageManifest {
    const MEDIA_TYPE: &'static str = media_types::IMAGE_MANIFEST;
    const SCHEMA_VERSION: Option<u64> = Some(2);
}

impl ImageManifest {
    /// Returns the identifier of the payload this manifest describes.
    pub fn image_identifier(&self) -> ImageIdentifier {
        ImageIdentifier::new(self.annotations.ecu_id.clone(), self.annotations.release_key)
    }

    /// Returns the file table descriptor (the first layer).
    pub fn file_table(&self) -> Result<&Descriptor> {
        self.layers
            .first()
            .ok_or_else(|| Error::NotFound("image manifest has no layers".to_owned()))
    }

    /// Builds the index-side descriptor for this manifest.
    ///
    /// The identifier annotations are mandatory on the descriptor so an
    /// index can be searched without loading every manifest blob.
    pub fn descriptor(&self, digest: crate::Sha256Digest, size: u64) -> Result<Descriptor> {
        Descriptor::new(Self::MEDIA_TYPE, digest, size)
            .with_artifact_type(media_types::OTA_IMAGE_ARTIFACT)
            .with_annotations(&ManifestDescriptorAnnotations {
                ecu_id: self.annotations.ecu_id.clone(),
                release_key: self.annotations.release_key,
            })
    }
}
