//! Typed metafile model: descriptors, index, manifest, configs.
//!
//! Every metafile kind is its own struct with pinned media-type and
//! schema-version constants. Parsing gates both against the input;
//! serialization always emits the canonical media type, never an
//! accepted alternate.

mod config;
mod descriptor;
mod index;
mod manifest;
pub mod media_types;
mod otaclient;
mod sys_config;

pub use config::{ConfigLabels, ImageConfig};
pub use descriptor::Descriptor;
pub use index::{ImageIndex, IndexAnnotations};
pub use manifest::{
    ImageIdentifier, ImageManifest, ManifestAnnotations, ManifestDescriptorAnnotations,
    ReleaseKey,
};
pub use otaclient::{OtaClientPackageManifest, PackageManifestAnnotations, PayloadAnnotations};
pub use sys_config::{MountCfg, SwapCfg, SysConfig};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::BlobStore;
use crate::{Error, Result};

/// A structured document serialized into a blob and bound by a descriptor.
///
/// The document format (JSON or YAML) is selected by the media-type
/// suffix. `SCHEMA_VERSION`, when declared, is validated on parse and
/// injected on serialize.
pub trait Metafile: Serialize + DeserializeOwned {
    /// Canonical media type, always used when serializing.
    const MEDIA_TYPE: &'static str;
    /// Alternate media types accepted on ingest for backward compatibility.
    const ALT_MEDIA_TYPES: &'static [&'static str] = &[];
    /// Pinned schema version, if the kind declares one.
    const SCHEMA_VERSION: Option<u64> = None;

    /// Parses a metafile document, gating media type and schema version.
    fn parse(raw: &[u8]) -> Result<Self> {
        if Self::MEDIA_TYPE.ends_with("+json") {
            parse_json_gated::<Self>(raw)
        } else if Self::MEDIA_TYPE.ends_with("+yaml") {
            parse_yaml_gated::<Self>(raw)
        } else {
            Err(Error::BadMediaType(format!(
                "{} is neither a JSON nor a YAML metafile",
                Self::MEDIA_TYPE
            )))
        }
    }

    /// Serializes the metafile, stamping the canonical media type and
    /// schema version.
    fn to_bytes(&self) -> Result<Vec<u8>> {
        if Self::MEDIA_TYPE.ends_with("+json") {
            let mut value = serde_json::to_value(self)?;
            let obj = value.as_object_mut().ok_or_else(|| {
                Error::BadMediaType(format!("{} did not serialize to an object", Self::MEDIA_TYPE))
            })?;
            obj.insert(
                "mediaType".to_owned(),
                serde_json::Value::from(Self::MEDIA_TYPE),
            );
            if let Some(version) = Self::SCHEMA_VERSION {
                obj.insert("schemaVersion".to_owned(), serde_json::Value::from(version));
            }
            Ok(serde_json::to_vec(&value)?)
        } else {
            let mut value = serde_yaml::to_value(self)?;
            if let Some(map) = value.as_mapping_mut() {
                map.insert(
                    serde_yaml::Value::from("mediaType"),
                    serde_yaml::Value::from(Self::MEDIA_TYPE),
                );
            }
            Ok(serde_yaml::to_string(&value)?.into_bytes())
        }
    }

    /// Returns `true` if `media_type` is the canonical type or an alternate.
    fn accepts_media_type(media_type: &str) -> bool {
        media_type == Self::MEDIA_TYPE || Self::ALT_MEDIA_TYPES.contains(&media_type)
    }
}

fn parse_json_gated<M: Metafile>(raw: &[u8]) -> Result<M> {
    let value: serde_json::Value = serde_json::from_slice(raw)?;
    let obj = value
        .as_object()
        .ok_or_else(|| Error::BadMediaType("metafile is not a JSON object".to_owned()))?;

    let media_type = obj.get("mediaType").and_then(serde_json::Value::as_str);
    match media_type {
        Some(mt) if M::accepts_media_type(mt) => {}
        other => {
            return Err(Error::BadMediaType(format!(
                "expected {}, got {}",
                M::MEDIA_TYPE,
                other.unwrap_or("<missing>")
            )));
        }
    }
    if let Some(expected) = M::SCHEMA_VERSION {
        let got = obj.get("schemaVersion").and_then(serde_json::Value::as_u64);
        if got != Some(expected) {
            return Err(Error::BadSchemaVersion {
                expected,
                got: got.map_or_else(|| "<missing>".to_owned(), |v| v.to_string()),
            });
        }
    }
    Ok(serde_json::from_value(value)?)
}

fn parse_yaml_gated<M: Metafile>(raw: &[u8]) -> Result<M> {
    let value: serde_yaml::Value = serde_yaml::from_slice(raw)?;
    // YAML metafiles from older builders may omit mediaType entirely;
    // gate only when the key is present.
    if let Some(mt) = value.get("mediaType").and_then(serde_yaml::Value::as_str) {
        if !M::accepts_media_type(mt) {
            return Err(Error::BadMediaType(format!(
                "expected {}, got {mt}",
                M::MEDIA_TYPE
            )));
        }
    }
    Ok(serde_yaml::from_value(value)?)
}

/// Serializes a metafile into the store and returns its descriptor.
pub fn export_metafile<M: Metafile>(store: &BlobStore, metafile: &M) -> Result<Descriptor> {
    let contents = metafile.to_bytes()?;
    let (digest, size) = store.put_bytes(&contents)?;
    Ok(Descriptor::new(M::MEDIA_TYPE, digest, size))
}

/// Loads a metafile from the store through its descriptor.
pub fn load_metafile<M: Metafile>(store: &BlobStore, descriptor: &Descriptor) -> Result<M> {
    load_metafile_bytes(descriptor, &store.read(&descriptor.digest)?)
}

/// Parses a metafile from raw bytes, gating the descriptor's media type.
pub fn load_metafile_bytes<M: Metafile>(descriptor: &Descriptor, raw: &[u8]) -> Result<M> {
    if !M::accepts_media_type(&descriptor.media_type) {
        return Err(Error::BadMediaType(format!(
            "descriptor carries {}, expected {}",
            descriptor.media_type,
            M::MEDIA_TYPE
        )));
    }
    M::parse(raw)
}
