//! Optional per-image system configuration, a YAML metafile.

use serde::{Deserialize, Serialize};

use crate::meta::{media_types, Metafile};

/// Swap file configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapCfg {
    /// Path of the swap file on the target.
    pub filepath: String,
    /// Swap size in GiB.
    pub size: u64,
}

/// Extra mount point configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountCfg {
    /// Device or source of the mount.
    pub file_system: String,
    /// Target mount point.
    pub mount_point: String,
    /// Filesystem type.
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Mount options string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

/// System configuration applied on the ECU after deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysConfig {
    /// Target hostname.
    pub hostname: String,
    /// Extra mount points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_mount: Option<Vec<MountCfg>>,
    /// Swap configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<SwapCfg>,
    /// Sysctl entries as `key=value` strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysctl: Option<Vec<String>>,
    /// Paths persisted across updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_files: Option<Vec<String>>,
    /// Network configuration block, passed through opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<serde_yaml::Value>,
    /// OTA client ECU info block.
    #[serde(
        rename = "otaclient.ecu_info",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub otaclient_ecu_info: Option<serde_yaml::Value>,
    /// OTA client proxy info block.
    #[serde(
        rename = "otaclient.proxy_info",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub otaclient_proxy_info: Option<serde_yaml::Value>,
}

impl Metafile for SysConfig {
    const MEDIA_TYPE: &'static str = media_types::SYS_CONFIG_YAML;
    // The early builder stamped sys-config blobs with the generic config
    // media type; accept it on ingest, never emit it.
    const ALT_MEDIA_TYPES: &'static [&'static str] = &[media_types::SYS_CONFIG_YAML_LEGACY];
}
