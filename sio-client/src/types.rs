//! Gateway API payload types.
//!
//! Field names follow the gateway's camelCase JSON. Collections the gateway
//! omits for unmapped volumes default to empty.

use serde::{Deserialize, Serialize};

/// A volume as reported by the gateway.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Allocated size in KiB; the gateway only allocates in 8 GiB steps.
    pub size_in_kb: u64,
    #[serde(default)]
    pub volume_type: String,
    /// One entry per SDC the volume is currently mapped to.
    #[serde(default)]
    pub mapped_sdc_info: Vec<MappedSdcInfo>,
    /// Whether the volume may be mapped to more than one SDC.
    #[serde(default)]
    pub mapping_to_all_sdcs_enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedSdcInfo {
    pub sdc_id: String,
}

/// A storage data client (volume-consuming host) registered with a system.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sdc {
    pub id: String,
    pub sdc_guid: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct System {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Provisioning mode for new volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionType {
    Thin,
    Thick,
}

impl ProvisionType {
    /// The gateway's wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            ProvisionType::Thin => "ThinProvisioned",
            ProvisionType::Thick => "ThickProvisioned",
        }
    }
}

/// Request body for volume creation.
///
/// The gateway expects the size as a decimal string, in KiB.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCreate {
    pub name: String,
    pub volume_size_in_kb: String,
    pub volume_type: &'static str,
    pub storage_pool_id: String,
}
