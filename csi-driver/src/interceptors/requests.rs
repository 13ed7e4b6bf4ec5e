//! Per-request pipeline metadata.
//!
//! Each CSI request message implements [`CsiRequest`] to tell the pipeline
//! its method name, protocol version, required fields, idempotency
//! fingerprint, and (when it references one) the volume it acts upon.

use std::fmt;

use tonic::Status;

use crate::csi;

/// Reference to a volume carried by a request: by backend id, or by name
/// for requests that precede volume creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeRef {
    Id(String),
    Name(String),
}

pub trait CsiRequest: fmt::Debug + Send {
    /// Protocol-exact RPC method name.
    fn method(&self) -> &'static str;

    fn version(&self) -> Option<&csi::Version>;

    /// Required-field checks for spec validation.
    fn required_fields(&self) -> Result<(), Status> {
        Ok(())
    }

    /// Fingerprint for the idempotency guard; `None` leaves the request
    /// unguarded.
    fn idempotency_key(&self) -> Option<String> {
        None
    }

    /// The volume this request acts upon, for the require-volume check.
    fn volume_ref(&self) -> Option<VolumeRef> {
        None
    }

    /// Whether a missing referenced volume makes this request an idempotent
    /// success rather than an error.
    fn missing_volume_is_success(&self) -> bool {
        false
    }
}

fn require(value: &str, message: &'static str) -> Result<(), Status> {
    if value.is_empty() {
        return Err(Status::invalid_argument(message));
    }
    Ok(())
}

impl CsiRequest for csi::CreateVolumeRequest {
    fn method(&self) -> &'static str {
        "CreateVolume"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }

    fn required_fields(&self) -> Result<(), Status> {
        require(&self.name, "volume name is required")
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!("CreateVolume:{}", self.name))
    }

    // No volume_ref: the volume does not exist before this call, so the
    // require-volume check never applies to creates.
}

impl CsiRequest for csi::DeleteVolumeRequest {
    fn method(&self) -> &'static str {
        "DeleteVolume"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }

    fn required_fields(&self) -> Result<(), Status> {
        require(&self.volume_id, "volume id is required")
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!("DeleteVolume:{}", self.volume_id))
    }

    fn volume_ref(&self) -> Option<VolumeRef> {
        Some(VolumeRef::Id(self.volume_id.clone()))
    }

    fn missing_volume_is_success(&self) -> bool {
        true
    }
}

impl CsiRequest for csi::ControllerPublishVolumeRequest {
    fn method(&self) -> &'static str {
        "ControllerPublishVolume"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }

    fn required_fields(&self) -> Result<(), Status> {
        require(&self.volume_id, "volume id is required")?;
        require(&self.node_id, "node id is required")?;
        let capability = self
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volume capability is required"))?;
        if capability.access_mode.is_none() {
            return Err(Status::invalid_argument(
                "volume capability access mode is required",
            ));
        }
        Ok(())
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!(
            "ControllerPublishVolume:{}:{}",
            self.volume_id, self.node_id
        ))
    }

    fn volume_ref(&self) -> Option<VolumeRef> {
        Some(VolumeRef::Id(self.volume_id.clone()))
    }
}

impl CsiRequest for csi::ControllerUnpublishVolumeRequest {
    fn method(&self) -> &'static str {
        "ControllerUnpublishVolume"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }

    fn required_fields(&self) -> Result<(), Status> {
        require(&self.volume_id, "volume id is required")?;
        require(&self.node_id, "node id is required")
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!(
            "ControllerUnpublishVolume:{}:{}",
            self.volume_id, self.node_id
        ))
    }

    fn volume_ref(&self) -> Option<VolumeRef> {
        Some(VolumeRef::Id(self.volume_id.clone()))
    }
}

impl CsiRequest for csi::ValidateVolumeCapabilitiesRequest {
    fn method(&self) -> &'static str {
        "ValidateVolumeCapabilities"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }

    fn required_fields(&self) -> Result<(), Status> {
        require(&self.volume_id, "volume id is required")?;
        if self.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "volume capabilities are required",
            ));
        }
        Ok(())
    }
}

impl CsiRequest for csi::ListVolumesRequest {
    fn method(&self) -> &'static str {
        "ListVolumes"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }
}

impl CsiRequest for csi::GetCapacityRequest {
    fn method(&self) -> &'static str {
        "GetCapacity"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }
}

impl CsiRequest for csi::ControllerGetCapabilitiesRequest {
    fn method(&self) -> &'static str {
        "ControllerGetCapabilities"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }
}

impl CsiRequest for csi::ControllerProbeRequest {
    fn method(&self) -> &'static str {
        "ControllerProbe"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }
}

impl CsiRequest for csi::NodePublishVolumeRequest {
    fn method(&self) -> &'static str {
        "NodePublishVolume"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }

    fn required_fields(&self) -> Result<(), Status> {
        require(&self.volume_id, "volume id is required")?;
        require(&self.target_path, "target path is required")?;
        if self.volume_capability.is_none() {
            return Err(Status::invalid_argument("volume capability is required"));
        }
        Ok(())
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!(
            "NodePublishVolume:{}:{}",
            self.volume_id, self.target_path
        ))
    }

    fn volume_ref(&self) -> Option<VolumeRef> {
        Some(VolumeRef::Id(self.volume_id.clone()))
    }
}

impl CsiRequest for csi::NodeUnpublishVolumeRequest {
    fn method(&self) -> &'static str {
        "NodeUnpublishVolume"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }

    fn required_fields(&self) -> Result<(), Status> {
        require(&self.volume_id, "volume id is required")?;
        require(&self.target_path, "target path is required")
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!(
            "NodeUnpublishVolume:{}:{}",
            self.volume_id, self.target_path
        ))
    }

    fn volume_ref(&self) -> Option<VolumeRef> {
        Some(VolumeRef::Id(self.volume_id.clone()))
    }
}

impl CsiRequest for csi::NodeGetIdRequest {
    fn method(&self) -> &'static str {
        "NodeGetId"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }
}

impl CsiRequest for csi::NodeProbeRequest {
    fn method(&self) -> &'static str {
        "NodeProbe"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }
}

impl CsiRequest for csi::NodeGetCapabilitiesRequest {
    fn method(&self) -> &'static str {
        "NodeGetCapabilities"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }
}

impl CsiRequest for csi::GetPluginInfoRequest {
    fn method(&self) -> &'static str {
        "GetPluginInfo"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }
}

impl CsiRequest for csi::GetPluginCapabilitiesRequest {
    fn method(&self) -> &'static str {
        "GetPluginCapabilities"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }
}

impl CsiRequest for csi::ProbeRequest {
    fn method(&self) -> &'static str {
        "Probe"
    }

    fn version(&self) -> Option<&csi::Version> {
        self.version.as_ref()
    }
}
