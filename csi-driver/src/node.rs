//! CSI Node Service Implementation
//!
//! Publishes volumes the local SDC kernel agent has attached. The agent
//! exposes mapped volumes as `emc-vol-<system>-<volume>` links under
//! /dev/disk/by-id; the attachment resolver finds the device for a volume
//! id there, and mount operations are delegated to the `mount` module.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::csi;
use crate::interceptors::Pipeline;
use crate::mount;
use crate::service::Plugin;

/// Prefix of the by-id links the SDC agent creates for mapped volumes.
const SDC_DEVICE_PREFIX: &str = "emc-vol-";

/// Filesystem used when the capability names none.
const DEFAULT_FS_TYPE: &str = "ext4";

/// A volume the SDC has attached to this host.
#[derive(Debug, Clone)]
pub struct MappedVolume {
    pub volume_id: String,
    pub device_path: PathBuf,
}

/// Enumerates the host's currently-attached volumes.
///
/// A collaborator seam: production scans the device directory, tests inject
/// a fixed listing.
pub trait LocalAttachments: Send + Sync {
    fn list(&self) -> Result<Vec<MappedVolume>, Status>;
}

/// Scans `/dev/disk/by-id` for the SDC's volume links.
pub struct DiskByIdAttachments {
    dir: PathBuf,
}

impl DiskByIdAttachments {
    pub fn new() -> Self {
        Self {
            dir: PathBuf::from("/dev/disk/by-id"),
        }
    }

    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl Default for DiskByIdAttachments {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAttachments for DiskByIdAttachments {
    fn list(&self) -> Result<Vec<MappedVolume>, Status> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            Status::internal(format!(
                "unable to read device dir {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut attached = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(suffix) = name.strip_prefix(SDC_DEVICE_PREFIX) else {
                continue;
            };

            // Link names are emc-vol-<system>-<volume>; the volume id is
            // the last dash-separated segment.
            let Some(volume_id) = suffix.rsplit('-').next() else {
                continue;
            };

            let link = entry.path();
            let device_path = fs::canonicalize(&link).unwrap_or(link);
            attached.push(MappedVolume {
                volume_id: volume_id.to_string(),
                device_path,
            });
        }

        Ok(attached)
    }
}

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume publishing (mount or bind the SDC device at the target path)
/// - Volume unpublishing
/// - Node identification (the SDC GUID)
/// - Node probing and capability reporting
pub struct NodeService {
    plugin: Arc<Plugin>,
    pipeline: Arc<Pipeline>,
    attachments: Arc<dyn LocalAttachments>,
}

impl NodeService {
    pub fn new(
        plugin: Arc<Plugin>,
        pipeline: Arc<Pipeline>,
        attachments: Arc<dyn LocalAttachments>,
    ) -> Self {
        Self {
            plugin,
            pipeline,
            attachments,
        }
    }

    /// Find the local attachment for `volume_id`.
    fn resolve_attachment(&self, volume_id: &str) -> Result<MappedVolume, Status> {
        self.attachments
            .list()?
            .into_iter()
            .find(|v| v.volume_id == volume_id)
            .ok_or_else(|| {
                Status::unavailable(format!("volume: {} not published to node", volume_id))
            })
    }

    async fn do_node_publish_volume(
        &self,
        req: csi::NodePublishVolumeRequest,
    ) -> Result<csi::NodePublishVolumeResponse, Status> {
        let volume_id = &req.volume_id;
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }

        let target_path = &req.target_path;
        if target_path.is_empty() {
            return Err(Status::invalid_argument("target path is required"));
        }
        mount::validate_path(target_path)?;

        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volume capability is required"))?;

        let attachment = self.resolve_attachment(volume_id)?;

        info!(
            volume_id = %volume_id,
            device = %attachment.device_path.display(),
            target_path = %target_path,
            "NodePublishVolume request"
        );

        match &capability.access_type {
            Some(csi::volume_capability::AccessType::Block(_)) => {
                mount::publish_block(
                    &attachment.device_path,
                    Path::new(target_path),
                    req.readonly,
                )?;
            }
            Some(csi::volume_capability::AccessType::Mount(m)) => {
                let fs_type = if m.fs_type.is_empty() {
                    DEFAULT_FS_TYPE
                } else {
                    &m.fs_type
                };
                let staging = self.plugin.opts().priv_dir.join(volume_id);
                mount::publish_mount(
                    &attachment.device_path,
                    &staging,
                    Path::new(target_path),
                    fs_type,
                    &m.mount_flags,
                    req.readonly,
                )?;
            }
            None => {
                return Err(Status::invalid_argument(
                    "volume capability access type is required",
                ));
            }
        }

        Ok(csi::NodePublishVolumeResponse {})
    }

    async fn do_node_unpublish_volume(
        &self,
        req: csi::NodeUnpublishVolumeRequest,
    ) -> Result<csi::NodeUnpublishVolumeResponse, Status> {
        let volume_id = &req.volume_id;
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }

        let target_path = &req.target_path;
        if target_path.is_empty() {
            return Err(Status::invalid_argument("target path is required"));
        }
        mount::validate_path(target_path)?;

        // The device must still be attached here; detaching is the
        // controller's job and happens after unpublish.
        self.resolve_attachment(volume_id)?;

        debug!(volume_id = %volume_id, target_path = %target_path, "NodeUnpublishVolume request");

        mount::unmount_if_mounted(Path::new(target_path))?;

        let staging = self.plugin.opts().priv_dir.join(volume_id);
        mount::release_staging(&staging);

        Ok(csi::NodeUnpublishVolumeResponse {})
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |req| self.do_node_publish_volume(req))
            .await
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |req| self.do_node_unpublish_volume(req))
            .await
    }

    async fn node_get_id(
        &self,
        request: Request<csi::NodeGetIdRequest>,
    ) -> Result<Response<csi::NodeGetIdResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |_req| async move {
                match self.plugin.sdc_guid().await {
                    Some(guid) => Ok(csi::NodeGetIdResponse { node_id: guid }),
                    None => Err(Status::failed_precondition(
                        "Unable to get Node ID. Either it is not configured, \
                         or Node Service has not been probed",
                    )),
                }
            })
            .await
    }

    async fn node_probe(
        &self,
        request: Request<csi::NodeProbeRequest>,
    ) -> Result<Response<csi::NodeProbeResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |_req| async move {
                self.plugin.node_probe().await?;
                Ok(csi::NodeProbeResponse {})
            })
            .await
    }

    async fn node_get_capabilities(
        &self,
        request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |_req| async {
                Ok(csi::NodeGetCapabilitiesResponse {
                    capabilities: vec![],
                })
            })
            .await
    }
}
