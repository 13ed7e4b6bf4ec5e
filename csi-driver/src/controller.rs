//! CSI Controller Service Implementation
//!
//! Volume lifecycle operations against the ScaleIO gateway: create, delete,
//! publish/unpublish to SDCs, capability validation, and the cached
//! paginated listing. Every RPC is dispatched through the interceptor
//! pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info};

use sio_client::{GatewayError, Volume};

use crate::caps::{self, ERR_NO_MULTI_NODE_WRITER, ERR_NO_MULTI_MAP, ERR_UNKNOWN_ACCESS_MODE};
use crate::csi;
use crate::csi::volume_capability::access_mode::Mode;
use crate::interceptors::Pipeline;
use crate::service::Plugin;

/// Key used to get the storage-pool name from the volume create parameters.
pub const KEY_STORAGE_POOL: &str = "storagepool";

/// Number of bytes in a kibibyte.
pub const BYTES_IN_KIB: u64 = 1024;

/// Number of kibibytes in a gibibyte.
pub const KIB_IN_GIB: u64 = 1024 * 1024;

/// Number of bytes in a gibibyte.
pub const BYTES_IN_GIB: u64 = KIB_IN_GIB * BYTES_IN_KIB;

/// Default volume size when the request gives none, in KiB (16 GiB).
pub const DEFAULT_VOLUME_SIZE_KIB: u64 = 16 * KIB_IN_GIB;

/// The cluster allocates volumes in multiples of this many GiB.
pub const VOL_SIZE_MULTIPLE_GIB: u64 = 8;

/// CSI Controller Service
///
/// The lifecycle controller proper: consults the identity caches and the
/// volume directory on the shared [`Plugin`] core, calls the gateway, and
/// maps backend failures onto protocol status codes at each call site.
pub struct ControllerService {
    plugin: Arc<Plugin>,
    pipeline: Arc<Pipeline>,
}

impl ControllerService {
    pub fn new(plugin: Arc<Plugin>, pipeline: Arc<Pipeline>) -> Self {
        Self { plugin, pipeline }
    }

    async fn do_create_volume(
        &self,
        req: csi::CreateVolumeRequest,
    ) -> Result<csi::CreateVolumeResponse, Status> {
        self.plugin.require_probed().await?;

        let size_kib = validate_vol_size(req.capacity_range.as_ref())?;

        let params = &req.parameters;
        let pool_name = params.get(KEY_STORAGE_POOL).ok_or_else(|| {
            Status::invalid_argument(format!(
                "`{}` is a required parameter",
                KEY_STORAGE_POOL
            ))
        })?;

        let provision = self.plugin.provision_type(params);

        let name = &req.name;
        if name.is_empty() {
            return Err(Status::invalid_argument("volume name is required"));
        }

        info!(
            name = %name,
            size_kib,
            storage_pool = %pool_name,
            provision = ?provision,
            "creating volume"
        );

        let pool_id = self.plugin.pool_id(pool_name).await?;

        let gateway = self.plugin.gateway();
        let id = gateway
            .create_volume(name, size_kib, provision, &pool_id)
            .await
            .map_err(|e| Status::internal(format!("error when creating volume: {}", e)))?;

        let vol = gateway.volume_by_id(&id).await.map_err(|e| {
            Status::unavailable(format!("error retrieving volume details: {}", e))
        })?;

        self.plugin.clear_directory().await;

        Ok(csi::CreateVolumeResponse {
            volume_info: Some(volume_info(&vol)),
        })
    }

    async fn do_delete_volume(
        &self,
        req: csi::DeleteVolumeRequest,
    ) -> Result<csi::DeleteVolumeResponse, Status> {
        self.plugin.require_probed().await?;

        let id = &req.volume_id;
        if id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }

        let vol = match self.plugin.volume_by_id(id).await {
            Ok(vol) => vol,
            Err(GatewayError::VolumeNotFound) => {
                // Not found is a successful delete.
                debug!(volume_id = %id, "volume not found, treating as already deleted");
                return Ok(csi::DeleteVolumeResponse {});
            }
            Err(e) => {
                return Err(Status::internal(format!(
                    "failure checking volume status before deletion: {}",
                    e
                )));
            }
        };

        if let Some(mapping) = vol.mapped_sdc_info.first() {
            return Err(Status::failed_precondition(format!(
                "volume in use by {}",
                mapping.sdc_id
            )));
        }

        self.plugin
            .gateway()
            .remove_volume(id)
            .await
            .map_err(|e| Status::internal(format!("error removing volume: {}", e)))?;

        self.plugin.clear_directory().await;

        info!(volume_id = %id, "volume deleted");
        Ok(csi::DeleteVolumeResponse {})
    }

    async fn do_controller_publish_volume(
        &self,
        req: csi::ControllerPublishVolumeRequest,
    ) -> Result<csi::ControllerPublishVolumeResponse, Status> {
        self.plugin.require_probed().await?;

        let vol_id = &req.volume_id;
        if vol_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }

        let vol = match self.plugin.volume_by_id(vol_id).await {
            Ok(vol) => vol,
            Err(GatewayError::VolumeNotFound) => {
                return Err(Status::not_found("volume not found"));
            }
            Err(e) => {
                return Err(Status::internal(format!(
                    "failure checking volume status before controller publish: {}",
                    e
                )));
            }
        };

        if req.node_id.is_empty() {
            return Err(Status::invalid_argument("node id is required"));
        }
        let sdc_id = self.plugin.sdc_id(&req.node_id).await?;

        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volume capability is required"))?;
        let access_mode = capability
            .access_mode
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("access mode is required"))?;

        let mode = Mode::try_from(access_mode.mode).unwrap_or(Mode::Unknown);
        if mode == Mode::Unknown {
            return Err(Status::invalid_argument(ERR_UNKNOWN_ACCESS_MODE));
        }

        if !vol.mapped_sdc_info.is_empty() {
            let is_block = caps::access_type_is_block(std::slice::from_ref(capability));

            if vol.mapped_sdc_info.iter().any(|m| m.sdc_id == sdc_id) {
                // Re-publish to the same SDC is an idempotent success.
                debug!(volume_id = %vol_id, sdc_id = %sdc_id, "volume already mapped");
                return Ok(csi::ControllerPublishVolumeResponse {
                    publish_info: HashMap::new(),
                });
            }

            if !vol.mapping_to_all_sdcs_enabled {
                return Err(Status::already_exists(ERR_NO_MULTI_MAP));
            }

            match mode {
                Mode::SingleNodeWriter | Mode::SingleNodeReaderOnly => {
                    let holder = vol
                        .mapped_sdc_info
                        .first()
                        .map(|m| m.sdc_id.clone())
                        .unwrap_or_default();
                    return Err(Status::already_exists(format!(
                        "volume already published to SDC id: {}",
                        holder
                    )));
                }
                Mode::MultiNodeSingleWriter | Mode::MultiNodeMultiWriter => {
                    return Err(Status::invalid_argument(ERR_NO_MULTI_NODE_WRITER));
                }
                _ => {}
            }

            if !is_block {
                // Multi-mapping mount volumes is never allowed.
                return Err(Status::already_exists(
                    "mount volumes may not be mapped to multiple hosts",
                ));
            }
        }

        self.plugin
            .gateway()
            .map_volume(&vol.id, &sdc_id)
            .await
            .map_err(|e| Status::internal(format!("error mapping volume to node: {}", e)))?;

        info!(volume_id = %vol_id, sdc_id = %sdc_id, "volume published");
        Ok(csi::ControllerPublishVolumeResponse {
            publish_info: HashMap::new(),
        })
    }

    async fn do_controller_unpublish_volume(
        &self,
        req: csi::ControllerUnpublishVolumeRequest,
    ) -> Result<csi::ControllerUnpublishVolumeResponse, Status> {
        self.plugin.require_probed().await?;

        let vol_id = &req.volume_id;
        if vol_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }

        let vol = match self.plugin.volume_by_id(vol_id).await {
            Ok(vol) => vol,
            Err(GatewayError::VolumeNotFound) => {
                return Err(Status::not_found("volume not found"));
            }
            Err(e) => {
                return Err(Status::internal(format!(
                    "failure checking volume status before controller unpublish: {}",
                    e
                )));
            }
        };

        if req.node_id.is_empty() {
            return Err(Status::invalid_argument("node id is required"));
        }
        let sdc_id = self.plugin.sdc_id(&req.node_id).await?;

        if !vol.mapped_sdc_info.iter().any(|m| m.sdc_id == sdc_id) {
            // Already detached from this SDC.
            return Ok(csi::ControllerUnpublishVolumeResponse {});
        }

        self.plugin
            .gateway()
            .unmap_volume(&vol.id, &sdc_id)
            .await
            .map_err(|e| {
                Status::internal(format!("error unmapping volume from node: {}", e))
            })?;

        info!(volume_id = %vol_id, sdc_id = %sdc_id, "volume unpublished");
        Ok(csi::ControllerUnpublishVolumeResponse {})
    }

    async fn do_validate_volume_capabilities(
        &self,
        req: csi::ValidateVolumeCapabilitiesRequest,
    ) -> Result<csi::ValidateVolumeCapabilitiesResponse, Status> {
        self.plugin.require_probed().await?;

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }

        let vol = match self.plugin.volume_by_id(&req.volume_id).await {
            Ok(vol) => vol,
            Err(GatewayError::VolumeNotFound) => {
                return Err(Status::not_found("volume not found"));
            }
            Err(e) => {
                return Err(Status::internal(format!(
                    "failure checking volume status for capabilities: {}",
                    e
                )));
            }
        };

        Ok(match caps::validate(&req.volume_capabilities, &vol) {
            Ok(()) => csi::ValidateVolumeCapabilitiesResponse {
                supported: true,
                message: String::new(),
            },
            Err(reason) => csi::ValidateVolumeCapabilitiesResponse {
                supported: false,
                message: reason.to_string(),
            },
        })
    }

    async fn do_list_volumes(
        &self,
        req: csi::ListVolumesRequest,
    ) -> Result<csi::ListVolumesResponse, Status> {
        self.plugin.require_probed().await?;

        let start: u32 = if req.starting_token.is_empty() {
            0
        } else {
            req.starting_token.parse().map_err(|_| {
                Status::aborted(format!(
                    "unable to parse startingToken: {}",
                    req.starting_token
                ))
            })?
        };

        let gateway = self.plugin.gateway().clone();
        let (vols, next) = self
            .plugin
            .directory()
            .page(start, req.max_entries, || async move {
                gateway
                    .list_volumes()
                    .await
                    .map_err(|e| Status::internal(format!("unable to list volumes: {}", e)))
            })
            .await?;

        let entries = vols
            .iter()
            .map(|vol| csi::list_volumes_response::Entry {
                volume_info: Some(volume_info(vol)),
            })
            .collect();

        Ok(csi::ListVolumesResponse {
            entries,
            next_token: next.map(|n| n.to_string()).unwrap_or_default(),
        })
    }
}

/// Determine the size of the volume to create from the capacity range,
/// in KiB.
///
/// The cluster allocates volumes in 8 GiB multiples, so the requested size
/// always rounds up to the next multiple; an unspecified size takes the
/// default. Fails with `OutOfRange` when the rounded size exceeds the
/// requested limit rather than silently truncating.
fn validate_vol_size(range: Option<&csi::CapacityRange>) -> Result<u64, Status> {
    let (required, limit) = range
        .map(|r| (r.required_bytes, r.limit_bytes))
        .unwrap_or((0, 0));

    let min_kib = if required == 0 {
        DEFAULT_VOLUME_SIZE_KIB
    } else {
        required.div_ceil(BYTES_IN_KIB)
    };

    let mut size_gib = min_kib.div_ceil(KIB_IN_GIB);
    let rem = size_gib % VOL_SIZE_MULTIPLE_GIB;
    if rem > 0 {
        size_gib = size_gib - rem + VOL_SIZE_MULTIPLE_GIB;
    }

    let size_bytes = size_gib * BYTES_IN_GIB;
    if limit != 0 && size_bytes > limit {
        return Err(Status::out_of_range(format!(
            "volume size {} > limit_bytes: {}",
            size_bytes, limit
        )));
    }

    Ok(size_gib * KIB_IN_GIB)
}

/// Convert a gateway volume to the protocol volume info.
fn volume_info(vol: &Volume) -> csi::VolumeInfo {
    csi::VolumeInfo {
        capacity_bytes: vol.size_in_kb * BYTES_IN_KIB,
        id: vol.id.clone(),
        attributes: HashMap::new(),
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |req| self.do_create_volume(req))
            .await
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |req| self.do_delete_volume(req))
            .await
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |req| self.do_controller_publish_volume(req))
            .await
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |req| self.do_controller_unpublish_volume(req))
            .await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |req| self.do_validate_volume_capabilities(req))
            .await
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |req| self.do_list_volumes(req))
            .await
    }

    /// Capacity queries are deliberately not wired to the backend.
    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |_req| async move {
                self.plugin.require_probed().await?;
                Err::<csi::GetCapacityResponse, _>(Status::unimplemented(
                    "capacity query is not supported",
                ))
            })
            .await
    }

    async fn controller_get_capabilities(
        &self,
        request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let req = request.into_inner();
        self.pipeline
            .call(req, |_req| async {
                let capabilities = [
                    Type::CreateDeleteVolume,
                    Type::PublishUnpublishVolume,
                    Type::ListVolumes,
                ]
                .into_iter()
                .map(|rpc| csi::ControllerServiceCapability {
                    r#type: Some(csi::controller_service_capability::Type::Rpc(
                        csi::controller_service_capability::Rpc {
                            r#type: rpc as i32,
                        },
                    )),
                })
                .collect();

                Ok(csi::ControllerGetCapabilitiesResponse { capabilities })
            })
            .await
    }

    async fn controller_probe(
        &self,
        request: Request<csi::ControllerProbeRequest>,
    ) -> Result<Response<csi::ControllerProbeResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |_req| async move {
                self.plugin.controller_probe().await?;
                Ok(csi::ControllerProbeResponse {})
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(required: u64, limit: u64) -> csi::CapacityRange {
        csi::CapacityRange {
            required_bytes: required,
            limit_bytes: limit,
        }
    }

    #[test]
    fn size_defaults_to_sixteen_gib() {
        assert_eq!(validate_vol_size(None).unwrap(), DEFAULT_VOLUME_SIZE_KIB);
        assert_eq!(
            validate_vol_size(Some(&range(0, 0))).unwrap(),
            DEFAULT_VOLUME_SIZE_KIB
        );
    }

    #[test]
    fn size_rounds_up_to_eight_gib_multiples() {
        // 10 GiB rounds up to 16 GiB.
        let size = validate_vol_size(Some(&range(10 * BYTES_IN_GIB, 0))).unwrap();
        assert_eq!(size, 16 * KIB_IN_GIB);

        // Exact multiples stay as-is.
        let size = validate_vol_size(Some(&range(8 * BYTES_IN_GIB, 0))).unwrap();
        assert_eq!(size, 8 * KIB_IN_GIB);

        let size = validate_vol_size(Some(&range(24 * BYTES_IN_GIB, 0))).unwrap();
        assert_eq!(size, 24 * KIB_IN_GIB);
    }

    #[test]
    fn size_rounding_is_always_upward() {
        // Sub-GiB requests land on the first multiple, never zero.
        let size = validate_vol_size(Some(&range(100 * 1024 * 1024, 0))).unwrap();
        assert_eq!(size, 8 * KIB_IN_GIB);

        let size = validate_vol_size(Some(&range(1, 0))).unwrap();
        assert_eq!(size, 8 * KIB_IN_GIB);

        // The granted size is a multiple of the unit and at least the ask.
        for required in [1, BYTES_IN_GIB, 9 * BYTES_IN_GIB, 63 * BYTES_IN_GIB] {
            let kib = validate_vol_size(Some(&range(required, 0))).unwrap();
            assert_eq!(kib % (VOL_SIZE_MULTIPLE_GIB * KIB_IN_GIB), 0);
            assert!(kib * BYTES_IN_KIB >= required);
        }
    }

    #[test]
    fn size_exceeding_limit_is_out_of_range() {
        // 10 GiB rounds to 16 GiB, past the 12 GiB limit.
        let err =
            validate_vol_size(Some(&range(10 * BYTES_IN_GIB, 12 * BYTES_IN_GIB))).unwrap_err();
        assert_eq!(err.code(), tonic::Code::OutOfRange);

        // A limit the rounded size fits under is fine.
        let size =
            validate_vol_size(Some(&range(8 * BYTES_IN_GIB, 8 * BYTES_IN_GIB))).unwrap();
        assert_eq!(size, 8 * KIB_IN_GIB);
    }

    #[test]
    fn volume_info_reports_bytes() {
        let vol = Volume {
            id: "vol-1".to_string(),
            size_in_kb: 16 * KIB_IN_GIB,
            ..Default::default()
        };
        let info = volume_info(&vol);
        assert_eq!(info.id, "vol-1");
        assert_eq!(info.capacity_bytes, 16 * BYTES_IN_GIB);
    }
}
