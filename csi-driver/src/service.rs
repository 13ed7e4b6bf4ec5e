//! Shared plugin core.
//!
//! One [`Plugin`] instance backs the identity, controller, and node
//! services: configuration, the probed gateway session, the SDC GUID, the
//! identity caches, and the volume-directory snapshot all live here and are
//! handed to the per-role service types as an `Arc`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tokio::sync::RwLock;
use tonic::Status;
use tracing::{debug, info, warn};

use sio_client::{GatewayError, ProvisionType, Volume};

use crate::cache::{IdCache, VolumeDirectory};
use crate::gateway::Gateway;
use crate::interceptors::{VolumeLookup, VolumeRef};
use crate::metrics;

/// Volume-create parameter selecting thick provisioning, overriding the
/// service-wide default.
pub const KEY_THICK_PROVISIONING: &str = "thickprovisioning";

/// SDC kernel agent's configuration binary, used to discover the local GUID
/// when it is not configured.
const DRV_CFG: &str = "/opt/emc/scaleio/sdc/bin/drv_cfg";

/// Which CSI method groups this process hosts. Decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleMode {
    Controller,
    Node,
    Both,
}

impl RoleMode {
    pub fn hosts_controller(self) -> bool {
        matches!(self, RoleMode::Controller | RoleMode::Both)
    }

    pub fn hosts_node(self) -> bool {
        matches!(self, RoleMode::Node | RoleMode::Both)
    }
}

/// Runtime options, resolved from flags/environment at startup.
#[derive(Debug, Clone, Default)]
pub struct Opts {
    /// ScaleIO gateway HTTP endpoint.
    pub endpoint: String,
    /// Gateway user (MDM credentials).
    pub user: String,
    pub password: String,
    /// Name of the storage system to operate on.
    pub system_name: String,
    /// GUID of the local SDC; discovered via drv_cfg when unset.
    pub sdc_guid: Option<String>,
    /// Skip gateway TLS verification.
    pub insecure: bool,
    /// Thick-provision new volumes by default.
    pub thick: bool,
    /// Private mount directory for node-side staging.
    pub priv_dir: PathBuf,
}

pub struct Plugin {
    opts: Opts,
    mode: RoleMode,
    gateway: Arc<dyn Gateway>,
    /// Backend id of the storage system; set by a successful controller
    /// probe and required by every mutating controller operation.
    system_id: RwLock<Option<String>>,
    /// Local SDC GUID; from configuration or discovered by node probe.
    sdc_guid: RwLock<Option<String>>,
    sdc_ids: IdCache,
    pool_ids: IdCache,
    directory: VolumeDirectory,
}

impl Plugin {
    pub fn new(opts: Opts, mode: RoleMode, gateway: Arc<dyn Gateway>) -> Self {
        let sdc_guid = opts.sdc_guid.clone();
        Self {
            opts,
            mode,
            gateway,
            system_id: RwLock::new(None),
            sdc_guid: RwLock::new(sdc_guid),
            sdc_ids: IdCache::new(),
            pool_ids: IdCache::new(),
            directory: VolumeDirectory::new(),
        }
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    pub fn mode(&self) -> RoleMode {
        self.mode
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub fn directory(&self) -> &VolumeDirectory {
        &self.directory
    }

    pub async fn clear_directory(&self) {
        self.directory.clear().await;
    }

    /// Establish the gateway session and resolve the storage-system handle.
    ///
    /// Idempotent: the session token and the system handle are cached, so a
    /// warm probe only performs the configuration checks.
    pub async fn controller_probe(&self) -> Result<(), Status> {
        if self.opts.endpoint.is_empty() {
            return Err(Status::failed_precondition(
                "missing ScaleIO Gateway endpoint",
            ));
        }
        if self.opts.user.is_empty() {
            return Err(Status::failed_precondition("missing ScaleIO MDM user"));
        }
        if self.opts.password.is_empty() {
            return Err(Status::failed_precondition("missing ScaleIO MDM password"));
        }
        if self.opts.system_name.is_empty() {
            return Err(Status::failed_precondition("missing ScaleIO system name"));
        }

        if let Err(e) = self.gateway.login().await {
            metrics::set_gateway_session(false);
            return Err(Status::failed_precondition(format!(
                "unable to login to ScaleIO Gateway: {}",
                e
            )));
        }

        let needs_system = self.system_id.read().await.is_none();
        if needs_system {
            let system = self.gateway.find_system(&self.opts.system_name).await.map_err(|e| {
                Status::failed_precondition(format!(
                    "unable to find matching ScaleIO system name: {}",
                    e
                ))
            })?;
            info!(system_id = %system.id, name = %self.opts.system_name, "resolved storage system");
            *self.system_id.write().await = Some(system.id);
        }

        metrics::set_gateway_session(true);
        Ok(())
    }

    /// The probed system id; `FailedPrecondition` when no probe succeeded.
    pub async fn require_probed(&self) -> Result<String, Status> {
        self.system_id.read().await.clone().ok_or_else(|| {
            Status::failed_precondition("controller service has not been probed")
        })
    }

    /// Verify node-side prerequisites: SDC GUID, kernel module, private dir.
    pub async fn node_probe(&self) -> Result<(), Status> {
        {
            let mut guid = self.sdc_guid.write().await;
            if guid.is_none() {
                let discovered = query_sdc_guid()?;
                info!(guid = %discovered, "set SDC GUID");
                *guid = Some(discovered);
            }
        }

        if !scini_loaded() {
            return Err(Status::failed_precondition(
                "scini kernel module not loaded",
            ));
        }

        fs::create_dir_all(&self.opts.priv_dir).map_err(|e| {
            Status::internal(format!(
                "plugin private dir: {} creation error: {}",
                self.opts.priv_dir.display(),
                e
            ))
        })?;

        Ok(())
    }

    pub async fn sdc_guid(&self) -> Option<String> {
        self.sdc_guid.read().await.clone()
    }

    /// Resolve a node's SDC GUID to its backend id through the identity
    /// cache.
    pub async fn sdc_id(&self, guid: &str) -> Result<String, Status> {
        let system_id = self.require_probed().await?;
        let gateway = self.gateway.clone();
        self.sdc_ids
            .resolve(guid, || async move {
                gateway
                    .find_sdc(&system_id, guid)
                    .await
                    .map(|sdc| sdc.id)
                    .map_err(|e| {
                        Status::not_found(format!(
                            "error finding SDC from GUID: {}, err: {}",
                            guid, e
                        ))
                    })
            })
            .await
    }

    /// Resolve a storage-pool name to its backend id through the identity
    /// cache.
    pub async fn pool_id(&self, name: &str) -> Result<String, Status> {
        self.require_probed().await?;
        let gateway = self.gateway.clone();
        self.pool_ids
            .resolve(name, || async move {
                gateway
                    .find_storage_pool(name)
                    .await
                    .map(|pool| pool.id)
                    .map_err(|e| match e {
                        GatewayError::NotFound(_) => Status::not_found(e.to_string()),
                        other => Status::internal(format!(
                            "error finding storage pool: {}",
                            other
                        )),
                    })
            })
            .await
    }

    pub async fn volume_by_id(&self, id: &str) -> Result<Volume, GatewayError> {
        self.gateway.volume_by_id(id).await
    }

    /// Provisioning mode for a new volume: the `thickprovisioning` create
    /// parameter wins over the service-wide default.
    pub fn provision_type(
        &self,
        params: &std::collections::HashMap<String, String>,
    ) -> ProvisionType {
        let mut provision = if self.opts.thick {
            ProvisionType::Thick
        } else {
            ProvisionType::Thin
        };

        if let Some(value) = params.get(KEY_THICK_PROVISIONING) {
            match value.parse::<bool>() {
                Ok(true) => provision = ProvisionType::Thick,
                Ok(false) => provision = ProvisionType::Thin,
                Err(_) => {
                    warn!(
                        "invalid boolean received `{}`=({}) in params",
                        KEY_THICK_PROVISIONING, value
                    );
                }
            }
        }

        provision
    }
}

#[tonic::async_trait]
impl VolumeLookup for Plugin {
    async fn volume_exists(&self, volume: &VolumeRef) -> Result<bool, Status> {
        self.require_probed().await?;

        match volume {
            VolumeRef::Id(id) => match self.gateway.volume_by_id(id).await {
                Ok(_) => Ok(true),
                Err(GatewayError::VolumeNotFound) => Ok(false),
                Err(e) => Err(Status::unavailable(format!(
                    "failure checking volume status: {}",
                    e
                ))),
            },
            VolumeRef::Name(name) => match self.gateway.find_volume_id(name).await {
                Ok(_) => Ok(true),
                Err(GatewayError::VolumeNotFound) | Err(GatewayError::NotFound(_)) => Ok(false),
                Err(e) => Err(Status::unavailable(format!(
                    "failure checking volume status: {}",
                    e
                ))),
            },
        }
    }
}

/// Query the local SDC GUID from the drv_cfg binary.
fn query_sdc_guid() -> Result<String, Status> {
    if !Path::new(DRV_CFG).exists() {
        return Err(Status::failed_precondition(
            "unable to get SDC GUID via config or drv_cfg binary",
        ));
    }

    let output = Command::new(DRV_CFG)
        .arg("--query_guid")
        .output()
        .map_err(|e| {
            Status::failed_precondition(format!("error getting SDC GUID: {}", e))
        })?;

    if !output.status.success() {
        return Err(Status::failed_precondition(format!(
            "error getting SDC GUID: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Whether the SDC kernel module is loaded.
fn scini_loaded() -> bool {
    match fs::read_to_string("/proc/modules") {
        Ok(modules) => modules
            .lines()
            .any(|line| line.split_whitespace().next() == Some("scini")),
        Err(e) => {
            debug!(error = %e, "unable to read /proc/modules");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn plugin_with_thick(thick: bool) -> Plugin {
        struct NoGateway;

        #[tonic::async_trait]
        impl Gateway for NoGateway {
            async fn login(&self) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn find_system(
                &self,
                _: &str,
            ) -> Result<sio_client::System, GatewayError> {
                unimplemented!()
            }
            async fn find_volume_id(&self, _: &str) -> Result<String, GatewayError> {
                unimplemented!()
            }
            async fn volume_by_id(&self, _: &str) -> Result<Volume, GatewayError> {
                unimplemented!()
            }
            async fn list_volumes(&self) -> Result<Vec<Volume>, GatewayError> {
                unimplemented!()
            }
            async fn create_volume(
                &self,
                _: &str,
                _: u64,
                _: ProvisionType,
                _: &str,
            ) -> Result<String, GatewayError> {
                unimplemented!()
            }
            async fn remove_volume(&self, _: &str) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn map_volume(&self, _: &str, _: &str) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn unmap_volume(&self, _: &str, _: &str) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn find_sdc(
                &self,
                _: &str,
                _: &str,
            ) -> Result<sio_client::Sdc, GatewayError> {
                unimplemented!()
            }
            async fn find_storage_pool(
                &self,
                _: &str,
            ) -> Result<sio_client::StoragePool, GatewayError> {
                unimplemented!()
            }
        }

        let opts = Opts {
            thick,
            ..Default::default()
        };
        Plugin::new(opts, RoleMode::Both, Arc::new(NoGateway))
    }

    #[test]
    fn provision_type_defaults_from_config() {
        let params = HashMap::new();
        assert_eq!(
            plugin_with_thick(false).provision_type(&params),
            ProvisionType::Thin
        );
        assert_eq!(
            plugin_with_thick(true).provision_type(&params),
            ProvisionType::Thick
        );
    }

    #[test]
    fn provision_type_param_overrides_config() {
        let plugin = plugin_with_thick(false);

        let mut params = HashMap::new();
        params.insert(KEY_THICK_PROVISIONING.to_string(), "true".to_string());
        assert_eq!(plugin.provision_type(&params), ProvisionType::Thick);

        params.insert(KEY_THICK_PROVISIONING.to_string(), "false".to_string());
        let thick_plugin = plugin_with_thick(true);
        assert_eq!(thick_plugin.provision_type(&params), ProvisionType::Thin);
    }

    #[test]
    fn provision_type_ignores_invalid_param() {
        let plugin = plugin_with_thick(true);
        let mut params = HashMap::new();
        params.insert(KEY_THICK_PROVISIONING.to_string(), "maybe".to_string());
        assert_eq!(plugin.provision_type(&params), ProvisionType::Thick);
    }

    #[tokio::test]
    async fn mutating_operations_require_probe() {
        let plugin = plugin_with_thick(false);
        let err = plugin.require_probed().await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }

    #[test]
    fn role_mode_method_groups() {
        assert!(RoleMode::Both.hosts_controller());
        assert!(RoleMode::Both.hosts_node());
        assert!(RoleMode::Controller.hosts_controller());
        assert!(!RoleMode::Controller.hosts_node());
        assert!(RoleMode::Node.hosts_node());
        assert!(!RoleMode::Node.hosts_controller());
    }
}
