//! CSI Identity Service Implementation
//!
//! Provides plugin identification and capability reporting to Kubernetes.
//! The shared Probe fans out to the controller and/or node probe depending
//! on which method groups this process hosts.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::csi;
use crate::interceptors::Pipeline;
use crate::service::Plugin;

pub const DRIVER_NAME: &str = "scaleio.csi.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// CSI Identity Service
///
/// Implements the CSI Identity service which provides:
/// - Plugin identification (name and version)
/// - Plugin capability reporting
/// - Readiness probing
pub struct IdentityService {
    plugin: Arc<Plugin>,
    pipeline: Arc<Pipeline>,
}

impl IdentityService {
    pub fn new(plugin: Arc<Plugin>, pipeline: Arc<Pipeline>) -> Self {
        Self { plugin, pipeline }
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    /// Returns the name and version of the CSI plugin.
    async fn get_plugin_info(
        &self,
        request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |_req| async {
                let mut manifest = HashMap::new();
                manifest.insert(
                    "url".to_string(),
                    "https://github.com/scaleio-csi/scaleio-csi".to_string(),
                );

                Ok(csi::GetPluginInfoResponse {
                    name: DRIVER_NAME.to_string(),
                    vendor_version: DRIVER_VERSION.to_string(),
                    manifest,
                })
            })
            .await
    }

    /// Returns the capabilities of the CSI plugin.
    async fn get_plugin_capabilities(
        &self,
        request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |_req| async move {
                // A node-only process does not advertise the controller
                // service.
                let capabilities = if self.plugin.mode().hosts_controller() {
                    vec![csi::PluginCapability {
                        r#type: Some(csi::plugin_capability::Type::Service(
                            csi::plugin_capability::Service {
                                r#type: csi::plugin_capability::service::Type::ControllerService
                                    as i32,
                            },
                        )),
                    }]
                } else {
                    vec![]
                };

                Ok(csi::GetPluginCapabilitiesResponse { capabilities })
            })
            .await
    }

    /// Probes the plugin to check if it is ready.
    async fn probe(
        &self,
        request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        let req = request.into_inner();
        self.pipeline
            .call(req, |_req| async move {
                if self.plugin.mode().hosts_controller() {
                    self.plugin.controller_probe().await?;
                }
                if self.plugin.mode().hosts_node() {
                    self.plugin.node_probe().await?;
                }
                Ok(csi::ProbeResponse {})
            })
            .await
    }
}
