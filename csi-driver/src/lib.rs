//! ScaleIO CSI Driver Library
//!
//! Kubernetes CSI driver fronting a ScaleIO block-storage cluster. The
//! controller service talks to the cluster's management gateway; the node
//! service works with the volumes the local SDC kernel agent exposes.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - The volume-lifecycle core shared by the three services
//! - The request-interceptor pipeline (request IDs, logging, spec
//!   validation, idempotency) assembled from runtime configuration

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v0");
}

pub mod cache;
pub mod caps;
pub mod controller;
pub mod gateway;
pub mod identity;
pub mod interceptors;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod service;

pub use controller::ControllerService;
pub use gateway::Gateway;
pub use identity::IdentityService;
pub use node::NodeService;
pub use service::{Opts, Plugin, RoleMode};
