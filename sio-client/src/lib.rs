//! ScaleIO Gateway REST client
//!
//! Typed HTTP client for the ScaleIO management gateway. Handles session
//! authentication (login token, cached for the life of the client) and the
//! volume, system, SDC, and storage-pool operations the CSI plugin needs.
//!
//! The gateway is the authority for all volume state; this crate only
//! transports and classifies its answers.

pub mod client;
pub mod error;
pub mod types;

pub use client::Client;
pub use error::GatewayError;
pub use types::{MappedSdcInfo, ProvisionType, Sdc, StoragePool, System, Volume, VolumeCreate};
