use thiserror::Error;

/// The gateway reports a missing volume with this message; it is matched
/// case-insensitively and classified as [`GatewayError::VolumeNotFound`].
pub(crate) const GATEWAY_VOLUME_NOT_FOUND: &str = "Could not find the volume";

#[derive(Error, Debug)]
pub enum GatewayError {
    /// The gateway reported that the referenced volume does not exist.
    #[error("volume not found")]
    VolumeNotFound,

    /// A non-volume entity (system, SDC, storage pool) was not found.
    #[error("{0} not found")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("gateway error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid gateway response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
