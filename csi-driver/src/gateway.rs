//! Backend gateway seam.
//!
//! The lifecycle controller only sees this trait; production wires in
//! [`sio_client::Client`], tests inject an in-memory fake. Errors cross the
//! seam as [`GatewayError`] and are classified into protocol status codes at
//! each call site.
//!
//! Cancellation is not propagated across this seam: when an RPC deadline
//! expires, an in-flight gateway call still runs to completion and its
//! backend-side effect may land.

use sio_client::{GatewayError, ProvisionType, Sdc, StoragePool, System, Volume, VolumeCreate};

#[tonic::async_trait]
pub trait Gateway: Send + Sync {
    /// Establish (or refresh) the gateway session.
    async fn login(&self) -> Result<(), GatewayError>;

    /// Resolve the storage system handle by name.
    async fn find_system(&self, name: &str) -> Result<System, GatewayError>;

    /// Resolve a volume name to its backend id.
    async fn find_volume_id(&self, name: &str) -> Result<String, GatewayError>;

    async fn volume_by_id(&self, id: &str) -> Result<Volume, GatewayError>;

    async fn list_volumes(&self) -> Result<Vec<Volume>, GatewayError>;

    /// Create a volume and return its backend id.
    async fn create_volume(
        &self,
        name: &str,
        size_kib: u64,
        provision: ProvisionType,
        pool_id: &str,
    ) -> Result<String, GatewayError>;

    async fn remove_volume(&self, id: &str) -> Result<(), GatewayError>;

    async fn map_volume(&self, id: &str, sdc_id: &str) -> Result<(), GatewayError>;

    async fn unmap_volume(&self, id: &str, sdc_id: &str) -> Result<(), GatewayError>;

    async fn find_sdc(&self, system_id: &str, guid: &str) -> Result<Sdc, GatewayError>;

    async fn find_storage_pool(&self, name: &str) -> Result<StoragePool, GatewayError>;
}

#[tonic::async_trait]
impl Gateway for sio_client::Client {
    async fn login(&self) -> Result<(), GatewayError> {
        // Re-login refreshes an expired token; the client caches it.
        if self.logged_in().await {
            return Ok(());
        }
        sio_client::Client::login(self).await
    }

    async fn find_system(&self, name: &str) -> Result<System, GatewayError> {
        sio_client::Client::find_system(self, name).await
    }

    async fn find_volume_id(&self, name: &str) -> Result<String, GatewayError> {
        sio_client::Client::find_volume_id(self, name).await
    }

    async fn volume_by_id(&self, id: &str) -> Result<Volume, GatewayError> {
        sio_client::Client::volume_by_id(self, id).await
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, GatewayError> {
        sio_client::Client::list_volumes(self).await
    }

    async fn create_volume(
        &self,
        name: &str,
        size_kib: u64,
        provision: ProvisionType,
        pool_id: &str,
    ) -> Result<String, GatewayError> {
        let params = VolumeCreate {
            name: name.to_string(),
            volume_size_in_kb: size_kib.to_string(),
            volume_type: provision.as_str(),
            storage_pool_id: pool_id.to_string(),
        };
        sio_client::Client::create_volume(self, &params).await
    }

    async fn remove_volume(&self, id: &str) -> Result<(), GatewayError> {
        sio_client::Client::remove_volume(self, id).await
    }

    async fn map_volume(&self, id: &str, sdc_id: &str) -> Result<(), GatewayError> {
        sio_client::Client::map_volume(self, id, sdc_id).await
    }

    async fn unmap_volume(&self, id: &str, sdc_id: &str) -> Result<(), GatewayError> {
        sio_client::Client::unmap_volume(self, id, sdc_id).await
    }

    async fn find_sdc(&self, system_id: &str, guid: &str) -> Result<Sdc, GatewayError> {
        sio_client::Client::find_sdc(self, system_id, guid).await
    }

    async fn find_storage_pool(&self, name: &str) -> Result<StoragePool, GatewayError> {
        sio_client::Client::find_storage_pool(self, name).await
    }
}
