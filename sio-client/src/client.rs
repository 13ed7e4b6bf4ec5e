//! Gateway HTTP client.
//!
//! Authentication follows the gateway's session model: `GET /api/login` with
//! basic credentials returns an opaque token, and every subsequent request
//! authenticates with `username:token`. The token is cached inside the
//! client; [`Client::login`] refreshes it and is cheap to call again.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{GATEWAY_VOLUME_NOT_FOUND, GatewayError, Result};
use crate::types::{Sdc, StoragePool, System, Volume, VolumeCreate};

/// Error body the gateway returns for failed API calls.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct CreatedId {
    id: String,
}

/// REST client for the ScaleIO management gateway.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    token: RwLock<Option<String>>,
}

impl Client {
    /// Build a client for the gateway at `endpoint` (e.g. `https://gw:443`).
    ///
    /// With `insecure` set, the gateway's certificate chain and hostname are
    /// not verified.
    pub fn new(endpoint: &str, username: &str, password: &str, insecure: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            token: RwLock::new(None),
        })
    }

    /// Authenticate and cache the session token.
    pub async fn login(&self) -> Result<()> {
        let url = format!("{}/api/login", self.endpoint);
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GatewayError::Unauthorized(
                "gateway rejected credentials".to_string(),
            ));
        }
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(classify(status.as_u16(), &body));
        }

        // The login endpoint returns the token as a JSON string literal.
        let token: String = serde_json::from_str(&body)
            .map_err(|e| GatewayError::InvalidResponse(format!("login token: {}", e)))?;

        *self.token.write().await = Some(token);
        debug!(endpoint = %self.endpoint, "gateway session established");
        Ok(())
    }

    /// Whether a session token is currently cached.
    pub async fn logged_in(&self) -> bool {
        self.token.read().await.is_some()
    }

    async fn token(&self) -> Result<String> {
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::Unauthorized("no gateway session".to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let token = self.token().await?;
        let url = format!("{}{}", self.endpoint, path);
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&token))
            .send()
            .await?;
        read_json(resp).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let token = self.token().await?;
        let url = format!("{}{}", self.endpoint, path);
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&token))
            .json(body)
            .send()
            .await?;
        read_json(resp).await
    }

    /// POST an action whose success response carries no body.
    async fn post_action(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        let token = self.token().await?;
        let url = format!("{}{}", self.endpoint, path);
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&token))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status.as_u16(), &body))
    }

    /// Resolve a volume name to its backend id.
    pub async fn find_volume_id(&self, name: &str) -> Result<String> {
        self.post(
            "/api/types/Volume/instances/action/queryIdByKey",
            &serde_json::json!({ "name": name }),
        )
        .await
    }

    /// Fetch one volume by backend id.
    pub async fn volume_by_id(&self, id: &str) -> Result<Volume> {
        self.get(&format!("/api/instances/Volume::{}", id)).await
    }

    /// Fetch the complete volume listing.
    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.get("/api/types/Volume/instances").await
    }

    /// Create a volume; returns the backend-assigned id.
    pub async fn create_volume(&self, params: &VolumeCreate) -> Result<String> {
        let body = serde_json::to_value(params)
            .map_err(|e| GatewayError::InvalidResponse(format!("encoding create: {}", e)))?;
        let created: CreatedId = self.post("/api/types/Volume/instances", &body).await?;
        Ok(created.id)
    }

    /// Remove a volume. Only the volume itself is removed, never descendants.
    pub async fn remove_volume(&self, id: &str) -> Result<()> {
        self.post_action(
            &format!("/api/instances/Volume::{}/action/removeVolume", id),
            &serde_json::json!({ "removeMode": "ONLY_ME" }),
        )
        .await
    }

    /// Map a volume to a single SDC.
    pub async fn map_volume(&self, id: &str, sdc_id: &str) -> Result<()> {
        self.post_action(
            &format!("/api/instances/Volume::{}/action/addMappedSdc", id),
            &serde_json::json!({
                "sdcId": sdc_id,
                "allowMultipleMappings": "false",
            }),
        )
        .await
    }

    /// Unmap a volume from an SDC, ignoring the SDC's SCSI initiator state.
    pub async fn unmap_volume(&self, id: &str, sdc_id: &str) -> Result<()> {
        self.post_action(
            &format!("/api/instances/Volume::{}/action/removeMappedSdc", id),
            &serde_json::json!({
                "sdcId": sdc_id,
                "ignoreScsiInitiators": "true",
            }),
        )
        .await
    }

    /// Locate the storage system by name (or id, which the gateway also
    /// accepts as a name match).
    pub async fn find_system(&self, name: &str) -> Result<System> {
        let systems: Vec<System> = self.get("/api/types/System/instances").await?;
        systems
            .into_iter()
            .find(|s| s.name == name || s.id == name)
            .ok_or_else(|| GatewayError::NotFound(format!("system '{}'", name)))
    }

    /// Locate an SDC registered with `system_id` by its GUID.
    pub async fn find_sdc(&self, system_id: &str, guid: &str) -> Result<Sdc> {
        let sdcs: Vec<Sdc> = self
            .get(&format!(
                "/api/instances/System::{}/relationships/Sdc",
                system_id
            ))
            .await?;
        sdcs.into_iter()
            .find(|s| s.sdc_guid.eq_ignore_ascii_case(guid))
            .ok_or_else(|| GatewayError::NotFound(format!("SDC with GUID '{}'", guid)))
    }

    /// Locate a storage pool by name.
    pub async fn find_storage_pool(&self, name: &str) -> Result<StoragePool> {
        let pools: Vec<StoragePool> = self.get("/api/types/StoragePool/instances").await?;
        pools
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| GatewayError::NotFound(format!("storage pool '{}'", name)))
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(classify(status.as_u16(), &body));
    }
    serde_json::from_str(&body)
        .map_err(|e| GatewayError::InvalidResponse(format!("{} in body: {}", e, body)))
}

/// Map a gateway error reply onto the client error taxonomy.
fn classify(status: u16, body: &str) -> GatewayError {
    let message = match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) if !parsed.message.is_empty() => parsed.message,
        _ => body.to_string(),
    };

    if message
        .to_ascii_lowercase()
        .contains(&GATEWAY_VOLUME_NOT_FOUND.to_ascii_lowercase())
    {
        return GatewayError::VolumeNotFound;
    }
    if status == 401 {
        return GatewayError::Unauthorized(message);
    }
    warn!(status, message = %message, "gateway call failed");
    GatewayError::Api { status, message }
}
