//! Tunnel service: descriptor lookup and disconnect against the broker API

use crate::error::{ConfigError, TunnelError};
use async_trait::async_trait;
use exposr_proto::{parse_error_body, ErrorCode, TunnelDescriptor};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error};
use url::Url;

/// Request timeout for broker API calls
pub const API_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of tunnel descriptors. Injected into the [`Tunnel`](crate::Tunnel)
/// so tests can supply their own.
#[async_trait]
pub trait TunnelService: Send + Sync {
    /// Tunnel descriptor, from cache unless `force` is set.
    async fn read(&self, force: bool) -> Result<TunnelDescriptor, TunnelError>;

    /// Ask the broker to drop every transport of the tunnel. Returns whether
    /// the broker reported it disconnected.
    async fn disconnect(&self) -> Result<bool, TunnelError>;
}

#[derive(Debug, Deserialize)]
struct DisconnectResponse {
    #[serde(default)]
    disconnected: bool,
}

/// [`TunnelService`] backed by the broker's REST API
#[derive(Debug)]
pub struct HttpTunnelService {
    client: reqwest::Client,
    tunnel_url: Url,
    disconnect_url: Url,
    token: String,
    cached: Mutex<Option<TunnelDescriptor>>,
}

impl HttpTunnelService {
    pub fn new(server: &Url, tunnel_id: &str, token: impl Into<String>) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidServer(server.to_string());

        let mut tunnel_url = server.clone();
        tunnel_url.set_query(None);
        tunnel_url.set_fragment(None);
        {
            let mut segments = tunnel_url.path_segments_mut().map_err(|_| invalid())?;
            segments.pop_if_empty().extend(["v1", "tunnel", tunnel_id]);
        }
        let mut disconnect_url = tunnel_url.clone();
        disconnect_url
            .path_segments_mut()
            .map_err(|_| invalid())?
            .push("disconnect");

        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::InvalidServer(e.to_string()))?;

        Ok(Self {
            client,
            tunnel_url,
            disconnect_url,
            token: token.into(),
            cached: Mutex::new(None),
        })
    }

    pub fn tunnel_url(&self) -> &Url {
        &self.tunnel_url
    }

    fn check_token(&self) -> Result<&str, TunnelError> {
        if self.token.is_empty() {
            return Err(TunnelError::Server(ErrorCode::AuthNoAccessToken));
        }
        Ok(&self.token)
    }

    async fn fetch(&self) -> Result<TunnelDescriptor, TunnelError> {
        let token = self.check_token()?;
        let response = self
            .client
            .get(self.tunnel_url.clone())
            .bearer_auth(token)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(request_error)?;
        if status > 201 {
            let code = response_error(status, &body);
            error!("Failed to read tunnel configuration: {} ({})", code, status);
            return Err(TunnelError::Server(code));
        }

        serde_json::from_slice(&body)
            .map_err(|e| TunnelError::Service(format!("Invalid tunnel descriptor: {}", e)))
    }
}

#[async_trait]
impl TunnelService for HttpTunnelService {
    async fn read(&self, force: bool) -> Result<TunnelDescriptor, TunnelError> {
        let mut cached = self.cached.lock().await;
        if let (Some(descriptor), false) = (cached.as_ref(), force) {
            return Ok(descriptor.clone());
        }

        let descriptor = self.fetch().await?;
        debug!("Read tunnel {} descriptor", descriptor.id);
        *cached = Some(descriptor.clone());
        Ok(descriptor)
    }

    async fn disconnect(&self) -> Result<bool, TunnelError> {
        let token = self.check_token()?;
        let response = self
            .client
            .post(self.disconnect_url.clone())
            .bearer_auth(token)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(request_error)?;
        if status > 204 {
            return Err(TunnelError::Server(response_error(status, &body)));
        }

        Ok(serde_json::from_slice::<DisconnectResponse>(&body)
            .map(|r| r.disconnected)
            .unwrap_or(true))
    }
}

fn request_error(error: reqwest::Error) -> TunnelError {
    if error.is_timeout() {
        TunnelError::Server(ErrorCode::ServerTimeout)
    } else {
        TunnelError::Service(error.to_string())
    }
}

fn response_error(status: u16, body: &[u8]) -> ErrorCode {
    match parse_error_body(body) {
        Some(code) => code,
        None if status == 404 => ErrorCode::TunnelNotFound,
        None => ErrorCode::from_http_response(status, body),
    }
}
