//! Client side WebSocket connector

use async_trait::async_trait;
use exposr_proto::ErrorCode;
use exposr_transport::{
    TransportConfig, TransportConnector, TransportError, TransportResult,
};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as WsProtocolConfig;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info};
use url::{Host, Url};

use crate::config::WebSocketConfig;
use crate::connection::WebSocketConnection;

/// Connects to a broker transport endpoint over `ws://` or `wss://`
pub struct WebSocketConnector {
    tls_connector: tokio_rustls::TlsConnector,
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector").finish()
    }
}

impl WebSocketConnector {
    pub fn new(config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        TransportConfig::validate(&*config)?;

        let tls_connector = config.build_tls_connector()?;

        debug!("WebSocket connector created");

        Ok(Self {
            tls_connector,
            config,
        })
    }

    fn protocol_config(&self) -> WsProtocolConfig {
        let mut config = WsProtocolConfig::default();
        config.max_message_size = Some(self.config.max_message_size);
        config.max_frame_size = Some(self.config.max_message_size);
        config
    }
}

/// Host part of `url` in a form `TcpStream::connect` and rustls accept.
fn connect_host(url: &Url) -> TransportResult<String> {
    match url.host() {
        Some(Host::Domain(domain)) => Ok(domain.to_string()),
        Some(Host::Ipv4(ip)) => Ok(ip.to_string()),
        Some(Host::Ipv6(ip)) => Ok(ip.to_string()),
        None => Err(TransportError::ConfigurationError(format!(
            "Transport endpoint has no host: {}",
            url
        ))),
    }
}

/// Map a failed WebSocket handshake.
///
/// A regular HTTP response instead of `101 Switching Protocols` means the
/// broker refused the connection; its body may carry an error code.
fn handshake_error(error: WsError) -> TransportError {
    match error {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            let body = response.body().as_deref().unwrap_or_default();
            TransportError::Rejected {
                status,
                code: ErrorCode::from_http_response(status, body),
            }
        }
        WsError::Io(e) => TransportError::IoError(e),
        other => TransportError::ConnectionError(format!("WebSocket handshake failed: {}", other)),
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    type Connection = WebSocketConnection;

    async fn connect(&self, endpoint: &Url) -> TransportResult<Self::Connection> {
        let secure = match endpoint.scheme() {
            "wss" => true,
            "ws" => false,
            other => {
                return Err(TransportError::ConfigurationError(format!(
                    "Unsupported transport scheme: {}",
                    other
                )))
            }
        };
        let host = connect_host(endpoint)?;
        let port = endpoint.port_or_known_default().ok_or_else(|| {
            TransportError::ConfigurationError(format!("No port for endpoint {}", endpoint))
        })?;

        debug!("Connecting to WebSocket endpoint {}:{}", host, port);

        // Connect TCP
        let tcp_stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;
        let _ = tcp_stream.set_nodelay(true);

        let stream = if secure {
            let server_name = exposr_transport::tls::server_name(&host)?;
            let tls_stream = self
                .tls_connector
                .connect(server_name, tcp_stream)
                .await
                .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;
            MaybeTlsStream::Rustls(tls_stream)
        } else {
            MaybeTlsStream::Plain(tcp_stream)
        };

        // Perform WebSocket handshake
        let (ws_stream, _response) = tokio_tungstenite::client_async_with_config(
            endpoint.as_str(),
            stream,
            Some(self.protocol_config()),
        )
        .await
        .map_err(handshake_error)?;

        let connection = WebSocketConnection::new(ws_stream, &self.config);

        info!(
            "[{}] WebSocket connection established to {}:{}",
            exposr_transport::TransportConnection::connection_id(&connection),
            host,
            port
        );

        Ok(connection)
    }
}
