//! Transport abstraction layer for tunnel connections
//!
//! The tunnel core talks to the broker through these traits only. A transport
//! connection carries many logical streams; the broker opens a stream for
//! every ingress connection and the client relays it to the target.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  exposr-client                          │
//! │        (tunnel transport, tunnel orchestrator)          │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            exposr-transport (this crate)                │
//! │  - TransportConnector   - TransportConnection           │
//! │  - TransportStream      - CloseInfo                     │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            exposr-transport-websocket                   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod tls;

use async_trait::async_trait;
use bytes::Bytes;
use exposr_proto::ErrorCode;
use std::fmt::{self, Debug};
use thiserror::Error;
use url::Url;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    /// The broker answered the upgrade request with a regular HTTP response
    #[error("Connection rejected ({status}): {code}")]
    Rejected { status: u16, code: ErrorCode },

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Default reason used when the peer closes without giving one.
pub const DEFAULT_CLOSE_REASON: &str = "Connection closed";

/// Why a transport connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let reason = if reason.is_empty() {
            DEFAULT_CLOSE_REASON.to_string()
        } else {
            reason
        };
        Self { code, reason }
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// A bidirectional logical stream over a transport connection
///
/// The WebSocket transport multiplexes these over one socket with stream IDs.
#[async_trait]
pub trait TransportStream: Send + Sync + Debug {
    /// Send raw bytes
    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Receive raw bytes (up to max_size)
    ///
    /// Returns empty bytes if stream is closed.
    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes>;

    /// Close the sending side of the stream
    async fn finish(&mut self) -> TransportResult<()>;

    /// Get the stream ID (unique within this connection)
    fn stream_id(&self) -> u64;

    /// Check if the stream is closed
    fn is_closed(&self) -> bool;
}

/// A transport connection carrying broker-initiated streams
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    /// The stream type accepted by this connection
    type Stream: TransportStream + 'static;

    /// Accept an incoming bidirectional stream
    ///
    /// Returns `None` when the connection is closed and no more streams will arrive.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the connection
    ///
    /// Idempotent. Resolves once the underlying socket is gone.
    async fn close(&self, code: u16, reason: &str);

    /// Wait until the connection has ended, for any reason
    async fn closed(&self) -> CloseInfo;

    /// Close information, once the connection has ended
    fn close_info(&self) -> Option<CloseInfo>;

    /// Check if the connection is closed
    fn is_closed(&self) -> bool {
        self.close_info().is_some()
    }

    /// Get a unique stable identifier for this connection
    ///
    /// Used as a prefix for connection-scoped log lines.
    fn connection_id(&self) -> String;
}

/// Establishes outgoing transport connections to the broker
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// The connection type created by this connector
    type Connection: TransportConnection + 'static;

    /// Connect and complete the transport handshake with `endpoint`
    async fn connect(&self, endpoint: &Url) -> TransportResult<Self::Connection>;
}

/// Configuration for transport security
#[derive(Debug, Clone)]
pub struct TransportSecurityConfig {
    /// Whether to verify the server's TLS certificate
    pub verify_server_cert: bool,

    /// Custom root CA certificates, DER encoded (if not using the bundled roots)
    pub root_certs: Vec<Vec<u8>>,
}

impl Default for TransportSecurityConfig {
    fn default() -> Self {
        Self {
            verify_server_cert: true,
            root_certs: Vec::new(),
        }
    }
}

/// Transport-specific configuration
///
/// Each transport implementation can define its own configuration type
/// that implements this trait.
pub trait TransportConfig: Send + Sync + Debug {
    /// Get the security configuration
    fn security_config(&self) -> &TransportSecurityConfig;

    /// Validate the configuration
    fn validate(&self) -> TransportResult<()>;
}
