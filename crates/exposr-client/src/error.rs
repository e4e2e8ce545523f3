//! Client error types

use exposr_proto::ErrorCode;
use exposr_transport::{CloseInfo, TransportError};
use thiserror::Error;

/// Configuration errors, raised while building a [`TunnelConfig`](crate::TunnelConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No target URL was provided")]
    MissingTarget,

    #[error("Invalid target URL {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("max_transports must be at least 1")]
    InvalidMaxTransports,

    #[error("Invalid header name: {0:?}")]
    InvalidHeaderName(String),

    #[error("Invalid header specification {0:?}, expected NAME:VALUE")]
    InvalidHeaderSpec(String),

    #[error("Header {0:?} can not be rewritten (supported: host, referer, origin)")]
    UnknownRewriteHeader(String),

    #[error("Invalid server URL: {0}")]
    InvalidServer(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// Acquisition was abandoned because its cancellation token fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Cancelled")]
pub struct Cancelled;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Error reported by the broker or raised for a broker-level condition
    #[error("{0}")]
    Server(ErrorCode),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Target {target} unreachable: {source}")]
    Target {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tunnel service error: {0}")]
    Service(String),

    #[error("Connection closed: {0}")]
    Closed(CloseInfo),

    #[error("Invalid transport state: {0}")]
    InvalidState(&'static str),

    #[error("Cancelled")]
    Cancelled,
}

impl From<TransportError> for TunnelError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Rejected { code, .. } => TunnelError::Server(code),
            TransportError::Timeout => TunnelError::Server(ErrorCode::ServerTimeout),
            other => TunnelError::Transport(other),
        }
    }
}

impl From<Cancelled> for TunnelError {
    fn from(_: Cancelled) -> Self {
        TunnelError::Cancelled
    }
}

impl TunnelError {
    /// Returns true if this error is non-recoverable and retrying won't help
    pub fn is_non_recoverable(&self) -> bool {
        match self {
            TunnelError::Server(code) => matches!(
                code,
                ErrorCode::AuthNoAccessToken
                    | ErrorCode::PermissionDenied
                    | ErrorCode::TunnelNotFound
                    | ErrorCode::NoTunnelEndpoint
                    | ErrorCode::NoTunnel
                    | ErrorCode::NoAccount
            ),
            TunnelError::Config(_) => true,
            TunnelError::Transport(TransportError::ConfigurationError(_)) => true,
            _ => false,
        }
    }

    /// Returns true if this error is recoverable and retrying might succeed
    pub fn is_recoverable(&self) -> bool {
        !self.is_non_recoverable()
    }

    /// Error code, for errors that carry one
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TunnelError::Server(code) => Some(*code),
            _ => None,
        }
    }
}
