//! exposr tunnel client
//!
//! Keeps a pool of transport connections to the broker and relays every
//! stream the broker opens on them to a local target, optionally rewriting
//! HTTP request headers on the way.
//!
//! # Example
//!
//! ```ignore
//! use exposr_client::{HttpTunnelService, Tunnel, TunnelConfig};
//! use exposr_transport_websocket::{WebSocketConfig, WebSocketConnector};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = TunnelConfig::builder()
//!     .target_url("http://localhost:3000")
//!     .max_transports(2)
//!     .build()?;
//! let service = Arc::new(HttpTunnelService::new(&server, "my-tunnel", token)?);
//! let connector = Arc::new(WebSocketConnector::new(Arc::new(WebSocketConfig::default()))?);
//!
//! let tunnel = Tunnel::new(config, service, connector)?;
//! let cancel = CancellationToken::new();
//! tunnel.connect(cancel.clone()).await?;
//! tunnel.disconnect().await;
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod gate;
pub mod http_transform;
pub mod resolver;
pub mod service;
pub mod target;
pub mod transport;
pub mod tunnel;

pub use backoff::{Backoff, BackoffConfig};
pub use config::{RewriteHeader, TransformRules, TunnelConfig, TunnelConfigBuilder};
pub use error::{Cancelled, ConfigError, TunnelError};
pub use gate::{ConnectGate, GateGuard};
pub use http_transform::HttpTransform;
pub use resolver::CachingResolver;
pub use service::{HttpTunnelService, TunnelService};
pub use target::{default_port, TargetConnector, TargetOptions, TargetStream};
pub use transport::{TransportEvent, TransportState, TunnelTransport};
pub use tunnel::Tunnel;

// Re-export the shared types callers need
pub use exposr_proto::{ErrorCode, StatusUpdate, TransportStatus, TunnelDescriptor, TunnelStatus};
pub use exposr_transport::{CloseInfo, TransportConnector};
