//! Data model shared between the exposr client crates
//!
//! - [`TunnelDescriptor`]: the broker's view of a tunnel (transport endpoint,
//!   ingress URLs, target)
//! - [`ErrorCode`]: error codes reported by the broker and raised locally
//! - [`TunnelStatus`] / [`StatusUpdate`]: snapshots published by the client

pub mod descriptor;
pub mod error;
pub mod status;

pub use descriptor::{
    ConnectionInfo, IngressInfo, TargetInfo, TransportInfo, TunnelDescriptor, WsTransportInfo,
};
pub use error::{parse_error_body, ErrorCode};
pub use status::{StatusUpdate, TransportStatus, TunnelStatus};

/// WebSocket close code for a normal local shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close frame received without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Broker-side policy violation. The broker uses it to tell a client not to
/// come back (e.g. the tunnel was deleted or taken over).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
