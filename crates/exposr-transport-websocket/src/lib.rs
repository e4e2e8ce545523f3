//! WebSocket transport implementation using tokio-tungstenite
//!
//! Connects to the broker's transport endpoint (`ws://` or `wss://`) and
//! carries every ingress connection as a logical stream over the one socket.
//!
//! # Features
//!
//! - **Encryption**: TLS via rustls (wss://)
//! - **Multiplexing**: Stream multiplexing over single WebSocket connection
//! - **Broker errors**: a non-upgrade HTTP response is surfaced as
//!   [`TransportError::Rejected`](exposr_transport::TransportError::Rejected)
//!   with the broker's error code
//!
//! # Stream Multiplexing
//!
//! Each binary WebSocket message is prefixed with:
//! - 4 bytes: stream ID (big-endian u32)
//! - 1 byte: message type (0=data, 1=fin)
//! - Rest: payload
//!
//! Streams are opened by the broker; the first DATA frame carrying an
//! unknown stream ID creates the stream on this side.

pub mod config;
pub mod connection;
pub mod connector;
pub mod stream;

pub use config::WebSocketConfig;
pub use connection::WebSocketConnection;
pub use connector::WebSocketConnector;
pub use stream::WebSocketStream;
