//! Status snapshots published by a running tunnel

use serde::{Deserialize, Serialize};

/// State of one transport slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStatus {
    pub id: u64,
    pub connected: bool,
    /// Last connect error, cleared by a successful connect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last close reason, formatted as `"<reason> (<code>)"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed: Option<String>,
}

/// Pool-wide snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatus {
    /// At least one transport is connected
    pub connected: bool,
    pub current_connections: usize,
    pub max_connections: usize,
    pub transports: Vec<TransportStatus>,
}

impl TunnelStatus {
    pub fn transport(&self, id: u64) -> Option<&TransportStatus> {
        self.transports.iter().find(|t| t.id == id)
    }
}

/// A snapshot together with the slot whose change produced it. Pool-wide
/// changes (sizing, disconnect) carry no source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub source: Option<u64>,
    pub status: TunnelStatus,
}

impl StatusUpdate {
    /// Status of the slot that triggered this update.
    pub fn source_transport(&self) -> Option<&TransportStatus> {
        self.source.and_then(|id| self.status.transport(id))
    }
}
