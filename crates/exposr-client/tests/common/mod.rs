//! Test doubles for the tunnel orchestrator: a broker-less transport and an
//! in-memory tunnel service.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use exposr_client::{TunnelError, TunnelService};
use exposr_proto::TunnelDescriptor;
use exposr_transport::{
    CloseInfo, TransportConnection, TransportConnector, TransportError,
    TransportResult, TransportStream,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Instant;
use url::Url;

pub fn descriptor(endpoint: &str, ingress: Option<&str>) -> TunnelDescriptor {
    let mut json = serde_json::json!({
        "id": "quiet-river",
        "connection": { "connected": false },
        "transport": {
            "max_connections": 4,
            "ws": { "enabled": true, "url": endpoint }
        },
        "target": { "url": "http://localhost:3000" }
    });
    if let Some(ingress) = ingress {
        json["ingress"] = serde_json::json!({
            "http": { "enabled": true, "url": ingress }
        });
    }
    serde_json::from_value(json).unwrap()
}

/// Serves one fixed descriptor
#[derive(Debug)]
pub struct MockService {
    descriptor: TunnelDescriptor,
    pub reads: AtomicUsize,
}

impl MockService {
    pub fn new(descriptor: TunnelDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            reads: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TunnelService for MockService {
    async fn read(&self, _force: bool) -> Result<TunnelDescriptor, TunnelError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.descriptor.clone())
    }

    async fn disconnect(&self) -> Result<bool, TunnelError> {
        Ok(true)
    }
}

type CloseState = Arc<watch::Sender<Option<CloseInfo>>>;

/// Mark a connection closed. Only the first close counts.
fn shut(close: &CloseState, live: &AtomicUsize, info: CloseInfo) {
    let changed = close.send_if_modified(|state| {
        if state.is_none() {
            *state = Some(info);
            true
        } else {
            false
        }
    });
    if changed {
        live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connector whose connections carry no streams. Counts live connections
/// and can fail a number of attempts first.
#[derive(Debug, Default)]
pub struct MockConnector {
    failures: AtomicUsize,
    attempts: Mutex<Vec<Instant>>,
    live: Arc<AtomicUsize>,
    max_live: AtomicUsize,
    connections: Mutex<Vec<CloseState>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the first `failures` attempts with a connection error.
    pub fn failing(failures: usize) -> Arc<Self> {
        let connector = Self::default();
        connector.failures.store(failures, Ordering::SeqCst);
        Arc::new(connector)
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Close every open connection from the broker side.
    pub fn close_remote(&self, code: u16, reason: &str) {
        for close in self.connections.lock().unwrap().iter() {
            shut(close, &self.live, CloseInfo::new(code, reason));
        }
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, _endpoint: &Url) -> TransportResult<MockConnection> {
        self.attempts.lock().unwrap().push(Instant::now());

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectionError(
                "Connection refused".to_string(),
            ));
        }

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        let (close, _) = watch::channel(None);
        let close = Arc::new(close);
        self.connections.lock().unwrap().push(close.clone());

        Ok(MockConnection {
            close,
            live: self.live.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MockConnection {
    close: CloseState,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportConnection for MockConnection {
    type Stream = MockStream;

    async fn accept_stream(&self) -> TransportResult<Option<MockStream>> {
        let mut rx = self.close.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
        Ok(None)
    }

    async fn close(&self, code: u16, reason: &str) {
        shut(&self.close, &self.live, CloseInfo::new(code, reason));
    }

    async fn closed(&self) -> CloseInfo {
        let mut rx = self.close.subscribe();
        let info = match rx.wait_for(Option::is_some).await {
            Ok(info) => info.clone(),
            Err(_) => None,
        };
        info.unwrap_or_else(|| CloseInfo::new(1006, ""))
    }

    fn close_info(&self) -> Option<CloseInfo> {
        self.close.borrow().clone()
    }

    fn connection_id(&self) -> String {
        "mock".to_string()
    }
}

/// Never produced; required by the connection type.
#[derive(Debug)]
pub struct MockStream;

#[async_trait]
impl TransportStream for MockStream {
    async fn send_bytes(&mut self, _data: &[u8]) -> TransportResult<()> {
        Err(TransportError::StreamClosed)
    }

    async fn recv_bytes(&mut self, _max_size: usize) -> TransportResult<Bytes> {
        Ok(Bytes::new())
    }

    async fn finish(&mut self) -> TransportResult<()> {
        Ok(())
    }

    fn stream_id(&self) -> u64 {
        0
    }

    fn is_closed(&self) -> bool {
        true
    }
}
