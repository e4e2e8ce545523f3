//! One transport connection to the broker and the relays running over it
//!
//! A `TunnelTransport` lives for exactly one physical connection:
//!
//! ```text
//!   Idle ──connect()──► Connecting ──► Connected ──► Closed(CloseInfo)
//!                           │                            ▲
//!                           └──────── failure ───────────┘
//! ```
//!
//! While connected, an accept task turns every stream the broker opens into
//! a relay to the target. Relays are owned by a `JoinSet`; they are all
//! aborted and awaited before `Closed` is published.

use crate::config::TransformRules;
use crate::error::TunnelError;
use crate::http_transform::HttpTransform;
use crate::target::TargetConnector;
use exposr_proto::{ErrorCode, TunnelDescriptor, CLOSE_ABNORMAL, CLOSE_NORMAL};
use exposr_transport::{
    CloseInfo, TransportConnection, TransportConnector, TransportStream, DEFAULT_CLOSE_REASON,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Read size for both directions of a relay
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Connected,
    Closed(CloseInfo),
}

/// Lifecycle notifications, delivered on one channel per tunnel.
#[derive(Debug)]
pub enum TransportEvent {
    /// Broker connection established
    Open,
    /// A relay could not reach the target. The connection stays up.
    Error(TunnelError),
    Close(CloseInfo),
}

/// Everything a relay needs, shared by all relays of one connection.
struct RelayContext {
    transport_id: u64,
    target: Arc<TargetConnector>,
    transform: Option<(Arc<TransformRules>, Url)>,
    events: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

pub struct TunnelTransport<C: TransportConnector> {
    id: u64,
    connector: Arc<C>,
    target: Arc<TargetConnector>,
    transform: Arc<TransformRules>,
    handshake_timeout: Duration,
    events: mpsc::UnboundedSender<(u64, TransportEvent)>,
    state: Arc<watch::Sender<TransportState>>,
    closing: CancellationToken,
    close_request: Arc<Mutex<Option<CloseInfo>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<C: TransportConnector> std::fmt::Debug for TunnelTransport<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelTransport")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl<C> TunnelTransport<C>
where
    C: TransportConnector + 'static,
{
    /// Events are sent tagged with `id`.
    pub fn new(
        id: u64,
        connector: Arc<C>,
        target: Arc<TargetConnector>,
        transform: Arc<TransformRules>,
        handshake_timeout: Duration,
        events: mpsc::UnboundedSender<(u64, TransportEvent)>,
    ) -> Self {
        let (state, _) = watch::channel(TransportState::Idle);
        Self {
            id,
            connector,
            target,
            transform,
            handshake_timeout,
            events,
            state: Arc::new(state),
            closing: CancellationToken::new(),
            close_request: Arc::new(Mutex::new(None)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransportState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), TransportState::Connected)
    }

    /// Connect to the broker endpoint announced by `descriptor`.
    ///
    /// Only valid from `Idle`. A failed or cancelled attempt leaves the
    /// transport `Closed`; a transport is never reused.
    pub async fn connect(
        &self,
        descriptor: &TunnelDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let started = self.state.send_if_modified(|state| {
            if *state == TransportState::Idle {
                *state = TransportState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(TunnelError::InvalidState("transport is not idle"));
        }

        let connection = match self.establish(descriptor, cancel).await {
            Ok(connection) => connection,
            Err(e) => {
                let info = match &e {
                    TunnelError::Cancelled => CloseInfo::new(CLOSE_NORMAL, "Cancelled"),
                    other => CloseInfo::new(CLOSE_ABNORMAL, other.to_string()),
                };
                self.state.send_replace(TransportState::Closed(info));
                return Err(e);
            }
        };

        info!(
            "Transport {} connected ({})",
            self.id,
            connection.connection_id()
        );

        let transform = match descriptor.http_ingress_url() {
            Some(ingress) if self.transform.is_active() => {
                Some((self.transform.clone(), ingress.clone()))
            }
            _ => None,
        };
        let context = Arc::new(RelayContext {
            transport_id: self.id,
            target: self.target.clone(),
            transform,
            events: self.events.clone(),
        });

        // close() cancels before taking this lock, so either it sees the
        // task or we see the cancellation
        let mut task = self.task.lock().await;
        if self.closing.is_cancelled() {
            connection.close(CLOSE_NORMAL, DEFAULT_CLOSE_REASON).await;
            return Err(TunnelError::Cancelled);
        }

        self.state.send_replace(TransportState::Connected);
        let _ = self.events.send((self.id, TransportEvent::Open));

        *task = Some(tokio::spawn(accept_loop(
            connection,
            context,
            self.closing.clone(),
            self.close_request.clone(),
            self.state.clone(),
        )));

        Ok(())
    }

    async fn establish(
        &self,
        descriptor: &TunnelDescriptor,
        cancel: &CancellationToken,
    ) -> Result<C::Connection, TunnelError> {
        let endpoint = descriptor
            .transport_endpoint()
            .ok_or(TunnelError::Server(ErrorCode::NoTunnelEndpoint))?;
        debug!("Transport {} connecting to {}", self.id, endpoint);

        // Dropping the connect future tears down the half-open socket
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            _ = self.closing.cancelled() => Err(TunnelError::Cancelled),
            result = tokio::time::timeout(self.handshake_timeout, self.connector.connect(endpoint)) => {
                match result {
                    Ok(Ok(connection)) => Ok(connection),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(TunnelError::Server(ErrorCode::ServerTimeout)),
                }
            }
        }
    }

    /// Close with code 1000 and the default reason.
    pub async fn close(&self) {
        self.close_with(CLOSE_NORMAL, DEFAULT_CLOSE_REASON).await
    }

    /// Close the transport. Idempotent; returns once every relay is gone
    /// and `Closed` has been published.
    pub async fn close_with(&self, code: u16, reason: &str) {
        {
            let mut request = self
                .close_request
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if request.is_none() {
                *request = Some(CloseInfo::new(code, reason));
            }
        }
        self.closing.cancel();

        let task = self.task.lock().await.take();
        match task {
            Some(task) => {
                let _ = task.await;
            }
            None => {
                let info = CloseInfo::new(code, reason);
                self.state.send_if_modified(|state| match state {
                    TransportState::Closed(_) => false,
                    _ => {
                        *state = TransportState::Closed(info);
                        true
                    }
                });
            }
        }
    }

    /// Wait until the transport is closed.
    pub async fn closed(&self) -> CloseInfo {
        let mut rx = self.state.subscribe();
        let result = rx
            .wait_for(|state| matches!(state, TransportState::Closed(_)))
            .await
            .map(|state| match &*state {
                TransportState::Closed(info) => info.clone(),
                _ => CloseInfo::new(CLOSE_ABNORMAL, ""),
            });
        // The sender lives in self, so the channel can not close under us
        result.unwrap_or_else(|_| CloseInfo::new(CLOSE_ABNORMAL, ""))
    }
}

impl<C: TransportConnector> Drop for TunnelTransport<C> {
    fn drop(&mut self) {
        // The accept task closes the connection with the default reason
        self.closing.cancel();
    }
}

async fn accept_loop<T>(
    connection: T,
    context: Arc<RelayContext>,
    closing: CancellationToken,
    close_request: Arc<Mutex<Option<CloseInfo>>>,
    state: Arc<watch::Sender<TransportState>>,
) where
    T: TransportConnection + 'static,
{
    let id = context.transport_id;
    let mut relays = JoinSet::new();

    let local_close = loop {
        tokio::select! {
            biased;
            _ = closing.cancelled() => break true,
            accepted = connection.accept_stream() => match accepted {
                Ok(Some(stream)) => {
                    trace!("Transport {} accepted stream {}", id, stream.stream_id());
                    relays.spawn(relay(stream, context.clone()));
                }
                Ok(None) => break false,
                Err(e) => {
                    warn!("Transport {} failed to accept stream: {}", id, e);
                    break true;
                }
            },
            Some(_) = relays.join_next(), if !relays.is_empty() => {}
        }
    };

    let active = relays.len();
    relays.shutdown().await;
    if active > 0 {
        debug!("Transport {} stopped {} relays", id, active);
    }

    let info = if local_close {
        let requested = close_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| CloseInfo::new(CLOSE_NORMAL, DEFAULT_CLOSE_REASON));
        connection.close(requested.code, &requested.reason).await;
        requested
    } else {
        connection.closed().await
    };

    info!("Transport {} closed: {}", id, info);
    state.send_replace(TransportState::Closed(info.clone()));
    let _ = context.events.send((id, TransportEvent::Close(info)));
}

/// Pipe one tunnel stream to a fresh target connection until either side
/// ends, then end both.
async fn relay<S>(mut stream: S, context: Arc<RelayContext>)
where
    S: TransportStream + 'static,
{
    let id = context.transport_id;
    let target = match context.target.connect().await {
        Ok(target) => target,
        Err(e) => {
            warn!("Transport {}: {}", id, e);
            let _ = stream.finish().await;
            let _ = context.events.send((id, TransportEvent::Error(e)));
            return;
        }
    };

    let mut transform = context
        .transform
        .as_ref()
        .map(|(rules, ingress)| HttpTransform::new(rules.clone(), context.target.url(), ingress));

    let (mut target_rx, mut target_tx) = tokio::io::split(target);
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        tokio::select! {
            read = target_rx.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    if stream.send_bytes(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Transport {}: target read failed: {}", id, e);
                    break;
                }
            },
            received = stream.recv_bytes(RELAY_BUFFER_SIZE) => match received {
                Ok(data) if data.is_empty() => break,
                Ok(data) => {
                    let data = match transform.as_mut() {
                        Some(transform) => transform.transform(&data),
                        None => data,
                    };
                    if let Err(e) = target_tx.write_all(&data).await {
                        debug!("Transport {}: target write failed: {}", id, e);
                        break;
                    }
                }
                Err(e) => {
                    debug!("Transport {}: stream {} failed: {}", id, stream.stream_id(), e);
                    break;
                }
            },
        }
    }

    let _ = stream.finish().await;
    let _ = target_tx.shutdown().await;
    trace!("Transport {}: stream {} done", id, stream.stream_id());
}
