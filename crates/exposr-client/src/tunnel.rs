//! Tunnel orchestrator: a fixed pool of transport slots, each with its own
//! reconnect loop.
//!
//! Slots are allocated once per pool and never hold more than one transport,
//! so the number of live broker connections never exceeds the pool size.
//! Connection attempts from all slots are serialized through one
//! [`ConnectGate`].

use crate::backoff::Backoff;
use crate::config::{TransformRules, TunnelConfig};
use crate::error::{ConfigError, TunnelError};
use crate::gate::ConnectGate;
use crate::service::TunnelService;
use crate::target::{TargetConnector, TargetOptions};
use crate::transport::{TransportEvent, TunnelTransport};
use exposr_proto::{StatusUpdate, TransportStatus, TunnelStatus};
use exposr_transport::{CloseInfo, TransportConnector};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STATUS_CHANNEL_CAPACITY: usize = 64;

type EventReceiver = mpsc::UnboundedReceiver<(u64, TransportEvent)>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SlotState<C: TransportConnector> {
    transport: Option<Arc<TunnelTransport<C>>>,
    error: Option<String>,
    closed: Option<String>,
    cancel: CancellationToken,
}

struct Slot<C: TransportConnector> {
    id: u64,
    state: Mutex<SlotState<C>>,
}

impl<C: TransportConnector + 'static> Slot<C> {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(SlotState {
                transport: None,
                error: None,
                closed: None,
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn status(&self) -> TransportStatus {
        let state = lock(&self.state);
        TransportStatus {
            id: self.id,
            connected: state
                .transport
                .as_ref()
                .is_some_and(|transport| transport.is_connected()),
            error: state.error.clone(),
            closed: state.closed.clone(),
        }
    }

    fn transport(&self) -> Option<Arc<TunnelTransport<C>>> {
        lock(&self.state).transport.clone()
    }
}

struct Shared<C: TransportConnector> {
    config: TunnelConfig,
    service: Arc<dyn TunnelService>,
    connector: Arc<C>,
    target: Arc<TargetConnector>,
    transform: Arc<TransformRules>,
    gate: ConnectGate,
    slots: Mutex<Vec<Arc<Slot<C>>>>,
    next_slot_id: AtomicU64,
    status_tx: broadcast::Sender<StatusUpdate>,
}

/// A tunnel: keeps `max_transports` connections to the broker and relays
/// the streams on them to the target.
pub struct Tunnel<C: TransportConnector> {
    shared: Arc<Shared<C>>,
}

impl<C: TransportConnector> Clone for Tunnel<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C> Tunnel<C>
where
    C: TransportConnector + 'static,
{
    pub fn new(
        config: TunnelConfig,
        service: Arc<dyn TunnelService>,
        connector: Arc<C>,
    ) -> Result<Self, ConfigError> {
        let target = TargetConnector::new(
            &config.target_url,
            TargetOptions {
                allow_insecure: config.allow_insecure,
                ..Default::default()
            },
        )?;
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                transform: Arc::new(config.transform.clone()),
                config,
                service,
                connector,
                target: Arc::new(target),
                gate: ConnectGate::new(),
                slots: Mutex::new(Vec::new()),
                next_slot_id: AtomicU64::new(1),
                status_tx,
            }),
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.shared.config
    }

    /// Run the pool until every slot gives up or `cancel` fires.
    ///
    /// All slot loops have finished when this returns. Transports that were
    /// connected at cancellation stay up until [`disconnect`](Self::disconnect).
    /// Returns the first fatal error, or `Ok(())` when cancelled.
    pub async fn connect(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        let slots = self.shared.allocate_slots();

        let mut loops = JoinSet::new();
        for slot in slots {
            let token = cancel.child_token();
            lock(&slot.state).cancel = token.clone();
            let shared = self.shared.clone();
            loops.spawn(async move { shared.run_slot(slot, token).await });
        }

        let mut first_error = None;
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Ok(Ok(())) => {}
                Err(e) => error!("Transport slot task failed: {}", e),
            }
        }

        if cancel.is_cancelled() {
            return Ok(());
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close every transport, in slot order, and empty the pool.
    pub async fn disconnect(&self) {
        let slots = std::mem::take(&mut *lock(&self.shared.slots));

        for slot in &slots {
            let transport = {
                let mut state = lock(&slot.state);
                state.cancel.cancel();
                state.transport.take()
            };
            if let Some(transport) = transport {
                transport.close().await;
                debug!("Transport {} disconnected", slot.id);
            }
        }

        self.shared.emit(None);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.shared.status_tx.subscribe()
    }

    pub fn status(&self) -> TunnelStatus {
        self.shared.status()
    }
}

impl<C> Shared<C>
where
    C: TransportConnector + 'static,
{
    fn allocate_slots(&self) -> Vec<Arc<Slot<C>>> {
        let (slots, allocated) = {
            let mut slots = lock(&self.slots);
            let allocated = slots.is_empty();
            if allocated {
                for _ in 0..self.config.max_transports {
                    let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
                    slots.push(Arc::new(Slot::new(id)));
                }
            }
            (slots.clone(), allocated)
        };
        if allocated {
            debug!("Allocated {} transport slots", slots.len());
            self.emit(None);
        }
        slots
    }

    fn status(&self) -> TunnelStatus {
        let transports: Vec<TransportStatus> =
            lock(&self.slots).iter().map(|slot| slot.status()).collect();
        let current_connections = transports.iter().filter(|t| t.connected).count();

        TunnelStatus {
            connected: current_connections > 0,
            current_connections,
            max_connections: transports.len(),
            transports,
        }
    }

    fn emit(&self, source: Option<u64>) {
        let _ = self.status_tx.send(StatusUpdate {
            source,
            status: self.status(),
        });
    }

    /// Slot retry loop. Publishes the slot's final state when it ends.
    async fn run_slot(
        self: Arc<Self>,
        slot: Arc<Slot<C>>,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        let result = self.slot_loop(&slot, &cancel).await;
        self.emit(Some(slot.id));
        result
    }

    async fn slot_loop(
        &self,
        slot: &Slot<C>,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let mut backoff = Backoff::new(self.config.backoff.clone());

        // A transport left up by an earlier cancelled run
        if let Some(transport) = slot.transport().filter(|t| t.is_connected()) {
            let info = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                info = transport.closed() => info,
            };
            self.on_close(slot, info)?;
        }

        loop {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let transport = match self.attempt(slot, cancel, events_tx).await {
                Ok(transport) => transport,
                Err(TunnelError::Cancelled) => return Ok(()),
                Err(_) if cancel.is_cancelled() => return Ok(()),
                Err(e) => {
                    lock(&slot.state).error = Some(e.to_string());
                    self.emit(Some(slot.id));

                    if e.is_non_recoverable() {
                        error!("Transport {} failed: {}", slot.id, e);
                        return Err(e);
                    }
                    warn!("Transport {} failed: {}", slot.id, e);
                    if backoff.wait(cancel).await.is_err() {
                        return Ok(());
                    }
                    continue;
                }
            };

            {
                let mut state = lock(&slot.state);
                state.error = None;
                state.closed = None;
            }
            self.emit(Some(slot.id));
            backoff.reset();

            let info = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                info = wait_for_close(&transport, events_rx) => info,
            };
            self.on_close(slot, info)?;
        }
    }

    /// Record a close. Fails when the close code means the slot should not
    /// reconnect.
    fn on_close(&self, slot: &Slot<C>, info: CloseInfo) -> Result<(), TunnelError> {
        lock(&slot.state).closed = Some(info.to_string());
        self.emit(Some(slot.id));

        if self.config.no_reconnect_close_codes.contains(&info.code) {
            warn!("Transport {} closed by broker: {}, not reconnecting", slot.id, info);
            return Err(TunnelError::Closed(info));
        }
        info!("Transport {} closed: {}, reconnecting", slot.id, info);
        Ok(())
    }

    async fn attempt(
        &self,
        slot: &Slot<C>,
        cancel: &CancellationToken,
        events: mpsc::UnboundedSender<(u64, TransportEvent)>,
    ) -> Result<Arc<TunnelTransport<C>>, TunnelError> {
        let guard = self.gate.acquire(cancel).await?;

        let descriptor = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            descriptor = self.service.read(true) => descriptor?,
        };

        let transport = Arc::new(TunnelTransport::new(
            slot.id,
            self.connector.clone(),
            self.target.clone(),
            self.transform.clone(),
            self.config.handshake_timeout,
            events,
        ));
        let previous = lock(&slot.state).transport.replace(transport.clone());
        drop(previous);

        let result = transport.connect(&descriptor, cancel).await;
        guard.release();

        result.map(|()| transport)
    }
}

async fn wait_for_close<C>(transport: &TunnelTransport<C>, mut events: EventReceiver) -> CloseInfo
where
    C: TransportConnector + 'static,
{
    while let Some((id, event)) = events.recv().await {
        match event {
            TransportEvent::Open => debug!("Transport {} open", id),
            TransportEvent::Error(e) => debug!("Transport {} relay error: {}", id, e),
            TransportEvent::Close(info) => return info,
        }
    }
    transport.closed().await
}
