//! WebSocket connection implementation with stream multiplexing

use async_trait::async_trait;
use bytes::Bytes;
use exposr_proto::{CLOSE_ABNORMAL, CLOSE_NO_STATUS};
use exposr_transport::{
    CloseInfo, TransportConnection, TransportResult,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, trace, warn};

use crate::config::WebSocketConfig;
use crate::stream::{decode_frame_header, WebSocketStream, MSG_TYPE_DATA, MSG_TYPE_FIN};

pub(crate) type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

type StreamMap = Arc<RwLock<HashMap<u32, mpsc::Sender<Bytes>>>>;
type CloseState = Arc<watch::Sender<Option<CloseInfo>>>;

/// Work items for the writer task
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Vec<u8>),
    Close(CloseFrame<'static>),
}

/// Multiplexed WebSocket connection
pub struct WebSocketConnection {
    /// Connection ID for logging
    connection_id: String,
    /// Channel for sending frames to WebSocket writer task
    outbound_tx: mpsc::Sender<Outbound>,
    /// Stream channels - maps stream ID to sender for that stream
    streams: StreamMap,
    /// Channel for accepting new incoming streams
    accept_rx: Mutex<mpsc::Receiver<(u32, mpsc::Receiver<Bytes>)>>,
    /// Set once, when the connection has ended
    close_state: CloseState,
    /// Reader and writer tasks
    tasks: Vec<AbortHandle>,
    close_timeout: Duration,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

impl WebSocketConnection {
    /// Create a new WebSocket connection from an established WebSocket stream
    pub(crate) fn new(
        ws_stream: WsStream,
        config: &WebSocketConfig,
    ) -> Self {
        let connection_id = format!("ws-{}", uuid::Uuid::new_v4());

        let (ws_sink, ws_source) = ws_stream.split();

        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(256);
        let (accept_tx, accept_rx) = mpsc::channel(64);
        let streams: StreamMap = Arc::new(RwLock::new(HashMap::new()));
        let (close_tx, _) = watch::channel(None);
        let close_state = Arc::new(close_tx);

        let writer = tokio::spawn(Self::writer_task(
            ws_sink,
            outbound_rx,
            config.keep_alive_interval,
            connection_id.clone(),
        ));

        let reader = tokio::spawn(Self::reader_task(
            ws_source,
            streams.clone(),
            accept_tx,
            close_state.clone(),
            config.stream_buffer,
            connection_id.clone(),
        ));

        Self {
            connection_id,
            outbound_tx,
            streams,
            accept_rx: Mutex::new(accept_rx),
            close_state,
            tasks: vec![writer.abort_handle(), reader.abort_handle()],
            close_timeout: config.close_timeout,
        }
    }

    /// Writer task - sends frames and keep-alive pings to the WebSocket
    async fn writer_task(
        mut sink: SplitSink<WsStream, Message>,
        mut rx: mpsc::Receiver<Outbound>,
        keep_alive: Duration,
        conn_id: String,
    ) {
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + keep_alive, keep_alive);

        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = sink.send(Message::Binary(frame)).await {
                            debug!("[{}] WebSocket send error: {}", conn_id, e);
                            break;
                        }
                    }
                    Some(Outbound::Close(frame)) => {
                        debug!("[{}] Sending close frame ({})", conn_id, u16::from(frame.code));
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            debug!("[{}] WebSocket close error: {}", conn_id, e);
                        }
                        break;
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    trace!("[{}] Sending keep-alive ping", conn_id);
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        debug!("[{}] WebSocket ping error: {}", conn_id, e);
                        break;
                    }
                }
            }
        }

        debug!("[{}] WebSocket writer task ended", conn_id);
    }

    /// Reader task - receives frames and dispatches to streams
    async fn reader_task(
        mut source: SplitStream<WsStream>,
        streams: StreamMap,
        accept_tx: mpsc::Sender<(u32, mpsc::Receiver<Bytes>)>,
        close_state: CloseState,
        stream_buffer: usize,
        conn_id: String,
    ) {
        let mut close_info = None;

        while let Some(result) = source.next().await {
            match result {
                Ok(Message::Binary(data)) => {
                    let Some((stream_id, msg_type, payload)) = decode_frame_header(&data) else {
                        warn!("[{}] Invalid frame received", conn_id);
                        continue;
                    };

                    trace!(
                        "[{}] Received frame: stream={}, type={}, len={}",
                        conn_id,
                        stream_id,
                        msg_type,
                        payload.len()
                    );

                    let existing = streams.read().await.get(&stream_id).cloned();

                    match (existing, msg_type) {
                        (Some(tx), MSG_TYPE_DATA) => {
                            if tx.send(Bytes::copy_from_slice(payload)).await.is_err() {
                                debug!("[{}] Stream {} receiver dropped", conn_id, stream_id);
                                streams.write().await.remove(&stream_id);
                            }
                        }
                        (Some(tx), MSG_TYPE_FIN) => {
                            // Signal stream close with empty bytes
                            let _ = tx.send(Bytes::new()).await;
                            streams.write().await.remove(&stream_id);
                        }
                        (None, MSG_TYPE_DATA) => {
                            // New incoming stream
                            let (tx, rx) = mpsc::channel(stream_buffer);
                            if !payload.is_empty() {
                                let _ = tx.send(Bytes::copy_from_slice(payload)).await;
                            }
                            streams.write().await.insert(stream_id, tx);

                            if accept_tx.send((stream_id, rx)).await.is_err() {
                                warn!(
                                    "[{}] Accept channel closed, dropping stream {}",
                                    conn_id, stream_id
                                );
                                streams.write().await.remove(&stream_id);
                            }
                        }
                        (None, MSG_TYPE_FIN) => {
                            trace!("[{}] FIN for unknown stream {}", conn_id, stream_id);
                        }
                        (_, other) => {
                            warn!("[{}] Unknown message type: {}", conn_id, other);
                        }
                    }
                }
                Ok(Message::Ping(_)) => {
                    // Pong is automatically handled by tungstenite
                    trace!("[{}] Received ping", conn_id);
                }
                Ok(Message::Pong(_)) => {
                    trace!("[{}] Received pong", conn_id);
                }
                Ok(Message::Close(frame)) => {
                    debug!("[{}] WebSocket close received: {:?}", conn_id, frame);
                    // Keep reading so tungstenite flushes its close reply
                    close_info.get_or_insert_with(|| match frame {
                        Some(frame) => CloseInfo::new(u16::from(frame.code), frame.reason.to_string()),
                        None => CloseInfo::new(CLOSE_NO_STATUS, ""),
                    });
                }
                Ok(_) => {
                    // Text or other message types - ignore
                }
                Err(e) => {
                    debug!("[{}] WebSocket read error: {}", conn_id, e);
                    break;
                }
            }
        }

        debug!("[{}] WebSocket reader task ended", conn_id);

        // Dropping the senders ends every stream
        streams.write().await.clear();
        drop(accept_tx);

        publish_close(
            &close_state,
            close_info.unwrap_or_else(|| CloseInfo::new(CLOSE_ABNORMAL, "")),
        );
    }

    fn abort_tasks(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn publish_close(close_state: &CloseState, info: CloseInfo) {
    close_state.send_if_modified(|state| {
        if state.is_some() {
            return false;
        }
        *state = Some(info);
        true
    });
}

#[async_trait]
impl TransportConnection for WebSocketConnection {
    type Stream = WebSocketStream;

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        let mut accept_rx = self.accept_rx.lock().await;

        match accept_rx.recv().await {
            Some((stream_id, rx)) => {
                debug!("[{}] Accepted stream {}", self.connection_id, stream_id);
                Ok(Some(WebSocketStream::new(
                    stream_id,
                    rx,
                    self.outbound_tx.clone(),
                )))
            }
            // Reader task ended
            None => Ok(None),
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.is_closed() {
            return;
        }
        debug!("[{}] Closing connection: {} ({})", self.connection_id, reason, code);

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };

        let acknowledged = tokio::time::timeout(self.close_timeout, async {
            let _ = self.outbound_tx.send(Outbound::Close(frame)).await;
            self.closed().await
        })
        .await;

        if acknowledged.is_err() {
            debug!(
                "[{}] Close not acknowledged within {:?}, dropping socket",
                self.connection_id, self.close_timeout
            );
            self.abort_tasks();
            self.streams.write().await.clear();
            publish_close(&self.close_state, CloseInfo::new(code, reason));
        }
    }

    async fn closed(&self) -> CloseInfo {
        let mut rx = self.close_state.subscribe();
        let info = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone(),
            Err(_) => None,
        };
        info.unwrap_or_else(|| CloseInfo::new(CLOSE_ABNORMAL, ""))
    }

    fn close_info(&self) -> Option<CloseInfo> {
        self.close_state.borrow().clone()
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
