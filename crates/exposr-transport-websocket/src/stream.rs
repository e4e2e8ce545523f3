//! WebSocket stream implementation with multiplexing
//!
//! Frame format:
//! - 4 bytes: stream ID (big-endian u32)
//! - 1 byte: message type (0=data, 1=fin)
//! - Rest: payload

use async_trait::async_trait;
use bytes::Bytes;
use exposr_transport::{TransportError, TransportResult, TransportStream};
use tokio::sync::mpsc;
use tracing::trace;

use crate::connection::Outbound;

/// Message type constants for stream multiplexing
pub(crate) const MSG_TYPE_DATA: u8 = 0;
pub(crate) const MSG_TYPE_FIN: u8 = 1;

/// Encode a multiplexed frame
pub(crate) fn encode_frame(stream_id: u32, msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&stream_id.to_be_bytes());
    frame.push(msg_type);
    frame.extend_from_slice(payload);
    frame
}

/// Decode a multiplexed frame header
pub(crate) fn decode_frame_header(data: &[u8]) -> Option<(u32, u8, &[u8])> {
    if data.len() < 5 {
        return None;
    }
    let stream_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    Some((stream_id, data[4], &data[5..]))
}

/// A virtual stream over a multiplexed WebSocket connection
#[derive(Debug)]
pub struct WebSocketStream {
    stream_id: u32,
    /// Data for this stream, an empty chunk marks the remote FIN
    rx: mpsc::Receiver<Bytes>,
    /// Shared sender to the WebSocket writer task
    tx: mpsc::Sender<Outbound>,
    /// Remainder of a chunk larger than the caller's read size
    pending: Option<Bytes>,
    /// Remote side finished or connection gone
    recv_closed: bool,
    /// Our FIN has been sent
    fin_sent: bool,
}

impl WebSocketStream {
    pub(crate) fn new(stream_id: u32, rx: mpsc::Receiver<Bytes>, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            stream_id,
            rx,
            tx,
            pending: None,
            recv_closed: false,
            fin_sent: false,
        }
    }

    fn take_up_to(&mut self, mut data: Bytes, max_size: usize) -> Bytes {
        if data.len() > max_size {
            self.pending = Some(data.split_off(max_size));
        }
        data
    }
}

#[async_trait]
impl TransportStream for WebSocketStream {
    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.fin_sent {
            return Err(TransportError::StreamClosed);
        }

        let frame = encode_frame(self.stream_id, MSG_TYPE_DATA, data);
        self.tx
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| TransportError::ConnectionError("WebSocket send failed".to_string()))?;

        trace!("Sent {} bytes on stream {}", data.len(), self.stream_id);
        Ok(())
    }

    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes> {
        if let Some(data) = self.pending.take() {
            return Ok(self.take_up_to(data, max_size));
        }

        if self.recv_closed {
            return Ok(Bytes::new());
        }

        match self.rx.recv().await {
            Some(data) if !data.is_empty() => Ok(self.take_up_to(data, max_size)),
            _ => {
                self.recv_closed = true;
                Ok(Bytes::new())
            }
        }
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.fin_sent {
            return Ok(());
        }
        self.fin_sent = true;

        // Ignore error if connection is already closed
        let frame = encode_frame(self.stream_id, MSG_TYPE_FIN, &[]);
        let _ = self.tx.send(Outbound::Frame(frame)).await;
        Ok(())
    }

    fn stream_id(&self) -> u64 {
        self.stream_id as u64
    }

    fn is_closed(&self) -> bool {
        self.recv_closed && self.fin_sent
    }
}

impl Drop for WebSocketStream {
    fn drop(&mut self) {
        if !self.fin_sent {
            let frame = encode_frame(self.stream_id, MSG_TYPE_FIN, &[]);
            let _ = self.tx.try_send(Outbound::Frame(frame));
        }
    }
}
