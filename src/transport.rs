//! Outbound transport seam.
//!
//! The protocol never performs network I/O itself. It hands frames to a
//! `Transport`, whose `send` must not block: claims and mutations are
//! synchronous and a publish happens right after a mutation. Anything that
//! actually suspends (websocket writes) runs in a pump task on the far side
//! of a channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::frame::Frame;
use crate::message::WireMessage;
use crate::state::ParticipantId;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport queue full")]
    Full,
}

/// Non-blocking outbound frame sink.
pub trait Transport: Send + Sync {
    /// Queue a frame for delivery.
    ///
    /// # Errors
    ///
    /// Returns `Closed` once the far side is gone and `Full` when the queue
    /// is at capacity.
    fn send(&self, frame: Frame) -> Result<(), TransportError>;
}

/// Transport backed by a bounded tokio channel. The receiving half is
/// drained by whatever owns the connection (a websocket pump, a test).
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Frame>,
}

impl ChannelTransport {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Full,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// Stamps outgoing messages with the sender and room before handing them
/// to the transport.
#[derive(Clone)]
pub struct Outbox {
    transport: Arc<dyn Transport>,
    local: ParticipantId,
    room_id: Option<Uuid>,
}

impl Outbox {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, local: ParticipantId, room_id: Option<Uuid>) -> Self {
        Self { transport, local, room_id }
    }

    #[must_use]
    pub fn local(&self) -> ParticipantId {
        self.local
    }

    #[must_use]
    pub fn room_id(&self) -> Option<Uuid> {
        self.room_id
    }

    /// Stamp and send a raw frame.
    ///
    /// # Errors
    ///
    /// Propagates the transport's error.
    pub fn send_frame(&self, mut frame: Frame) -> Result<(), TransportError> {
        frame.from = Some(self.local.to_string());
        if frame.room_id.is_none() {
            frame.room_id = self.room_id;
        }
        self.transport.send(frame)
    }

    /// Send a protocol message.
    ///
    /// # Errors
    ///
    /// Propagates the transport's error.
    pub fn send(&self, message: &WireMessage) -> Result<(), TransportError> {
        self.send_frame(message.to_frame())
    }
}

/// Create a channel transport and the receiver that drains it.
#[must_use]
pub fn channel(capacity: usize) -> (ChannelTransport, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelTransport::new(tx), rx)
}
