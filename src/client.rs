//! Websocket connector for a session authority.
//!
//! `connect` performs the handshake (`session:connected` carries the
//! participant id the authority assigned), builds a `Session` over a
//! channel transport and spawns one pump task per connection:
//!
//! ```text
//! Session ─► ChannelTransport ─► mpsc ─► pump ─► websocket (binary frames)
//! websocket ─► pump ─► Session::handle_frame
//! ```
//!
//! The pump is the only place that awaits socket I/O; everything the
//! session does stays synchronous.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::frame::{self, Frame, Status};
use crate::message::{FIELD_PARTICIPANT_ID, SYSCALL_CONNECTED};
use crate::session::Session;
use crate::state::ParticipantId;
use crate::transport::{self, TransportError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("websocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket closed during handshake")]
    Closed,
    #[error("timed out waiting for session:connected")]
    Timeout,
    #[error("invalid handshake: {0}")]
    Handshake(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A live session plus the task moving its frames.
pub struct Connection {
    session: Session,
    shutdown: Option<oneshot::Sender<()>>,
    pump: JoinHandle<()>,
}

impl Connection {
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Release everything, flush what is queued and close the socket.
    pub async fn close(mut self) {
        self.session.teardown();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.pump.await {
            warn!(error = %e, "client: pump task failed");
        }
    }
}

/// Connect to `config.server_url`, join `config.room_id` and start pumping.
///
/// # Errors
///
/// Returns `Connect` if the websocket handshake fails, `Closed` / `Timeout`
/// / `Handshake` if the welcome frame does not arrive intact, and
/// `Transport` if the join request cannot be queued.
pub async fn connect(config: &SyncConfig) -> Result<Connection, ClientError> {
    let (mut stream, _) = connect_async(config.server_url.as_str())
        .await
        .map_err(|e| ClientError::Connect(Box::new(e)))?;

    let local = tokio::time::timeout(HANDSHAKE_TIMEOUT, wait_connected(&mut stream))
        .await
        .map_err(|_| ClientError::Timeout)??;

    let (transport, outgoing) = transport::channel(config.channel_capacity);
    let session = Session::new(local, config.clone(), Arc::new(transport));
    session.join()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let pump = tokio::spawn(run_pump(stream, outgoing, session.clone(), shutdown_rx));
    info!(participant = %local, room_id = %config.room_id, url = %config.server_url, "client: connected");

    Ok(Connection { session, shutdown: Some(shutdown_tx), pump })
}

async fn wait_connected(stream: &mut WsStream) -> Result<ParticipantId, ClientError> {
    loop {
        let Some(msg) = stream.next().await else {
            return Err(ClientError::Closed);
        };
        match msg.map_err(|e| ClientError::Connect(Box::new(e)))? {
            Message::Binary(bytes) => {
                let frame = frame::decode(&bytes).map_err(|e| ClientError::Handshake(e.to_string()))?;
                if frame.syscall != SYSCALL_CONNECTED || frame.status == Status::Error {
                    debug!(syscall = %frame.syscall, "client: frame before welcome ignored");
                    continue;
                }
                return frame
                    .data
                    .get(FIELD_PARTICIPANT_ID)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| ClientError::Handshake("welcome frame without participant_id".into()));
            }
            Message::Close(_) => return Err(ClientError::Closed),
            _ => {}
        }
    }
}

async fn run_pump(
    mut stream: WsStream,
    mut outgoing: mpsc::Receiver<Frame>,
    session: Session,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(frame) = outgoing.recv() => {
                if let Err(e) = send_frame(&mut stream, &frame).await {
                    warn!(error = %e, syscall = %frame.syscall, "client: send failed");
                    break;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => match frame::decode(&bytes) {
                    Ok(frame) => session.handle_frame(&frame),
                    Err(e) => warn!(error = %e, "client: undecodable frame dropped"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!(participant = %session.local(), "client: server closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "client: websocket error");
                    break;
                }
            },
            _ = &mut shutdown => {
                while let Ok(frame) = outgoing.try_recv() {
                    if send_frame(&mut stream, &frame).await.is_err() {
                        break;
                    }
                }
                let _ = stream.close(None).await;
                break;
            }
        }
    }

    // Connection gone: local ownership no longer means anything.
    session.teardown();
    debug!(participant = %session.local(), "client: pump stopped");
}

async fn send_frame(stream: &mut WsStream, frame: &Frame) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    stream.send(Message::Binary(frame::encode(frame).into())).await
}
