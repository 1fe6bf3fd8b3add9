//! WebSocket handler: the session authority's frame loop.
//!
//! DESIGN
//! ======
//! On upgrade, assigns a participant ID and enters a `select!` loop:
//! - Incoming client frames → decode + dispatch by syscall prefix
//! - Frames from room peers → forward to client
//!
//! Handler functions validate, ask the services to mutate room state, and
//! return an `Outcome`. The dispatch layer owns all outbound concerns: reply
//! to sender and broadcast to peers.
//!
//! A rejected write is answered with an error frame followed by a
//! `room:snapshot` holding the authoritative row, so the writer can reset
//! its replica instead of drifting.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `participant_id`
//! 2. Client sends `room:join` → reply with the room snapshot
//! 3. Client sends `entity:*` frames → dispatch → handler returns Outcome
//! 4. Close → release everything the participant owned → `room:part`
//!
//! A client whose queue overflows is evicted by the room service; the loop
//! sees the eviction signal and closes the socket so the client reconnects
//! and rejoins from a snapshot.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use ownsync::frame::{self, Data, FRAME_CODE, FRAME_MESSAGE, Status};
use ownsync::message::{FIELD_PARTICIPANT_ID, SYSCALL_CONNECTED};
use ownsync::{ClaimRequest, EntitySnapshot, Frame, ParticipantId, WireMessage};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::entity::{self, RoomError};
use crate::services::room;
use crate::state::{AppState, ClientHandle};

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what; handlers never send frames directly.
enum Outcome {
    /// Send to ALL room clients. The sender's copy carries `parent_id`.
    Broadcast(WireMessage),
    /// Send to all room peers EXCLUDING sender. No reply to sender.
    BroadcastExcludeSender(WireMessage),
    /// Send to sender only.
    Reply(WireMessage),
    /// Nothing to send.
    Silent,
}

/// A refused request: the error frame plus, for rejected writes, the row the
/// sender should reset to.
struct Rejection {
    error: Frame,
    correction: Option<EntitySnapshot>,
}

impl From<Frame> for Rejection {
    fn from(error: Frame) -> Self {
        Self { error, correction: None }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let participant = ParticipantId::new();

    // Per-connection channel for frames from room peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_channel_capacity);
    let client = ClientHandle::new(client_tx);
    let evicted = Arc::clone(&client.evicted);

    let welcome = Frame::request(SYSCALL_CONNECTED, Data::new()).with_data(FIELD_PARTICIPANT_ID, participant.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%participant, "ws: client connected");

    // Track which room this client has joined.
    let mut current_room: Option<Uuid> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Binary(bytes) => {
                        let replies = process_inbound_bytes(&state, &mut current_room, participant, &client, &bytes).await;
                        for frame in replies {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
            () = evicted.notified() => {
                warn!(%participant, "ws: evicted from room, closing");
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    if let Some(room_id) = current_room {
        room::part_room(&state, room_id, participant).await;
    }
    info!(%participant, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Decode and process one inbound binary frame and return frames for the
/// sender. Peers are reached through the room's client channels.
async fn process_inbound_bytes(
    state: &AppState,
    current_room: &mut Option<Uuid>,
    participant: ParticipantId,
    client: &ClientHandle,
    bytes: &[u8],
) -> Vec<Frame> {
    let mut req = match frame::decode(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%participant, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data(FRAME_MESSAGE, format!("invalid frame: {e}"));
            return vec![err];
        }
    };

    // The connection decides who is speaking, not the frame.
    req.from = Some(participant.to_string());
    info!(%participant, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    let result = match req.prefix() {
        "room" => handle_room(state, current_room, participant, client, &req).await,
        "entity" => handle_entity(state, *current_room, participant, &req).await,
        prefix => Err(req.error(format!("unknown prefix: {prefix}")).into()),
    };

    let room_id = *current_room;
    match result {
        Ok(Outcome::Broadcast(message)) => {
            let peer_frame = outbound(&message, room_id, participant);
            if let Some(rid) = room_id {
                room::broadcast(state, rid, &peer_frame, Some(participant)).await;
            }
            vec![reply_to(&req, peer_frame)]
        }
        Ok(Outcome::BroadcastExcludeSender(message)) => {
            if let Some(rid) = room_id {
                room::broadcast(state, rid, &outbound(&message, room_id, participant), Some(participant)).await;
            }
            vec![]
        }
        Ok(Outcome::Reply(message)) => vec![reply_to(&req, outbound(&message, room_id, participant))],
        Ok(Outcome::Silent) => vec![],
        Err(Rejection { error, correction }) => {
            let mut frames = vec![error];
            if let Some(row) = correction {
                frames.push(reply_to(&req, outbound(&WireMessage::Snapshot(vec![row]), room_id, participant)));
            }
            frames
        }
    }
}

fn outbound(message: &WireMessage, room_id: Option<Uuid>, participant: ParticipantId) -> Frame {
    let mut frame = message.to_frame().with_from(participant.to_string());
    frame.room_id = room_id;
    frame
}

/// Turn a message frame into the terminal reply to `req`.
fn reply_to(req: &Frame, mut frame: Frame) -> Frame {
    frame.id = Uuid::new_v4();
    frame.status = Status::Done;
    frame.with_parent_id(req.id)
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_room(
    state: &AppState,
    current_room: &mut Option<Uuid>,
    participant: ParticipantId,
    client: &ClientHandle,
    req: &Frame,
) -> Result<Outcome, Rejection> {
    match req.op() {
        "join" => {
            let Some(room_id) = req.room_id.or_else(|| {
                req.data
                    .get("room_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
            }) else {
                return Err(req.error("room_id required").into());
            };

            // Part the current room if switching.
            if let Some(old_room) = current_room.take() {
                if old_room != room_id {
                    room::part_room(state, old_room, participant).await;
                }
            }

            let snapshot = room::join_room(state, room_id, participant, client.clone()).await;
            *current_room = Some(room_id);
            Ok(Outcome::Reply(WireMessage::Snapshot(snapshot)))
        }
        "part" => {
            if let Some(old_room) = current_room.take() {
                room::part_room(state, old_room, participant).await;
            }
            Ok(Outcome::Silent)
        }
        op => Err(req.error(format!("unknown room op: {op}")).into()),
    }
}

// =============================================================================
// ENTITY HANDLERS
// =============================================================================

async fn handle_entity(
    state: &AppState,
    current_room: Option<Uuid>,
    participant: ParticipantId,
    req: &Frame,
) -> Result<Outcome, Rejection> {
    let Some(room_id) = current_room else {
        return Err(req.error_from(&RoomError::NotJoined).into());
    };
    let message = WireMessage::from_frame(req).map_err(|e| req.error_from(&e))?;

    match message {
        WireMessage::Spawn(row) => match entity::spawn_entity(state, room_id, row).await {
            Ok(stored) => Ok(Outcome::BroadcastExcludeSender(WireMessage::Spawn(stored))),
            Err(e) => Err(reject(state, room_id, req, &e).await),
        },
        WireMessage::Claim(claim) => {
            let claim = ClaimRequest { requester_id: participant, ..claim };
            let decision = entity::claim_entity(state, room_id, &claim)
                .await
                .map_err(|e| req.error_from(&e))?;
            let owner = WireMessage::Owner {
                entity_id: claim.entity_id,
                owner_id: decision.owner_id,
                claimed_at: decision.claimed_at,
            };
            if decision.granted {
                info!(%room_id, entity_id = %claim.entity_id, %participant, "ws: claim granted");
                Ok(Outcome::Broadcast(owner))
            } else {
                info!(%room_id, entity_id = %claim.entity_id, %participant, owner = ?decision.owner_id, "ws: claim denied");
                Ok(Outcome::Reply(owner))
            }
        }
        WireMessage::Release { entity_id, .. } => {
            let released = entity::release_entity(state, room_id, participant, entity_id)
                .await
                .map_err(|e| req.error_from(&e))?;
            if released {
                Ok(Outcome::Broadcast(WireMessage::Owner { entity_id, owner_id: None, claimed_at: None }))
            } else {
                Ok(Outcome::Silent)
            }
        }
        WireMessage::Update(update) => match entity::update_entity(state, room_id, participant, &update).await {
            Ok(()) => Ok(Outcome::BroadcastExcludeSender(WireMessage::Update(update))),
            Err(e) => Err(reject(state, room_id, req, &e).await),
        },
        WireMessage::Despawn { entity_id } => match entity::despawn_entity(state, room_id, participant, entity_id).await {
            Ok(()) => Ok(Outcome::BroadcastExcludeSender(WireMessage::Despawn { entity_id })),
            Err(e) => Err(reject(state, room_id, req, &e).await),
        },
        WireMessage::Owner { .. } | WireMessage::Snapshot(_) | WireMessage::Part { .. } => {
            Err(req.error(format!("{} is sent by the authority only", req.syscall)).into())
        }
    }
}

async fn reject(state: &AppState, room_id: Uuid, req: &Frame, err: &RoomError) -> Rejection {
    let correction = match err.correction_for() {
        Some(entity_id) => entity::entity_row(state, room_id, entity_id).await,
        None => None,
    };
    Rejection { error: req.error_from(err), correction }
}

// =============================================================================
// SEND
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    if frame.status == Status::Error {
        let code = frame.data.get(FRAME_CODE).and_then(|v| v.as_str()).unwrap_or("-");
        let message = frame
            .data
            .get(FRAME_MESSAGE)
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket.send(Message::Binary(frame::encode(frame).into())).await
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
