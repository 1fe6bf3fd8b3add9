//! Room service: join/part, snapshots and broadcast.
//!
//! DESIGN
//! ======
//! Rooms are created on first join and evicted when the last client parts.
//! A join returns the authoritative snapshot so a late joiner starts from
//! the same state and ownership as everyone else.
//!
//! A part is a disconnect as far as ownership goes: everything the
//! participant held is released and the room is told so before it hears
//! about the part itself.
//!
//! Frames are never dropped for a client that stays in the room. When a
//! client's queue is full it is evicted instead: its handle is removed,
//! its socket loop is signalled to close, and the rest of the room sees
//! the same release and part frames a voluntary part would produce. The
//! client rejoins from a fresh snapshot.

use std::collections::HashMap;

use ownsync::{EntityId, EntitySnapshot, Frame, ParticipantId, WireMessage};
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::{AppState, ClientHandle, RoomState};

// =============================================================================
// JOIN / PART
// =============================================================================

/// Join a room, creating it if needed. Returns the room snapshot.
pub async fn join_room(
    state: &AppState,
    room_id: Uuid,
    participant: ParticipantId,
    client: ClientHandle,
) -> Vec<EntitySnapshot> {
    let mut rooms = state.rooms.write().await;
    let room = rooms.entry(room_id).or_insert_with(RoomState::new);
    room.clients.insert(participant, client);

    let snapshot = room.snapshot();
    info!(%room_id, %participant, clients = room.clients.len(), entities = snapshot.len(), "client joined room");
    snapshot
}

/// Leave a room. Releases everything the participant owned, tells the
/// remaining clients, and evicts the room if it is now empty. Returns the
/// released entities.
///
/// A participant that is no longer in the room (already evicted) is a no-op.
pub async fn part_room(state: &AppState, room_id: Uuid, participant: ParticipantId) -> Vec<EntityId> {
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(&room_id) else {
        return Vec::new();
    };
    if room.clients.remove(&participant).is_none() {
        return Vec::new();
    }

    let (released, frames) = departure(room, room_id, participant);
    for frame in &frames {
        send_all(room, room_id, frame, None);
    }

    info!(%room_id, %participant, released = released.len(), remaining = room.clients.len(), "client left room");
    evict_if_empty(&mut rooms, room_id);
    released
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Send a frame to every client in a room, optionally skipping one.
/// Clients whose queue is full are evicted.
pub async fn broadcast(state: &AppState, room_id: Uuid, frame: &Frame, exclude: Option<ParticipantId>) {
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(&room_id) else {
        return;
    };
    send_all(room, room_id, frame, exclude);
    evict_if_empty(&mut rooms, room_id);
}

/// Deliver `frame`, then evict every client that could not take it along
/// with anyone who overflows on the resulting release and part frames.
fn send_all(room: &mut RoomState, room_id: Uuid, frame: &Frame, exclude: Option<ParticipantId>) {
    let mut lagging = deliver(room, frame, exclude);
    while let Some(participant) = lagging.pop() {
        let Some(client) = room.clients.remove(&participant) else {
            continue;
        };
        client.evicted.notify_one();
        let (released, frames) = departure(room, room_id, participant);
        warn!(%room_id, %participant, released = released.len(), "client queue full, evicted from room");
        for frame in &frames {
            lagging.extend(deliver(room, frame, None));
        }
    }
}

/// Try to queue `frame` for each client. Returns the clients that refused it.
fn deliver(room: &RoomState, frame: &Frame, exclude: Option<ParticipantId>) -> Vec<ParticipantId> {
    room.clients
        .iter()
        .filter(|(participant, _)| exclude != Some(**participant))
        .filter(|(_, client)| client.tx.try_send(frame.clone()).is_err())
        .map(|(participant, _)| *participant)
        .collect()
}

/// Release what a departed participant owned and build the frames that
/// tell the room: one `entity:owner` per released entity, then `room:part`.
fn departure(room: &mut RoomState, room_id: Uuid, participant: ParticipantId) -> (Vec<EntityId>, Vec<Frame>) {
    let released = room.ownership.disconnect(participant);
    let mut frames: Vec<Frame> = released
        .iter()
        .map(|entity_id| {
            WireMessage::Owner { entity_id: *entity_id, owner_id: None, claimed_at: None }
                .to_frame()
                .with_room_id(room_id)
        })
        .collect();
    frames.push(
        WireMessage::Part { participant_id: participant }
            .to_frame()
            .with_room_id(room_id)
            .with_from(participant.to_string()),
    );
    (released, frames)
}

fn evict_if_empty(rooms: &mut HashMap<Uuid, RoomState>, room_id: Uuid) {
    if rooms.get(&room_id).is_some_and(|room| room.clients.is_empty()) {
        rooms.remove(&room_id);
        info!(%room_id, "evicted room from memory");
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
