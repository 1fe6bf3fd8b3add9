//! Entity service: spawn, claim, release, update and despawn under the
//! authority's rules.
//!
//! DESIGN
//! ======
//! The authority holds the replica every other copy converges on. Claims
//! are arbitrated in arrival order (`Arbitration::Authority`): the first
//! claimant of an unowned entity wins and holds it until release or
//! disconnect. Updates are accepted only from the current owner and only
//! when strictly newer than the stored version.
//!
//! A rejected write leaves the authoritative replica untouched. The caller
//! sends the writer the current row so it can reset its local copy.

use ownsync::{ClaimRequest, EntityId, EntitySnapshot, INITIAL_VERSION, ParticipantId, StateUpdate, Version};
use tracing::{debug, info};
use uuid::Uuid;

use crate::state::{AppState, AuthorityEntity};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room not joined")]
    NotJoined,
    #[error("room not loaded: {0}")]
    RoomNotLoaded(Uuid),
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),
    #[error("entity already exists: {0}")]
    EntityExists(EntityId),
    #[error("participant does not own entity {0}")]
    NotOwner(EntityId),
    #[error("stale update for {entity_id}: incoming version {incoming} <= current {current}")]
    StaleUpdate { entity_id: EntityId, incoming: Version, current: Version },
}

impl ownsync::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotJoined => "E_NOT_JOINED",
            Self::RoomNotLoaded(_) => "E_ROOM_NOT_LOADED",
            Self::UnknownEntity(_) => "E_UNKNOWN_ENTITY",
            Self::EntityExists(_) => "E_ENTITY_EXISTS",
            Self::NotOwner(_) => "E_NOT_OWNER",
            Self::StaleUpdate { .. } => "E_STALE_UPDATE",
        }
    }
}

impl RoomError {
    /// Entity whose authoritative row the writer should be sent back.
    #[must_use]
    pub fn correction_for(&self) -> Option<EntityId> {
        match self {
            Self::EntityExists(id) | Self::NotOwner(id) | Self::StaleUpdate { entity_id: id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Outcome of a claim as decided by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimDecision {
    pub granted: bool,
    pub owner_id: Option<ParticipantId>,
    pub claimed_at: Option<i64>,
}

// =============================================================================
// SPAWN / DESPAWN
// =============================================================================

/// Register a new entity. Ownership in the incoming row is ignored; a new
/// entity starts unowned.
///
/// # Errors
///
/// `RoomNotLoaded` if the room is gone, `EntityExists` if the id is taken.
pub async fn spawn_entity(state: &AppState, room_id: Uuid, row: EntitySnapshot) -> Result<EntitySnapshot, RoomError> {
    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(&room_id).ok_or(RoomError::RoomNotLoaded(room_id))?;
    if room.entities.contains_key(&row.entity_id) {
        return Err(RoomError::EntityExists(row.entity_id));
    }

    let entity_id = row.entity_id;
    let version = row.version.max(INITIAL_VERSION);
    room.entities
        .insert(entity_id, AuthorityEntity { payload: row.payload, version });
    room.ownership.register(entity_id);
    info!(%room_id, %entity_id, version, "entity spawned");

    room.row(entity_id).ok_or(RoomError::UnknownEntity(entity_id))
}

/// Remove an entity. Anyone may despawn an unowned entity; an owned one
/// only by its owner.
///
/// # Errors
///
/// `RoomNotLoaded`, `UnknownEntity`, or `NotOwner` if someone else holds it.
pub async fn despawn_entity(
    state: &AppState,
    room_id: Uuid,
    participant: ParticipantId,
    entity_id: EntityId,
) -> Result<(), RoomError> {
    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(&room_id).ok_or(RoomError::RoomNotLoaded(room_id))?;
    if !room.entities.contains_key(&entity_id) {
        return Err(RoomError::UnknownEntity(entity_id));
    }
    if let Some(owner) = room.ownership.owner_of(entity_id) {
        if owner != participant {
            return Err(RoomError::NotOwner(entity_id));
        }
    }

    room.entities.remove(&entity_id);
    room.ownership.remove(entity_id);
    info!(%room_id, %entity_id, %participant, "entity despawned");
    Ok(())
}

// =============================================================================
// CLAIM / RELEASE
// =============================================================================

/// Arbitrate a claim. A denied claim is not an error: the decision carries
/// the current owner either way.
///
/// # Errors
///
/// `RoomNotLoaded` or `UnknownEntity`.
pub async fn claim_entity(state: &AppState, room_id: Uuid, claim: &ClaimRequest) -> Result<ClaimDecision, RoomError> {
    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(&room_id).ok_or(RoomError::RoomNotLoaded(room_id))?;
    if !room.entities.contains_key(&claim.entity_id) {
        return Err(RoomError::UnknownEntity(claim.entity_id));
    }

    let granted = room.ownership.take_ownership(claim);
    let current = room.ownership.state(claim.entity_id);
    Ok(ClaimDecision {
        granted,
        owner_id: current.and_then(ownsync::Ownership::owner),
        claimed_at: current.and_then(ownsync::Ownership::claimed_at),
    })
}

/// Release an entity. Returns `false` when the participant was not owner.
///
/// # Errors
///
/// `RoomNotLoaded` or `UnknownEntity`.
pub async fn release_entity(
    state: &AppState,
    room_id: Uuid,
    participant: ParticipantId,
    entity_id: EntityId,
) -> Result<bool, RoomError> {
    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(&room_id).ok_or(RoomError::RoomNotLoaded(room_id))?;
    if !room.entities.contains_key(&entity_id) {
        return Err(RoomError::UnknownEntity(entity_id));
    }
    Ok(room.ownership.release_ownership(entity_id, participant))
}

// =============================================================================
// UPDATE
// =============================================================================

/// Store an owner's update.
///
/// # Errors
///
/// `RoomNotLoaded`, `UnknownEntity`, `NotOwner` for anyone but the owner,
/// `StaleUpdate` unless the version is strictly newer.
pub async fn update_entity(
    state: &AppState,
    room_id: Uuid,
    participant: ParticipantId,
    update: &StateUpdate,
) -> Result<(), RoomError> {
    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(&room_id).ok_or(RoomError::RoomNotLoaded(room_id))?;
    let owner = room.ownership.owner_of(update.entity_id);
    let entity = room
        .entities
        .get_mut(&update.entity_id)
        .ok_or(RoomError::UnknownEntity(update.entity_id))?;

    if owner != Some(participant) {
        return Err(RoomError::NotOwner(update.entity_id));
    }
    if update.version <= entity.version {
        return Err(RoomError::StaleUpdate {
            entity_id: update.entity_id,
            incoming: update.version,
            current: entity.version,
        });
    }

    entity.payload = update.payload.clone();
    entity.version = update.version;
    debug!(%room_id, entity_id = %update.entity_id, version = update.version, "entity updated");
    Ok(())
}

/// Current authoritative row, if the entity exists.
pub async fn entity_row(state: &AppState, room_id: Uuid, entity_id: EntityId) -> Option<EntitySnapshot> {
    let rooms = state.rooms.read().await;
    rooms.get(&room_id)?.row(entity_id)
}

#[cfg(test)]
#[path = "entity_test.rs"]
mod tests;
