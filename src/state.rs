//! Shared data model for networked objects.
//!
//! DESIGN
//! ======
//! Identifiers are UUID newtypes so entity and participant ids cannot be
//! swapped at a call site. Both are totally ordered; arbitration breaks
//! ties on the lowest participant id.
//!
//! Versions start at [`INITIAL_VERSION`] when an entity is spawned and only
//! ever move forward: the owner bumps by one per mutation, replicas jump
//! to whatever newer version they receive.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Monotonic per-entity state version.
pub type Version = u64;

/// Version carried by every freshly spawned entity.
pub const INITIAL_VERSION: Version = 1;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identifier of a networked object, shared by every participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Identifier of one connected client in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ParticipantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// The owner's authoritative copy of one entity's state.
///
/// Lives only inside a `StateStore`; nothing hands out `&mut` access to it.
#[derive(Debug, Clone)]
pub struct SharedState<S> {
    pub entity_id: EntityId,
    pub payload: S,
    pub version: Version,
}

// =============================================================================
// WIRE RECORDS
// =============================================================================

/// A state change travelling between participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub entity_id: EntityId,
    /// JSON object: field name -> value.
    pub payload: serde_json::Value,
    pub version: Version,
}

/// A request to become owner of an entity. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub entity_id: EntityId,
    pub requester_id: ParticipantId,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
}

impl ClaimRequest {
    /// Build a claim stamped with the current time.
    #[must_use]
    pub fn new(entity_id: EntityId, requester_id: ParticipantId) -> Self {
        Self { entity_id, requester_id, timestamp: now_ms() }
    }
}

/// Current state of one entity as served to a joining participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: EntityId,
    pub payload: serde_json::Value,
    pub version: Version,
    pub owner_id: Option<ParticipantId>,
    /// Timestamp of the claim that produced `owner_id`.
    pub claimed_at: Option<i64>,
}

impl EntitySnapshot {
    /// The state half of the snapshot, as a regular update.
    #[must_use]
    pub fn to_update(&self) -> StateUpdate {
        StateUpdate { entity_id: self.entity_id, payload: self.payload.clone(), version: self.version }
    }
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
