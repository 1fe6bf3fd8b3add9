//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds a map of live rooms. Each room keeps the authoritative replica
//! of every entity, the authority's ownership table and the handles of its
//! connected clients. Rooms exist only while someone is connected.
//!
//! A client handle pairs the outgoing frame channel with an eviction
//! signal. The room fires the signal when it drops a client whose queue
//! overflowed, and the socket loop closes the connection in response.

use std::collections::HashMap;
use std::sync::Arc;

use ownsync::{Arbitration, EntityId, EntitySnapshot, Frame, OwnershipManager, ParticipantId, Version};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock, mpsc};
use uuid::Uuid;

use crate::config::ServerConfig;

// =============================================================================
// ENTITY
// =============================================================================

/// Authoritative replica of one entity's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityEntity {
    pub payload: serde_json::Value,
    pub version: Version,
}

// =============================================================================
// CLIENT HANDLE
// =============================================================================

/// A connected client as seen by the room it joined.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Outgoing frames to the client's socket loop.
    pub tx: mpsc::Sender<Frame>,
    /// Notified once when the room evicts the client.
    pub evicted: Arc<Notify>,
}

impl ClientHandle {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx, evicted: Arc::new(Notify::new()) }
    }
}

// =============================================================================
// ROOM STATE
// =============================================================================

/// Per-room live state.
pub struct RoomState {
    /// Current entities keyed by entity ID.
    pub entities: HashMap<EntityId, AuthorityEntity>,
    /// Ownership as decided by this authority, in arrival order.
    pub ownership: OwnershipManager,
    /// Connected clients: participant -> handle for outgoing frames.
    pub clients: HashMap<ParticipantId, ClientHandle>,
}

impl RoomState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            ownership: OwnershipManager::new(Arbitration::Authority),
            clients: HashMap::new(),
        }
    }

    /// Authoritative row for one entity.
    #[must_use]
    pub fn row(&self, entity_id: EntityId) -> Option<EntitySnapshot> {
        let entity = self.entities.get(&entity_id)?;
        let ownership = self.ownership.state(entity_id);
        Some(EntitySnapshot {
            entity_id,
            payload: entity.payload.clone(),
            version: entity.version,
            owner_id: ownership.and_then(ownsync::Ownership::owner),
            claimed_at: ownership.and_then(ownsync::Ownership::claimed_at),
        })
    }

    /// Every entity, in id order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EntitySnapshot> {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.row(id)).collect()
    }
}

impl Default for RoomState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RwLock<HashMap<Uuid, RoomState>>>,
    pub config: ServerConfig,
}

impl AppState {
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self { rooms: Arc::new(RwLock::new(HashMap::new())), config }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
