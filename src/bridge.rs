//! Sync bridge: local stores on one side, the wire on the other.
//!
//! DESIGN
//! ======
//! The bridge keeps a registry of replicas keyed by entity id. Replicas are
//! type-erased behind `Replica` so stores with different payload shapes
//! share one registry.
//!
//! `publish` encodes a store's current state and sends it. `on_receive`
//! routes an incoming update to its store; ordering and duplicate handling
//! are the store's job (`apply_remote` is idempotent per entity), so
//! interleaving across entities needs no coordination here.
//!
//! ERROR HANDLING
//! ==============
//! Nothing on the receive path is fatal. Unknown entities are dropped with a
//! warning (a peer can be ahead of our local spawn), stale updates are
//! traced, malformed payloads are rejected with the replica untouched.
//!
//! `hydrate` is the one path that ignores version order. It carries state
//! from the session authority, which outranks anything held locally.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::message::WireMessage;
use crate::state::{EntityId, StateUpdate, Version};
use crate::store::{Applied, Payload, StateStore, SyncError};
use crate::transport::Outbox;

/// Type-erased access to a store from the wire side.
pub trait Replica: Send + Sync {
    fn entity_id(&self) -> EntityId;

    fn version(&self) -> Version;

    /// Encode current state for publishing.
    ///
    /// # Errors
    ///
    /// Returns `Encode` when the payload cannot be represented on the wire.
    fn encode(&self) -> Result<StateUpdate, SyncError>;

    /// Offer a remote update.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the update cannot be decoded.
    fn apply_remote(&self, update: &StateUpdate) -> Result<Applied, SyncError>;

    /// Install an authoritative state regardless of version order.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the update cannot be decoded.
    fn reset(&self, update: &StateUpdate) -> Result<Version, SyncError>;
}

impl<S: Payload> Replica for StateStore<S> {
    fn entity_id(&self) -> EntityId {
        StateStore::entity_id(self)
    }

    fn version(&self) -> Version {
        StateStore::version(self)
    }

    fn encode(&self) -> Result<StateUpdate, SyncError> {
        self.to_update()
    }

    fn apply_remote(&self, update: &StateUpdate) -> Result<Applied, SyncError> {
        StateStore::apply_remote(self, update)
    }

    fn reset(&self, update: &StateUpdate) -> Result<Version, SyncError> {
        StateStore::reset(self, update)
    }
}

/// What happened to an incoming update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Applied(Version),
    Stale,
    Unknown,
    Rejected,
}

pub struct SyncBridge {
    outbox: Outbox,
    replicas: HashMap<EntityId, Arc<dyn Replica>>,
}

impl SyncBridge {
    #[must_use]
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox, replicas: HashMap::new() }
    }

    /// Register a replica. Returns the one it replaced, if any.
    pub fn attach(&mut self, replica: Arc<dyn Replica>) -> Option<Arc<dyn Replica>> {
        self.replicas.insert(replica.entity_id(), replica)
    }

    pub fn detach(&mut self, entity_id: EntityId) -> bool {
        self.replicas.remove(&entity_id).is_some()
    }

    #[must_use]
    pub fn contains(&self, entity_id: EntityId) -> bool {
        self.replicas.contains_key(&entity_id)
    }

    /// Version of the attached replica, if any.
    #[must_use]
    pub fn version(&self, entity_id: EntityId) -> Option<Version> {
        self.replicas.get(&entity_id).map(|replica| replica.version())
    }

    #[must_use]
    pub fn entities(&self) -> Vec<EntityId> {
        self.replicas.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.replicas.clear();
    }

    /// Send the entity's current state. Returns the update that went out.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity` for entities not attached here, `Encode` if
    /// the state cannot be serialized and `Transport` if sending failed.
    pub fn publish(&self, entity_id: EntityId) -> Result<StateUpdate, SyncError> {
        let replica = self
            .replicas
            .get(&entity_id)
            .ok_or(SyncError::UnknownEntity(entity_id))?;
        let update = replica.encode()?;
        self.outbox.send(&WireMessage::Update(update.clone()))?;
        trace!(%entity_id, version = update.version, "bridge: published");
        Ok(update)
    }

    /// Route an incoming update to its replica.
    pub fn on_receive(&self, update: &StateUpdate) -> Received {
        let Some(replica) = self.replicas.get(&update.entity_id) else {
            warn!(entity_id = %update.entity_id, version = update.version, "bridge: update for unknown entity dropped");
            return Received::Unknown;
        };

        match replica.apply_remote(update) {
            Ok(Applied::Replaced(version)) => Received::Applied(version),
            Ok(Applied::Stale { .. }) => Received::Stale,
            Err(e) => {
                warn!(entity_id = %update.entity_id, error = %e, "bridge: update rejected");
                Received::Rejected
            }
        }
    }

    /// Route an authoritative state (join snapshot, correction) to its
    /// replica, bypassing version order.
    pub fn hydrate(&self, update: &StateUpdate) -> Received {
        let Some(replica) = self.replicas.get(&update.entity_id) else {
            return Received::Unknown;
        };
        match replica.reset(update) {
            Ok(version) => Received::Applied(version),
            Err(e) => {
                warn!(entity_id = %update.entity_id, error = %e, "bridge: authoritative state rejected");
                Received::Rejected
            }
        }
    }
}

#[cfg(test)]
#[path = "bridge_test.rs"]
mod tests;
