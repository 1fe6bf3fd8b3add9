//! Networked object: a store plus the capabilities to claim and publish it.
//!
//! One generic type covers every kind of shared entity. Behavior that
//! differs per deployment (who arbitrates, where updates go) sits behind
//! `Capabilities`, which `Session` implements.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::state::{EntityId, ParticipantId, StateUpdate, Version};
use crate::store::{Payload, StateStore, StateView, SyncError};

/// Ownership and publishing operations an object delegates to its session.
pub trait Capabilities: Send + Sync {
    /// Participant the capabilities act for.
    fn local(&self) -> ParticipantId;

    /// Request ownership. `false` means someone else holds it.
    fn claim(&self, entity_id: EntityId) -> bool;

    /// Hand ownership back. `false` if the local participant was not owner.
    fn release(&self, entity_id: EntityId) -> bool;

    fn is_owner(&self, entity_id: EntityId) -> bool;

    fn owner_of(&self, entity_id: EntityId) -> Option<ParticipantId>;

    /// Send the entity's current state to the other participants.
    ///
    /// # Errors
    ///
    /// See [`crate::bridge::SyncBridge::publish`].
    fn publish(&self, entity_id: EntityId) -> Result<StateUpdate, SyncError>;
}

pub struct NetworkedObject<S, C> {
    store: Arc<StateStore<S>>,
    caps: C,
}

impl<S: Payload, C: Capabilities> NetworkedObject<S, C> {
    #[must_use]
    pub fn new(entity_id: EntityId, initial: S, caps: C) -> Self {
        Self::from_store(Arc::new(StateStore::new(entity_id, initial)), caps)
    }

    #[must_use]
    pub fn from_store(store: Arc<StateStore<S>>, caps: C) -> Self {
        Self { store, caps }
    }

    #[must_use]
    pub fn id(&self) -> EntityId {
        self.store.entity_id()
    }

    #[must_use]
    pub fn owner_id(&self) -> Option<ParticipantId> {
        self.caps.owner_of(self.id())
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.caps.is_owner(self.id())
    }

    #[must_use]
    pub fn store(&self) -> &Arc<StateStore<S>> {
        &self.store
    }

    #[must_use]
    pub fn capabilities(&self) -> &C {
        &self.caps
    }

    pub fn claim(&self) -> bool {
        self.caps.claim(self.id())
    }

    pub fn release(&self) -> bool {
        self.caps.release(self.id())
    }

    /// Replace the payload. Only the owner may do this.
    ///
    /// # Errors
    ///
    /// Returns `NotOwner` when the local participant does not hold the
    /// entity, or whatever [`StateStore::mutate`] reports. Either way the
    /// store is untouched.
    pub fn mutate(&self, payload: S) -> Result<Version, SyncError> {
        if !self.is_owner() {
            return Err(SyncError::NotOwner(self.id()));
        }
        self.store.mutate(payload)
    }

    /// # Errors
    ///
    /// See [`Capabilities::publish`].
    pub fn publish(&self) -> Result<StateUpdate, SyncError> {
        self.caps.publish(self.id())
    }

    #[must_use]
    pub fn snapshot(&self) -> StateView<S> {
        self.store.snapshot()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StateView<S>> {
        self.store.subscribe()
    }
}

impl<S: Payload, C: Capabilities> fmt::Debug for NetworkedObject<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkedObject")
            .field("entity_id", &self.id())
            .field("version", &self.store.version())
            .field("owner_id", &self.owner_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "object_test.rs"]
mod tests;
