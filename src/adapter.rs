//! UI adapter: what a fragment reads from and writes through.
//!
//! Reads are a read-only view (pull with `view`, push with `subscribe`).
//! Writes go through `act`, which claims, mutates and publishes in one
//! synchronous step. A write while someone else holds the entity is a
//! silent no-op: the fragment keeps rendering the owner's state.

use std::fmt;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::object::{Capabilities, NetworkedObject};
use crate::session::Session;
use crate::state::{EntityId, ParticipantId};
use crate::store::{Payload, StateView};

pub struct UiAdapter<S, C = Session> {
    object: NetworkedObject<S, C>,
}

impl<S: Payload, C: Capabilities> UiAdapter<S, C> {
    #[must_use]
    pub fn new(object: NetworkedObject<S, C>) -> Self {
        Self { object }
    }

    #[must_use]
    pub fn entity_id(&self) -> EntityId {
        self.object.id()
    }

    #[must_use]
    pub fn object(&self) -> &NetworkedObject<S, C> {
        &self.object
    }

    #[must_use]
    pub fn view(&self) -> StateView<S> {
        self.object.snapshot()
    }

    /// Receiver that sees every local mutation and every accepted remote
    /// update, for the adapter's whole lifetime.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StateView<S>> {
        self.object.subscribe()
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.object.is_owner()
    }

    #[must_use]
    pub fn owner_id(&self) -> Option<ParticipantId> {
        self.object.owner_id()
    }

    /// Claim, apply `f` to the current state, publish. Returns `false`
    /// without touching anything if the claim is denied.
    ///
    /// A failed publish is logged and the local mutation stands; the next
    /// successful publish carries the latest state.
    pub fn act<F>(&self, f: F) -> bool
    where
        F: FnOnce(&S) -> S,
    {
        let entity_id = self.entity_id();
        if !self.object.claim() {
            debug!(%entity_id, owner = ?self.object.owner_id(), "adapter: claim denied");
            return false;
        }

        let current = self.object.snapshot();
        let next = f(current.payload());
        if let Err(e) = self.object.mutate(next) {
            debug!(%entity_id, error = %e, "adapter: mutation refused");
            return false;
        }

        if let Err(e) = self.object.publish() {
            warn!(%entity_id, error = %e, "adapter: publish failed");
        }
        true
    }

    /// Hand ownership back. `false` if not held.
    pub fn release(&self) -> bool {
        self.object.release()
    }
}

impl<S: Payload, C: Capabilities> fmt::Debug for UiAdapter<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UiAdapter").field("object", &self.object).finish()
    }
}

#[cfg(test)]
#[path = "adapter_test.rs"]
mod tests;
