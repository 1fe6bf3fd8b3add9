//! Named read-only views shared between sibling UI fragments.
//!
//! A mounted entity's view is provided once under the fragment's name;
//! anything else rendered for the same entity injects it instead of
//! holding its own copy. Slots are type-erased, so injecting with the
//! wrong payload type finds nothing rather than panicking.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::state::EntityId;
use crate::store::{Payload, StateView};

type Slot = Box<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct Provider {
    slots: Mutex<HashMap<(EntityId, String), Slot>>,
}

impl Provider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a view under `(entity_id, name)`. Returns `true` if it
    /// replaced an earlier registration.
    pub fn provide<S: Payload>(
        &self,
        entity_id: EntityId,
        name: impl Into<String>,
        views: watch::Receiver<StateView<S>>,
    ) -> bool {
        self.lock()
            .insert((entity_id, name.into()), Box::new(views))
            .is_some()
    }

    /// Look up a provided view. `None` if nothing is registered or the
    /// registration holds a different payload type.
    #[must_use]
    pub fn inject<S: Payload>(&self, entity_id: EntityId, name: &str) -> Option<watch::Receiver<StateView<S>>> {
        self.lock()
            .get(&(entity_id, name.to_owned()))
            .and_then(|slot| slot.downcast_ref::<watch::Receiver<StateView<S>>>())
            .cloned()
    }

    /// Drop every view provided for an entity. Returns how many went.
    pub fn remove_entity(&self, entity_id: EntityId) -> usize {
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|(id, _), _| *id != entity_id);
        before - slots.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(EntityId, String), Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
