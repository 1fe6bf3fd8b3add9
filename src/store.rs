//! State store: one entity's shared state, with a read-only projection.
//!
//! DESIGN
//! ======
//! The mutable `SharedState` sits behind a mutex and is never handed out.
//! Consumers get a `StateView`: an immutable `Arc` copy taken at the moment
//! of the last change, with no mutation path through its interface.
//!
//! Every change republishes a fresh view on a `watch` channel, so a UI
//! fragment holding a receiver observes both local mutations and accepted
//! remote updates without re-subscribing.
//!
//! The store does not check ownership. The ownership gate lives in the
//! caller (`NetworkedObject::mutate`), which keeps identity out of here.
//!
//! LOCKING
//! =======
//! `std::sync::Mutex`, held only for the synchronous body of each method.
//! Poisoning is ignored: every critical section leaves the state whole.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::state::{EntityId, INITIAL_VERSION, SharedState, StateUpdate, Version};

// =============================================================================
// PAYLOAD
// =============================================================================

/// Shape of an entity's state. Anything serde can move as a JSON object.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("participant does not own entity {0}")]
    NotOwner(EntityId),
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),
    #[error("update for {actual} routed to store of {expected}")]
    EntityMismatch { expected: EntityId, actual: EntityId },
    #[error("malformed payload for {entity_id}: {reason}")]
    MalformedPayload { entity_id: EntityId, reason: String },
    #[error("failed to encode payload for {entity_id}: {reason}")]
    Encode { entity_id: EntityId, reason: String },
    #[error("version counter of {0} is exhausted")]
    VersionExhausted(EntityId),
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

impl crate::frame::ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotOwner(_) => "E_NOT_OWNER",
            Self::UnknownEntity(_) => "E_UNKNOWN_ENTITY",
            Self::EntityMismatch { .. } => "E_ENTITY_MISMATCH",
            Self::MalformedPayload { .. } => "E_MALFORMED_PAYLOAD",
            Self::Encode { .. } => "E_ENCODE",
            Self::VersionExhausted(_) => "E_VERSION_EXHAUSTED",
            Self::Transport(_) => "E_TRANSPORT",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Outcome of offering a remote update to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The update was newer and replaced the local state.
    Replaced(Version),
    /// The update was not newer than `local`; nothing changed.
    Stale { local: Version },
}

// =============================================================================
// VIEW
// =============================================================================

/// Immutable projection of an entity's state.
///
/// Cloning is cheap. There is no `DerefMut` and no interior mutability, so
/// nothing holding a view can change the store behind it.
#[derive(Debug)]
pub struct StateView<S> {
    entity_id: EntityId,
    payload: Arc<S>,
    version: Version,
}

impl<S> Clone for StateView<S> {
    fn clone(&self) -> Self {
        Self { entity_id: self.entity_id, payload: Arc::clone(&self.payload), version: self.version }
    }
}

impl<S> StateView<S> {
    #[must_use]
    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    #[must_use]
    pub fn payload(&self) -> &S {
        &self.payload
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }
}

impl<S> Deref for StateView<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.payload
    }
}

// =============================================================================
// STORE
// =============================================================================

pub struct StateStore<S> {
    entity_id: EntityId,
    state: Mutex<SharedState<S>>,
    views: watch::Sender<StateView<S>>,
}

impl<S: Payload> StateStore<S> {
    /// Create a store at [`INITIAL_VERSION`].
    #[must_use]
    pub fn new(entity_id: EntityId, initial: S) -> Self {
        Self::with_version(entity_id, initial, INITIAL_VERSION)
    }

    #[must_use]
    pub fn with_version(entity_id: EntityId, initial: S, version: Version) -> Self {
        let view = StateView { entity_id, payload: Arc::new(initial.clone()), version };
        let (views, _) = watch::channel(view);
        Self { entity_id, state: Mutex::new(SharedState { entity_id, payload: initial, version }), views }
    }

    #[must_use]
    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.lock().version
    }

    /// Replace the payload and bump the version by one.
    ///
    /// The caller must hold ownership of the entity.
    ///
    /// # Errors
    ///
    /// Returns `VersionExhausted` when the version is already `u64::MAX`;
    /// the store is untouched.
    pub fn mutate(&self, payload: S) -> Result<Version, SyncError> {
        let mut state = self.lock();
        let version = state.version.checked_add(1).ok_or(SyncError::VersionExhausted(self.entity_id))?;
        state.payload = payload;
        state.version = version;
        let view = view_of(&state);
        drop(state);

        self.views.send_replace(view);
        debug!(entity_id = %self.entity_id, version, "store: local mutation");
        Ok(version)
    }

    /// Offer a remote update. Only strictly newer versions are applied.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` when the payload does not decode into `S`
    /// (local state untouched) and `EntityMismatch` when the update belongs
    /// to another entity.
    pub fn apply_remote(&self, update: &StateUpdate) -> Result<Applied, SyncError> {
        if update.entity_id != self.entity_id {
            return Err(SyncError::EntityMismatch { expected: self.entity_id, actual: update.entity_id });
        }

        let mut state = self.lock();
        if update.version <= state.version {
            trace!(
                entity_id = %self.entity_id,
                incoming = update.version,
                local = state.version,
                "store: stale update discarded"
            );
            return Ok(Applied::Stale { local: state.version });
        }

        // Decode fully before touching state.
        let payload: S = serde_json::from_value(update.payload.clone())
            .map_err(|e| SyncError::MalformedPayload { entity_id: self.entity_id, reason: e.to_string() })?;

        state.payload = payload;
        state.version = update.version;
        let view = view_of(&state);
        drop(state);

        self.views.send_replace(view);
        debug!(entity_id = %self.entity_id, version = update.version, "store: remote update applied");
        Ok(Applied::Replaced(update.version))
    }

    /// Install an authoritative state regardless of version order.
    ///
    /// Used when the session authority corrects a replica, e.g. after a
    /// tentative write it rejected. Subscribers are notified.
    ///
    /// # Errors
    ///
    /// Same as [`StateStore::apply_remote`], minus staleness.
    pub fn reset(&self, update: &StateUpdate) -> Result<Version, SyncError> {
        if update.entity_id != self.entity_id {
            return Err(SyncError::EntityMismatch { expected: self.entity_id, actual: update.entity_id });
        }
        let payload: S = serde_json::from_value(update.payload.clone())
            .map_err(|e| SyncError::MalformedPayload { entity_id: self.entity_id, reason: e.to_string() })?;

        let mut state = self.lock();
        let previous = state.version;
        state.payload = payload;
        state.version = update.version;
        let view = view_of(&state);
        drop(state);

        self.views.send_replace(view);
        debug!(entity_id = %self.entity_id, previous, version = update.version, "store: reset to authoritative state");
        Ok(update.version)
    }

    /// Current read-only view.
    #[must_use]
    pub fn snapshot(&self) -> StateView<S> {
        self.views.borrow().clone()
    }

    /// Receiver that yields a new view after every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StateView<S>> {
        self.views.subscribe()
    }

    /// Encode the current state as a wire update.
    ///
    /// # Errors
    ///
    /// Returns `Encode` if the payload does not serialize to a JSON object.
    pub fn to_update(&self) -> Result<StateUpdate, SyncError> {
        let state = self.lock();
        let payload = serde_json::to_value(&state.payload)
            .map_err(|e| SyncError::Encode { entity_id: self.entity_id, reason: e.to_string() })?;
        if !payload.is_object() {
            return Err(SyncError::Encode {
                entity_id: self.entity_id,
                reason: "payload must serialize to a JSON object".into(),
            });
        }
        Ok(StateUpdate { entity_id: self.entity_id, payload, version: state.version })
    }

    fn lock(&self) -> MutexGuard<'_, SharedState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn view_of<S: Clone>(state: &SharedState<S>) -> StateView<S> {
    StateView { entity_id: state.entity_id, payload: Arc::new(state.payload.clone()), version: state.version }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
