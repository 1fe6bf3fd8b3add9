//! Session: the explicit context one participant syncs through.
//!
//! ARCHITECTURE
//! ============
//! A `Session` owns everything process-wide for one participant in one
//! room: the ownership manager, the sync bridge, the view provider and the
//! set of mounted entities. It is cheap to clone (one `Arc`) and every
//! adapter it hands out holds a clone as its capability handle.
//!
//! ```text
//! UiAdapter::act ─► Session::claim ─► OwnershipManager ─► Outbox (claim)
//!                └► StateStore::mutate ─► Session::publish ─► Outbox (update)
//!
//! transport ─► Session::handle_frame ─► WireMessage ─► OwnershipManager
//!                                                    └► SyncBridge ─► StateStore
//! ```
//!
//! ARBITRATION
//! ===========
//! Local claims are granted tentatively by the local manager. In
//! `Authority` mode the session authority's `entity:owner` broadcast is
//! final and overrides the tentative grant; if the authority rejects a
//! write made under it, the correction arrives as a snapshot and resets the
//! replica. In `PeerPriority` mode peers' claims are arbitrated locally with
//! the same rule every peer applies. Peer mode assumes a release is
//! delivered before any later claim on the same entity.
//!
//! A peer that loses a tentative grant may already have written under it,
//! leaving its replica at the same version the winner publishes. The loser
//! marks the entity as yielded and takes the next update at or above its
//! own version as-is, so both replicas settle on the winner's state.
//!
//! LOCKING
//! =======
//! Every lock is a `std::sync::Mutex` held for a synchronous section only,
//! never across `.await` and never two at once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::UiAdapter;
use crate::bridge::SyncBridge;
use crate::config::SyncConfig;
use crate::frame::{Data, ErrorCode, FRAME_CODE, FRAME_MESSAGE, Frame, Status};
use crate::message::{SYSCALL_CONNECTED, SYSCALL_JOIN, WireMessage};
use crate::object::{Capabilities, NetworkedObject};
use crate::ownership::{Arbitration, Ownership, OwnershipManager};
use crate::provide::Provider;
use crate::state::{ClaimRequest, EntityId, EntitySnapshot, INITIAL_VERSION, ParticipantId, StateUpdate};
use crate::store::{Payload, StateStore, SyncError};
use crate::transport::{Outbox, Transport, TransportError};

// =============================================================================
// FRAGMENTS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("entity already mounted: {0}")]
    AlreadyMounted(EntityId),
    #[error("session closed")]
    Closed,
    #[error("fragment '{name}' failed to attach: {reason}")]
    Attach { name: String, reason: String },
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ErrorCode for MountError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyMounted(_) => "E_ALREADY_MOUNTED",
            Self::Closed => "E_SESSION_CLOSED",
            Self::Attach { .. } => "E_ATTACH_FAILED",
            Self::Sync(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Attach { .. } => true,
            Self::Sync(e) => e.retryable(),
            Self::AlreadyMounted(_) | Self::Closed => false,
        }
    }
}

/// A UI fragment mounted onto a networked entity.
///
/// `attach` runs before the entity is registered and may wait on whatever
/// the fragment needs (assets, sibling views via the provider).
#[async_trait]
pub trait Fragment: Send + Sync {
    /// Name the fragment's view is provided under.
    fn name(&self) -> &str;

    async fn attach(&self, _provider: &Provider, _entity_id: EntityId) -> Result<(), MountError> {
        Ok(())
    }
}

#[async_trait]
impl Fragment for &'static str {
    fn name(&self) -> &str {
        self
    }
}

// =============================================================================
// SESSION
// =============================================================================

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    outbox: Outbox,
    config: SyncConfig,
    ownership: Mutex<OwnershipManager>,
    bridge: Mutex<SyncBridge>,
    provider: Provider,
    /// Authoritative rows for entities known to the room but not mounted here.
    pending: Mutex<HashMap<EntityId, EntitySnapshot>>,
    mounted: Mutex<HashSet<EntityId>>,
    /// Entities whose tentative local grant a peer's earlier claim took over.
    yielded: Mutex<HashSet<EntityId>>,
    closed: AtomicBool,
}

impl Session {
    #[must_use]
    pub fn new(local: ParticipantId, config: SyncConfig, transport: Arc<dyn Transport>) -> Self {
        let outbox = Outbox::new(transport, local, Some(config.room_id));
        let inner = SessionInner {
            ownership: Mutex::new(OwnershipManager::new(config.arbitration)),
            bridge: Mutex::new(SyncBridge::new(outbox.clone())),
            outbox,
            config,
            provider: Provider::new(),
            pending: Mutex::new(HashMap::new()),
            mounted: Mutex::new(HashSet::new()),
            yielded: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        };
        Self { inner: Arc::new(inner) }
    }

    #[must_use]
    pub fn local(&self) -> ParticipantId {
        self.inner.outbox.local()
    }

    #[must_use]
    pub fn room_id(&self) -> Uuid {
        self.inner.config.room_id
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn policy(&self) -> Arbitration {
        self.inner.config.arbitration
    }

    #[must_use]
    pub fn provider(&self) -> &Provider {
        &self.inner.provider
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_mounted(&self, entity_id: EntityId) -> bool {
        lock(&self.inner.mounted).contains(&entity_id)
    }

    /// Entities the room knows about that are not mounted here.
    #[must_use]
    pub fn pending(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = lock(&self.inner.pending).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Ask the session authority for the room snapshot. Returns the request
    /// frame id; the snapshot comes back as its reply.
    ///
    /// # Errors
    ///
    /// Propagates the transport's error.
    pub fn join(&self) -> Result<Uuid, TransportError> {
        let frame = Frame::request(SYSCALL_JOIN, Data::new());
        let id = frame.id;
        self.inner.outbox.send_frame(frame)?;
        info!(room_id = %self.room_id(), participant = %self.local(), "session: join requested");
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Mount / despawn
    // -------------------------------------------------------------------------

    /// Mount a fragment onto an entity and return its adapter.
    ///
    /// If the room already knows the entity, the replica starts from the
    /// authoritative row. Otherwise it starts from `initial` at
    /// [`INITIAL_VERSION`] and the entity is announced with `entity:spawn`.
    ///
    /// # Errors
    ///
    /// `AlreadyMounted` for a second mount of the same entity, `Closed`
    /// after teardown, the fragment's own error if `attach` fails, and
    /// `Sync` if the spawn could not be encoded or sent.
    pub async fn mount<S, F>(&self, entity_id: EntityId, initial: S, fragment: &F) -> Result<UiAdapter<S>, MountError>
    where
        S: Payload,
        F: Fragment + ?Sized,
    {
        if self.is_closed() {
            return Err(MountError::Closed);
        }
        if !lock(&self.inner.mounted).insert(entity_id) {
            return Err(MountError::AlreadyMounted(entity_id));
        }

        if let Err(e) = fragment.attach(&self.inner.provider, entity_id).await {
            lock(&self.inner.mounted).remove(&entity_id);
            warn!(%entity_id, fragment = fragment.name(), error = %e, "session: fragment attach failed");
            return Err(e);
        }

        match self.register(entity_id, initial) {
            Ok(store) => {
                self.inner
                    .provider
                    .provide(entity_id, fragment.name(), store.subscribe());
                info!(%entity_id, fragment = fragment.name(), version = store.version(), "session: mounted");
                Ok(UiAdapter::new(NetworkedObject::from_store(store, self.clone())))
            }
            Err(e) => {
                lock(&self.inner.mounted).remove(&entity_id);
                Err(e.into())
            }
        }
    }

    /// Build the store for a mount, from the pending row if there is one.
    fn register<S: Payload>(&self, entity_id: EntityId, initial: S) -> Result<Arc<StateStore<S>>, SyncError> {
        let row = lock(&self.inner.pending).remove(&entity_id);

        let store = match row {
            Some(row) => {
                lock(&self.inner.ownership).apply_resolution(entity_id, row.owner_id, row.claimed_at);
                match serde_json::from_value::<S>(row.payload.clone()) {
                    Ok(payload) => Arc::new(StateStore::with_version(entity_id, payload, row.version)),
                    Err(e) => {
                        warn!(%entity_id, error = %e, "session: room state does not fit payload; starting from initial");
                        Arc::new(StateStore::new(entity_id, initial))
                    }
                }
            }
            None => {
                let store = Arc::new(StateStore::new(entity_id, initial));
                let update = store.to_update()?;
                self.inner.outbox.send(&WireMessage::Spawn(EntitySnapshot {
                    entity_id,
                    payload: update.payload,
                    version: INITIAL_VERSION,
                    owner_id: None,
                    claimed_at: None,
                }))?;
                lock(&self.inner.ownership).register(entity_id);
                store
            }
        };

        lock(&self.inner.bridge).attach(store.clone());
        Ok(store)
    }

    /// Remove an entity for everyone: announce it, then drop it locally.
    ///
    /// Only the owner may despawn an owned entity; an unowned one may be
    /// despawned by anyone.
    ///
    /// # Errors
    ///
    /// `NotOwner` when another participant holds the entity, in which case
    /// nothing is sent and the local replica stays attached. Otherwise the
    /// transport's error, and the local removal happens either way.
    pub fn despawn(&self, entity_id: EntityId) -> Result<(), SyncError> {
        let owner = lock(&self.inner.ownership).owner_of(entity_id);
        if owner.is_some_and(|owner| owner != self.local()) {
            debug!(%entity_id, owner = ?owner, "session: despawn refused, entity held elsewhere");
            return Err(SyncError::NotOwner(entity_id));
        }

        let sent = self.inner.outbox.send(&WireMessage::Despawn { entity_id });
        self.forget(entity_id);
        sent.map_err(SyncError::from)
    }

    /// Void ownership, detach the replica and drop its provided views.
    fn forget(&self, entity_id: EntityId) {
        lock(&self.inner.ownership).remove(entity_id);
        lock(&self.inner.bridge).detach(entity_id);
        lock(&self.inner.pending).remove(&entity_id);
        lock(&self.inner.yielded).remove(&entity_id);
        let was_mounted = lock(&self.inner.mounted).remove(&entity_id);
        let views = self.inner.provider.remove_entity(entity_id);
        debug!(%entity_id, was_mounted, views, "session: entity despawned");
    }

    /// Release everything held locally and detach everything. Safe to call
    /// more than once; later calls do nothing.
    pub fn teardown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let local = self.local();
        let owned = {
            let mut ownership = lock(&self.inner.ownership);
            let owned = ownership.owned_by(local);
            for entity_id in &owned {
                ownership.release_ownership(*entity_id, local);
            }
            owned
        };
        for entity_id in &owned {
            if let Err(e) = self
                .inner
                .outbox
                .send(&WireMessage::Release { entity_id: *entity_id, requester_id: local })
            {
                warn!(entity_id = %entity_id, error = %e, "session: release on teardown not sent");
            }
        }

        lock(&self.inner.bridge).clear();
        lock(&self.inner.mounted).clear();
        lock(&self.inner.pending).clear();
        lock(&self.inner.yielded).clear();
        self.inner.provider.clear();
        info!(participant = %local, released = owned.len(), "session: torn down");
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Decode and apply one inbound frame. Error frames and malformed
    /// messages are logged and dropped.
    pub fn handle_frame(&self, frame: &Frame) {
        if frame.status == Status::Error {
            let code = frame.data.get(FRAME_CODE).and_then(|v| v.as_str()).unwrap_or("");
            let message = frame.data.get(FRAME_MESSAGE).and_then(|v| v.as_str()).unwrap_or("");
            warn!(syscall = %frame.syscall, code, message, "session: error frame from peer");
            return;
        }
        if frame.syscall == SYSCALL_CONNECTED {
            return;
        }

        match WireMessage::from_frame(frame) {
            Ok(message) => self.handle_message(message),
            Err(e) => warn!(syscall = %frame.syscall, error = %e, "session: malformed frame dropped"),
        }
    }

    pub fn handle_message(&self, message: WireMessage) {
        if self.is_closed() {
            debug!(kind = message.kind(), "session: closed; message ignored");
            return;
        }

        match message {
            WireMessage::Claim(claim) => self.on_claim(&claim),
            WireMessage::Release { entity_id, requester_id } => {
                lock(&self.inner.ownership).release_ownership(entity_id, requester_id);
            }
            WireMessage::Owner { entity_id, owner_id, claimed_at } => {
                self.on_owner(entity_id, owner_id, claimed_at);
            }
            WireMessage::Update(update) => self.on_update(&update),
            WireMessage::Snapshot(rows) => {
                debug!(entities = rows.len(), "session: snapshot received");
                for row in rows {
                    self.hydrate(row);
                }
            }
            WireMessage::Spawn(row) => self.on_spawn(row),
            WireMessage::Despawn { entity_id } => self.forget(entity_id),
            WireMessage::Part { participant_id } => {
                if participant_id != self.local() {
                    lock(&self.inner.ownership).disconnect(participant_id);
                }
            }
        }
    }

    fn on_claim(&self, claim: &ClaimRequest) {
        if claim.requester_id == self.local() {
            return;
        }
        match self.policy() {
            Arbitration::PeerPriority => {
                let local = self.local();
                let lost = {
                    let mut ownership = lock(&self.inner.ownership);
                    let held = ownership.is_owner(claim.entity_id, local);
                    ownership.take_ownership(claim) && held
                };
                if lost {
                    lock(&self.inner.yielded).insert(claim.entity_id);
                    info!(
                        entity_id = %claim.entity_id,
                        owner = %claim.requester_id,
                        "session: tentative claim lost to earlier peer claim"
                    );
                }
            }
            Arbitration::Authority => {
                debug!(entity_id = %claim.entity_id, requester = %claim.requester_id, "session: peer claim left to authority");
            }
        }
    }

    fn on_owner(&self, entity_id: EntityId, owner_id: Option<ParticipantId>, claimed_at: Option<i64>) {
        let previous = lock(&self.inner.ownership).apply_resolution(entity_id, owner_id, claimed_at);
        let local = self.local();
        if previous.and_then(Ownership::owner) == Some(local) && owner_id != Some(local) {
            info!(%entity_id, owner = ?owner_id, "session: local claim overridden by authority");
        }
    }

    fn on_update(&self, update: &StateUpdate) {
        {
            let mut pending = lock(&self.inner.pending);
            if let Some(row) = pending.get_mut(&update.entity_id) {
                if update.version > row.version {
                    row.payload = update.payload.clone();
                    row.version = update.version;
                }
                return;
            }
        }

        // A yielded replica takes the winner's first update even at its own
        // version; that update replaces what was written under the lost grant.
        let local_version = lock(&self.inner.bridge).version(update.entity_id);
        let catch_up = match local_version {
            Some(version) if update.version >= version => {
                lock(&self.inner.yielded).remove(&update.entity_id) && update.version == version
            }
            _ => false,
        };

        let bridge = lock(&self.inner.bridge);
        if catch_up {
            debug!(entity_id = %update.entity_id, version = update.version, "session: yielded replica takes winner's state");
            bridge.hydrate(update);
        } else {
            bridge.on_receive(update);
        }
    }

    fn on_spawn(&self, row: EntitySnapshot) {
        let entity_id = row.entity_id;
        if row.owner_id.is_some() {
            lock(&self.inner.ownership).apply_resolution(entity_id, row.owner_id, row.claimed_at);
        } else {
            lock(&self.inner.ownership).register(entity_id);
        }

        if self.is_mounted(entity_id) {
            lock(&self.inner.bridge).on_receive(&row.to_update());
            return;
        }
        let mut pending = lock(&self.inner.pending);
        let newer = pending.get(&entity_id).is_none_or(|existing| row.version > existing.version);
        if newer {
            pending.insert(entity_id, row);
        }
    }

    /// Install an authoritative row: ownership always, state into the
    /// replica if mounted, otherwise kept until mount.
    fn hydrate(&self, row: EntitySnapshot) {
        let entity_id = row.entity_id;
        lock(&self.inner.ownership).apply_resolution(entity_id, row.owner_id, row.claimed_at);

        let update = row.to_update();
        let bridge = lock(&self.inner.bridge);
        if bridge.contains(entity_id) {
            bridge.hydrate(&update);
            return;
        }
        drop(bridge);
        lock(&self.inner.pending).insert(entity_id, row);
    }
}

impl Capabilities for Session {
    fn local(&self) -> ParticipantId {
        Session::local(self)
    }

    fn claim(&self, entity_id: EntityId) -> bool {
        if self.is_closed() {
            return false;
        }
        let local = self.local();
        let claim = ClaimRequest::new(entity_id, local);

        let fresh = {
            let mut ownership = lock(&self.inner.ownership);
            if ownership.is_owner(entity_id, local) {
                return true;
            }
            ownership.take_ownership(&claim)
        };
        if !fresh {
            return false;
        }
        lock(&self.inner.yielded).remove(&entity_id);

        if let Err(e) = self.inner.outbox.send(&WireMessage::Claim(claim)) {
            warn!(%entity_id, error = %e, "session: claim not sent; grant withdrawn");
            lock(&self.inner.ownership).release_ownership(entity_id, local);
            return false;
        }
        true
    }

    fn release(&self, entity_id: EntityId) -> bool {
        let local = self.local();
        if !lock(&self.inner.ownership).release_ownership(entity_id, local) {
            return false;
        }
        if let Err(e) = self
            .inner
            .outbox
            .send(&WireMessage::Release { entity_id, requester_id: local })
        {
            warn!(%entity_id, error = %e, "session: release not sent");
        }
        true
    }

    fn is_owner(&self, entity_id: EntityId) -> bool {
        lock(&self.inner.ownership).is_owner(entity_id, self.local())
    }

    fn owner_of(&self, entity_id: EntityId) -> Option<ParticipantId> {
        lock(&self.inner.ownership).owner_of(entity_id)
    }

    fn publish(&self, entity_id: EntityId) -> Result<StateUpdate, SyncError> {
        lock(&self.inner.bridge).publish(entity_id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
