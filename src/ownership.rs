//! Ownership manager: who may mutate which entity.
//!
//! STATE MACHINE
//! =============
//! Per entity: `Unowned -> Owned(X)` on a granted claim, `Owned(X) ->
//! Unowned` on release or disconnect of X, `Owned(X) -> Owned(X)` on a
//! re-claim by X. `Owned(X) -> Owned(Y)` happens only when arbitration
//! prefers Y. No path ever records two owners.
//!
//! ARBITRATION
//! ===========
//! - `Authority`: whoever holds the entity keeps it; contenders fail. The
//!   session authority applies this rule in arrival order and broadcasts
//!   the result, which clients install with `apply_resolution`.
//! - `PeerPriority`: the claim with the lowest `(timestamp, requester_id)`
//!   wins. Every peer applies the same comparison to the same set of
//!   claims, so all of them settle on one owner once delivery completes.
//!
//! Contention is a normal outcome and reported as `false`, never an error.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::{debug, info};

use crate::state::{ClaimRequest, EntityId, ParticipantId};

/// Rule used to resolve a claim against an entity someone else holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Arbitration {
    #[default]
    Authority,
    PeerPriority,
}

impl FromStr for Arbitration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authority" => Ok(Self::Authority),
            "peer" | "peer_priority" => Ok(Self::PeerPriority),
            other => Err(format!("unknown arbitration policy '{other}' (expected 'authority' or 'peer')")),
        }
    }
}

impl fmt::Display for Arbitration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authority => f.write_str("authority"),
            Self::PeerPriority => f.write_str("peer"),
        }
    }
}

/// Ownership state of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Unowned,
    Owned { owner: ParticipantId, claimed_at: i64 },
}

impl Ownership {
    #[must_use]
    pub fn owner(self) -> Option<ParticipantId> {
        match self {
            Self::Unowned => None,
            Self::Owned { owner, .. } => Some(owner),
        }
    }

    #[must_use]
    pub fn claimed_at(self) -> Option<i64> {
        match self {
            Self::Unowned => None,
            Self::Owned { claimed_at, .. } => Some(claimed_at),
        }
    }
}

pub struct OwnershipManager {
    policy: Arbitration,
    objects: HashMap<EntityId, Ownership>,
}

impl OwnershipManager {
    #[must_use]
    pub fn new(policy: Arbitration) -> Self {
        Self { policy, objects: HashMap::new() }
    }

    #[must_use]
    pub fn policy(&self) -> Arbitration {
        self.policy
    }

    /// Start tracking an entity as unowned. No-op if already tracked.
    pub fn register(&mut self, entity_id: EntityId) {
        self.objects.entry(entity_id).or_insert(Ownership::Unowned);
    }

    /// Stop tracking an entity. Any ownership it had is void.
    pub fn remove(&mut self, entity_id: EntityId) -> Option<Ownership> {
        self.objects.remove(&entity_id)
    }

    #[must_use]
    pub fn contains(&self, entity_id: EntityId) -> bool {
        self.objects.contains_key(&entity_id)
    }

    #[must_use]
    pub fn state(&self, entity_id: EntityId) -> Option<Ownership> {
        self.objects.get(&entity_id).copied()
    }

    #[must_use]
    pub fn owner_of(&self, entity_id: EntityId) -> Option<ParticipantId> {
        self.state(entity_id).and_then(Ownership::owner)
    }

    #[must_use]
    pub fn is_owner(&self, entity_id: EntityId, participant: ParticipantId) -> bool {
        self.owner_of(entity_id) == Some(participant)
    }

    /// Entities currently held by `participant`, in id order.
    #[must_use]
    pub fn owned_by(&self, participant: ParticipantId) -> Vec<EntityId> {
        let mut owned: Vec<EntityId> = self
            .objects
            .iter()
            .filter(|(_, state)| state.owner() == Some(participant))
            .map(|(id, _)| *id)
            .collect();
        owned.sort_unstable();
        owned
    }

    /// Attempt to make the requester the owner. Untracked entities are
    /// registered on the fly (a claim may arrive before the local spawn).
    pub fn take_ownership(&mut self, claim: &ClaimRequest) -> bool {
        let policy = self.policy;
        let slot = self.objects.entry(claim.entity_id).or_insert(Ownership::Unowned);

        let granted = match *slot {
            Ownership::Unowned => {
                *slot = Ownership::Owned { owner: claim.requester_id, claimed_at: claim.timestamp };
                true
            }
            Ownership::Owned { owner, .. } if owner == claim.requester_id => true,
            Ownership::Owned { owner, claimed_at } => match policy {
                Arbitration::Authority => false,
                Arbitration::PeerPriority => {
                    if (claim.timestamp, claim.requester_id) < (claimed_at, owner) {
                        *slot = Ownership::Owned { owner: claim.requester_id, claimed_at: claim.timestamp };
                        info!(
                            entity_id = %claim.entity_id,
                            previous = %owner,
                            owner = %claim.requester_id,
                            "ownership: earlier claim takes over"
                        );
                        true
                    } else {
                        false
                    }
                }
            },
        };

        debug!(
            entity_id = %claim.entity_id,
            requester = %claim.requester_id,
            granted,
            "ownership: claim"
        );
        granted
    }

    /// Give up ownership. Only the current owner can release; anyone else
    /// is a no-op.
    pub fn release_ownership(&mut self, entity_id: EntityId, requester: ParticipantId) -> bool {
        let Some(slot) = self.objects.get_mut(&entity_id) else {
            return false;
        };
        if slot.owner() != Some(requester) {
            return false;
        }
        *slot = Ownership::Unowned;
        debug!(%entity_id, %requester, "ownership: released");
        true
    }

    /// Implicit release of everything a departed participant held.
    pub fn disconnect(&mut self, participant: ParticipantId) -> Vec<EntityId> {
        let released = self.owned_by(participant);
        for entity_id in &released {
            self.objects.insert(*entity_id, Ownership::Unowned);
        }
        if !released.is_empty() {
            info!(%participant, count = released.len(), "ownership: released on disconnect");
        }
        released
    }

    /// Install an authoritative decision, overriding any local tentative
    /// state. Returns the state it replaced.
    pub fn apply_resolution(
        &mut self,
        entity_id: EntityId,
        owner: Option<ParticipantId>,
        claimed_at: Option<i64>,
    ) -> Option<Ownership> {
        let next = match owner {
            Some(owner) => Ownership::Owned { owner, claimed_at: claimed_at.unwrap_or_default() },
            None => Ownership::Unowned,
        };
        self.objects.insert(entity_id, next)
    }
}

#[cfg(test)]
#[path = "ownership_test.rs"]
mod tests;
