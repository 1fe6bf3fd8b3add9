use super::*;
use crate::frame::Frame;
use crate::transport;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    count: i64,
}

fn session(arbitration: Arbitration) -> (Session, mpsc::Receiver<Frame>) {
    let (transport, rx) = transport::channel(64);
    let config = SyncConfig { arbitration, ..SyncConfig::default() };
    (Session::new(ParticipantId::new(), config, Arc::new(transport)), rx)
}

/// Deliver everything queued on `rx` to `to`, through the binary codec.
fn pump(rx: &mut mpsc::Receiver<Frame>, to: &Session) -> usize {
    let mut n = 0;
    while let Ok(frame) = rx.try_recv() {
        let decoded = crate::frame::decode(&crate::frame::encode(&frame)).unwrap();
        to.handle_frame(&decoded);
        n += 1;
    }
    n
}

fn sent(rx: &mut mpsc::Receiver<Frame>) -> Vec<WireMessage> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        out.push(WireMessage::from_frame(&frame).unwrap());
    }
    out
}

struct Failing;

#[async_trait]
impl Fragment for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    async fn attach(&self, _provider: &Provider, _entity_id: EntityId) -> Result<(), MountError> {
        Err(MountError::Attach { name: "failing".into(), reason: "asset missing".into() })
    }
}

/// Waits on a sibling view before attaching.
struct Badge;

#[async_trait]
impl Fragment for Badge {
    fn name(&self) -> &str {
        "badge"
    }

    async fn attach(&self, provider: &Provider, entity_id: EntityId) -> Result<(), MountError> {
        provider
            .inject::<Counter>(entity_id, "counter")
            .map(|_| ())
            .ok_or_else(|| MountError::Attach { name: "badge".into(), reason: "counter not provided".into() })
    }
}

// =============================================================================
// mount
// =============================================================================

#[tokio::test]
async fn mount_announces_new_entity() {
    let (session, mut rx) = session(Arbitration::Authority);
    let entity_id = EntityId::new();
    let adapter = session.mount(entity_id, Counter { count: 0 }, &"counter").await.unwrap();

    assert_eq!(adapter.view().version(), INITIAL_VERSION);
    assert!(session.is_mounted(entity_id));
    let msgs = sent(&mut rx);
    assert!(matches!(
        msgs.as_slice(),
        [WireMessage::Spawn(row)] if row.entity_id == entity_id && row.payload == json!({"count": 0}) && row.version == 1
    ));
}

#[tokio::test]
async fn mounting_twice_is_an_error() {
    let (session, _rx) = session(Arbitration::Authority);
    let entity_id = EntityId::new();
    let _first = session.mount(entity_id, Counter { count: 0 }, &"counter").await.unwrap();

    let err = session.mount(entity_id, Counter { count: 0 }, &"counter").await.unwrap_err();
    assert!(matches!(err, MountError::AlreadyMounted(id) if id == entity_id));
    assert_eq!(err.error_code(), "E_ALREADY_MOUNTED");
}

#[tokio::test]
async fn failed_attach_leaves_nothing_behind() {
    let (session, mut rx) = session(Arbitration::Authority);
    let entity_id = EntityId::new();

    let err = session.mount(entity_id, Counter { count: 0 }, &Failing).await.unwrap_err();
    assert!(matches!(err, MountError::Attach { .. }));
    assert!(!session.is_mounted(entity_id));
    assert!(sent(&mut rx).is_empty());

    // The slot is free again.
    assert!(session.mount(entity_id, Counter { count: 0 }, &"counter").await.is_ok());
}

#[tokio::test]
async fn sibling_fragments_share_one_view() {
    let (session, _rx) = session(Arbitration::Authority);
    let counter_id = EntityId::new();
    let badge_id = EntityId::new();

    // Badge on an entity nothing provides for fails to attach.
    assert!(session.mount(badge_id, Counter { count: 0 }, &Badge).await.is_err());

    let adapter = session.mount(counter_id, Counter { count: 0 }, &"counter").await.unwrap();
    let mut injected = session.provider().inject::<Counter>(counter_id, "counter").unwrap();
    adapter.act(|c| Counter { count: c.count + 2 });
    assert_eq!(injected.borrow_and_update().count, 2);
}

#[tokio::test]
async fn mount_hydrates_from_join_snapshot() {
    let (session, mut rx) = session(Arbitration::Authority);
    let entity_id = EntityId::new();
    let owner = ParticipantId::new();

    session.handle_message(WireMessage::Snapshot(vec![EntitySnapshot {
        entity_id,
        payload: json!({"count": 12}),
        version: 6,
        owner_id: Some(owner),
        claimed_at: Some(40),
    }]));
    assert_eq!(session.pending(), vec![entity_id]);

    let adapter = session.mount(entity_id, Counter { count: 0 }, &"counter").await.unwrap();
    assert_eq!(adapter.view().count, 12);
    assert_eq!(adapter.view().version(), 6);
    assert_eq!(adapter.owner_id(), Some(owner));
    assert!(session.pending().is_empty());
    // Known to the room already: no spawn.
    assert!(sent(&mut rx).is_empty());
}

#[tokio::test]
async fn updates_before_mount_keep_pending_row_current() {
    let (session, _rx) = session(Arbitration::Authority);
    let entity_id = EntityId::new();
    session.handle_message(WireMessage::Spawn(EntitySnapshot {
        entity_id,
        payload: json!({"count": 1}),
        version: 1,
        owner_id: None,
        claimed_at: None,
    }));
    session.handle_message(WireMessage::Update(StateUpdate { entity_id, payload: json!({"count": 4}), version: 3 }));
    session.handle_message(WireMessage::Update(StateUpdate { entity_id, payload: json!({"count": 2}), version: 2 }));

    let adapter = session.mount(entity_id, Counter { count: 0 }, &"counter").await.unwrap();
    assert_eq!(adapter.view().count, 4);
    assert_eq!(adapter.view().version(), 3);
}

#[tokio::test]
async fn snapshot_corrects_mounted_replica() {
    let (session, _rx) = session(Arbitration::Authority);
    let entity_id = EntityId::new();
    let adapter = session.mount(entity_id, Counter { count: 0 }, &"counter").await.unwrap();
    adapter.act(|_| Counter { count: 50 });
    adapter.act(|_| Counter { count: 51 });
    let winner = ParticipantId::new();

    // The authority gave the entity to someone else and rejected our writes.
    session.handle_message(WireMessage::Snapshot(vec![EntitySnapshot {
        entity_id,
        payload: json!({"count": 7}),
        version: 2,
        owner_id: Some(winner),
        claimed_at: Some(1),
    }]));

    assert_eq!(adapter.view().count, 7);
    assert_eq!(adapter.view().version(), 2);
    assert!(!adapter.is_owner());

    session.handle_message(WireMessage::Update(StateUpdate { entity_id, payload: json!({"count": 8}), version: 3 }));
    assert_eq!(adapter.view().count, 8);
}

// =============================================================================
// inbound handling
// =============================================================================

#[tokio::test]
async fn malformed_and_error_frames_leave_state_untouched() {
    let (session, _rx) = session(Arbitration::Authority);
    let entity_id = EntityId::new();
    let adapter = session.mount(entity_id, Counter { count: 3 }, &"counter").await.unwrap();

    let missing_version = Frame::request(crate::message::SYSCALL_UPDATE, Data::new())
        .with_data("entity_id", entity_id.to_string())
        .with_data("payload", json!({"count": 99}));
    session.handle_frame(&missing_version);

    let wrong_shape = WireMessage::Update(StateUpdate { entity_id, payload: json!({"count": "many"}), version: 9 });
    session.handle_frame(&wrong_shape.to_frame());

    let unknown = Frame::request("entity:teleport", Data::new());
    session.handle_frame(&unknown);

    let error = unknown.error("E_NOT_OWNER");
    session.handle_frame(&error);

    assert_eq!(adapter.view().count, 3);
    assert_eq!(adapter.view().version(), 1);
}

#[tokio::test]
async fn owner_broadcast_overrides_tentative_grant() {
    let (session, mut rx) = session(Arbitration::Authority);
    let entity_id = EntityId::new();
    let adapter = session.mount(entity_id, Counter { count: 0 }, &"counter").await.unwrap();
    assert!(adapter.act(|c| Counter { count: c.count + 1 }));
    sent(&mut rx);

    let winner = ParticipantId::new();
    session.handle_message(WireMessage::Owner { entity_id, owner_id: Some(winner), claimed_at: Some(5) });

    assert!(!adapter.is_owner());
    assert!(!adapter.act(|c| Counter { count: c.count + 1 }));

    session.handle_message(WireMessage::Owner { entity_id, owner_id: None, claimed_at: None });
    assert!(adapter.act(|c| Counter { count: c.count + 1 }));
}

#[tokio::test]
async fn despawn_voids_ownership_and_views() {
    let (session, mut rx) = session(Arbitration::Authority);
    let entity_id = EntityId::new();
    let adapter = session.mount(entity_id, Counter { count: 0 }, &"counter").await.unwrap();
    adapter.act(|c| c.clone());
    sent(&mut rx);

    session.despawn(entity_id).unwrap();

    assert!(!session.is_mounted(entity_id));
    assert_eq!(session.owner_of(entity_id), None);
    assert!(session.provider().inject::<Counter>(entity_id, "counter").is_none());
    assert!(matches!(sent(&mut rx).as_slice(), [WireMessage::Despawn { .. }]));

    // Publishing a despawned entity finds nothing to send.
    assert!(matches!(adapter.object().publish(), Err(SyncError::UnknownEntity(_))));
}

#[tokio::test]
async fn despawn_of_entity_held_elsewhere_is_refused() {
    let (session, mut rx) = session(Arbitration::Authority);
    let entity_id = EntityId::new();
    let adapter = session.mount(entity_id, Counter { count: 0 }, &"counter").await.unwrap();
    let other = ParticipantId::new();
    session.handle_message(WireMessage::Owner { entity_id, owner_id: Some(other), claimed_at: Some(1) });
    sent(&mut rx);

    let err = session.despawn(entity_id).unwrap_err();
    assert!(matches!(err, SyncError::NotOwner(id) if id == entity_id));
    assert!(sent(&mut rx).is_empty());
    assert!(session.is_mounted(entity_id));
    assert_eq!(session.owner_of(entity_id), Some(other));

    // The replica is still attached and follows the owner.
    session.handle_message(WireMessage::Update(StateUpdate { entity_id, payload: json!({"count": 4}), version: 2 }));
    assert_eq!(adapter.view().count, 4);
}

#[tokio::test]
async fn despawn_of_unowned_entity_is_allowed() {
    let (session, mut rx) = session(Arbitration::Authority);
    let entity_id = EntityId::new();
    let _adapter = session.mount(entity_id, Counter { count: 0 }, &"counter").await.unwrap();
    sent(&mut rx);

    session.despawn(entity_id).unwrap();
    assert!(!session.is_mounted(entity_id));
    assert!(matches!(sent(&mut rx).as_slice(), [WireMessage::Despawn { .. }]));
}

#[tokio::test]
async fn remote_despawn_is_applied_locally() {
    let (session, mut rx) = session(Arbitration::Authority);
    let entity_id = EntityId::new();
    let _adapter = session.mount(entity_id, Counter { count: 0 }, &"counter").await.unwrap();
    sent(&mut rx);

    session.handle_message(WireMessage::Despawn { entity_id });
    assert!(!session.is_mounted(entity_id));
    assert!(sent(&mut rx).is_empty());
}

#[tokio::test]
async fn teardown_releases_everything_once() {
    let (session, mut rx) = session(Arbitration::Authority);
    let a = session.mount(EntityId::new(), Counter { count: 0 }, &"a").await.unwrap();
    let b = session.mount(EntityId::new(), Counter { count: 0 }, &"b").await.unwrap();
    a.act(|c| c.clone());
    b.act(|c| c.clone());
    sent(&mut rx);

    session.teardown();
    session.teardown();

    let releases = sent(&mut rx)
        .into_iter()
        .filter(|m| matches!(m, WireMessage::Release { .. }))
        .count();
    assert_eq!(releases, 2);
    assert!(session.is_closed());
    assert!(!session.is_mounted(a.entity_id()));
    assert!(!a.act(|c| c.clone()));
    assert!(matches!(
        session.mount(EntityId::new(), Counter { count: 0 }, &"c").await,
        Err(MountError::Closed)
    ));
}

// =============================================================================
// two participants
// =============================================================================

#[tokio::test]
async fn claim_update_disconnect_scenario() {
    let (a, mut a_out) = session(Arbitration::PeerPriority);
    let (b, mut b_out) = session(Arbitration::PeerPriority);
    let e1 = EntityId::new();

    let a_view = a.mount(e1, Counter { count: 0 }, &"counter").await.unwrap();
    pump(&mut a_out, &b);
    let b_view = b.mount(e1, Counter { count: 0 }, &"counter").await.unwrap();
    assert_eq!(b_view.view().version(), 1);

    // A claims the unowned entity; B learns of it.
    assert!(a_view.object().claim());
    pump(&mut a_out, &b);
    assert_eq!(b.owner_of(e1), Some(a.local()));

    // B's claim is later and fails; nothing goes out.
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(!b_view.act(|c| Counter { count: c.count + 10 }));
    assert_eq!(pump(&mut b_out, &a), 0);

    // A mutates {count:0} v1 -> {count:1} v2 and publishes.
    assert!(a_view.act(|c| Counter { count: c.count + 1 }));
    pump(&mut a_out, &b);
    assert_eq!(b_view.view().count, 1);
    assert_eq!(b_view.view().version(), 2);

    // A leaves; B sees the part and can claim.
    b.handle_message(WireMessage::Part { participant_id: a.local() });
    assert_eq!(b.owner_of(e1), None);
    assert!(b_view.act(|c| Counter { count: c.count + 1 }));
    assert_eq!(b.owner_of(e1), Some(b.local()));
    assert_eq!(b_view.view().version(), 3);
}

#[tokio::test]
async fn teardown_release_frees_entity_for_peer() {
    let (a, mut a_out) = session(Arbitration::PeerPriority);
    let (b, _b_out) = session(Arbitration::PeerPriority);
    let e1 = EntityId::new();

    let a_view = a.mount(e1, Counter { count: 0 }, &"counter").await.unwrap();
    pump(&mut a_out, &b);
    let b_view = b.mount(e1, Counter { count: 0 }, &"counter").await.unwrap();

    a_view.act(|c| c.clone());
    pump(&mut a_out, &b);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(!b_view.act(|c| c.clone()));

    a.teardown();
    pump(&mut a_out, &b);
    assert!(b_view.act(|c| c.clone()));
}

#[tokio::test]
async fn concurrent_peer_claims_converge() {
    let (a, mut a_out) = session(Arbitration::PeerPriority);
    let (b, mut b_out) = session(Arbitration::PeerPriority);
    let e1 = EntityId::new();

    let a_view = a.mount(e1, Counter { count: 0 }, &"counter").await.unwrap();
    pump(&mut a_out, &b);
    let b_view = b.mount(e1, Counter { count: 0 }, &"counter").await.unwrap();

    // Both claim and write before hearing from each other.
    assert!(a_view.act(|_| Counter { count: 100 }));
    assert!(b_view.act(|_| Counter { count: 200 }));
    pump(&mut a_out, &b);
    pump(&mut b_out, &a);

    let owner_at_a = a.owner_of(e1);
    let owner_at_b = b.owner_of(e1);
    assert!(owner_at_a.is_some());
    assert_eq!(owner_at_a, owner_at_b);
    assert_ne!(a_view.is_owner(), b_view.is_owner());

    let expected = if a_view.is_owner() { 100 } else { 200 };
    assert_eq!(a_view.view().count, expected);
    assert_eq!(b_view.view().count, expected);
    assert_eq!(a_view.view().version(), b_view.view().version());

    // The winner keeps writing and the loser follows.
    let (winner, mut winner_out, loser) = if a_view.is_owner() { (&a_view, a_out, &b) } else { (&b_view, b_out, &a) };
    assert!(winner.act(|c| Counter { count: c.count + 1 }));
    pump(&mut winner_out, loser);
    assert_eq!(a_view.view().count, expected + 1);
    assert_eq!(b_view.view().count, expected + 1);
}

#[tokio::test]
async fn losing_peer_takes_winner_state_at_equal_version() {
    let (session, _out) = session(Arbitration::PeerPriority);
    let e1 = EntityId::new();
    let view = session.mount(e1, Counter { count: 0 }, &"counter").await.unwrap();
    assert!(view.act(|_| Counter { count: 7 }));
    assert_eq!(view.view().version(), 2);

    // A peer whose claim sorts first takes the entity over.
    let winner = ParticipantId::new();
    session.handle_message(WireMessage::Claim(ClaimRequest { entity_id: e1, requester_id: winner, timestamp: 0 }));
    assert_eq!(session.owner_of(e1), Some(winner));

    session.handle_message(WireMessage::Update(StateUpdate { entity_id: e1, payload: json!({"count": 3}), version: 2 }));
    assert_eq!(view.view().count, 3);
    assert_eq!(view.view().version(), 2);

    // Once caught up, equal versions are stale again.
    session.handle_message(WireMessage::Update(StateUpdate { entity_id: e1, payload: json!({"count": 9}), version: 2 }));
    assert_eq!(view.view().count, 3);
}

#[tokio::test]
async fn winning_peer_keeps_its_state_against_equal_version() {
    let (session, _out) = session(Arbitration::PeerPriority);
    let e1 = EntityId::new();
    let view = session.mount(e1, Counter { count: 0 }, &"counter").await.unwrap();
    assert!(view.act(|_| Counter { count: 7 }));

    // The later claim loses, so its write at the same version is stale.
    let late = ParticipantId::new();
    session.handle_message(WireMessage::Claim(ClaimRequest { entity_id: e1, requester_id: late, timestamp: i64::MAX }));
    assert!(view.is_owner());

    session.handle_message(WireMessage::Update(StateUpdate { entity_id: e1, payload: json!({"count": 3}), version: 2 }));
    assert_eq!(view.view().count, 7);
}

#[tokio::test]
async fn authority_mode_ignores_peer_claims() {
    let (a, _a_out) = session(Arbitration::Authority);
    let e1 = EntityId::new();
    let _view = a.mount(e1, Counter { count: 0 }, &"counter").await.unwrap();

    a.handle_message(WireMessage::Claim(ClaimRequest { entity_id: e1, requester_id: ParticipantId::new(), timestamp: 0 }));
    assert_eq!(a.owner_of(e1), None);
}
