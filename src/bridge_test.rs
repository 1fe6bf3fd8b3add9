use super::*;
use crate::state::ParticipantId;
use crate::transport::{self, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    count: i64,
}

fn bridge() -> (SyncBridge, mpsc::Receiver<crate::frame::Frame>) {
    let (transport, rx) = transport::channel(8);
    let outbox = Outbox::new(Arc::new(transport), ParticipantId::new(), None);
    (SyncBridge::new(outbox), rx)
}

#[test]
fn publish_sends_current_state() {
    let (mut bridge, mut rx) = bridge();
    let store = Arc::new(StateStore::new(EntityId::new(), Counter { count: 0 }));
    bridge.attach(store.clone());
    store.mutate(Counter { count: 1 }).unwrap();

    let sent = bridge.publish(store.entity_id()).unwrap();
    assert_eq!(sent.version, 2);

    let frame = rx.try_recv().unwrap();
    let WireMessage::Update(update) = WireMessage::from_frame(&frame).unwrap() else {
        panic!("expected update");
    };
    assert_eq!(update, sent);
    assert_eq!(update.payload, json!({"count": 1}));
}

#[test]
fn publish_unknown_entity_fails() {
    let (bridge, _rx) = bridge();
    assert!(matches!(bridge.publish(EntityId::new()), Err(SyncError::UnknownEntity(_))));
}

#[test]
fn publish_reports_closed_transport() {
    let (mut bridge, rx) = bridge();
    drop(rx);
    let store = Arc::new(StateStore::new(EntityId::new(), Counter { count: 0 }));
    bridge.attach(store.clone());

    let err = bridge.publish(store.entity_id()).unwrap_err();
    assert!(matches!(err, SyncError::Transport(TransportError::Closed)));
}

#[test]
fn on_receive_routes_by_entity() {
    let (mut bridge, _rx) = bridge();
    let a = Arc::new(StateStore::new(EntityId::new(), Counter { count: 0 }));
    let b = Arc::new(StateStore::new(EntityId::new(), Counter { count: 0 }));
    bridge.attach(a.clone());
    bridge.attach(b.clone());

    let upd = StateUpdate { entity_id: b.entity_id(), payload: json!({"count": 8}), version: 3 };
    assert_eq!(bridge.on_receive(&upd), Received::Applied(3));
    assert_eq!(b.snapshot().count, 8);
    assert_eq!(a.snapshot().count, 0);
}

#[test]
fn on_receive_classifies_outcomes() {
    let (mut bridge, _rx) = bridge();
    let store = Arc::new(StateStore::new(EntityId::new(), Counter { count: 0 }));
    bridge.attach(store.clone());
    let id = store.entity_id();

    let stale = StateUpdate { entity_id: id, payload: json!({"count": 1}), version: 1 };
    assert_eq!(bridge.on_receive(&stale), Received::Stale);

    let malformed = StateUpdate { entity_id: id, payload: json!({"count": true}), version: 2 };
    assert_eq!(bridge.on_receive(&malformed), Received::Rejected);
    assert_eq!(store.version(), 1);

    let unknown = StateUpdate { entity_id: EntityId::new(), payload: json!({"count": 1}), version: 2 };
    assert_eq!(bridge.on_receive(&unknown), Received::Unknown);
}

#[test]
fn replicas_with_different_payload_shapes_share_registry() {
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Label {
        text: String,
    }

    let (mut bridge, _rx) = bridge();
    let counter = Arc::new(StateStore::new(EntityId::new(), Counter { count: 0 }));
    let label = Arc::new(StateStore::new(EntityId::new(), Label { text: String::new() }));
    bridge.attach(counter.clone());
    bridge.attach(label.clone());

    let upd = StateUpdate { entity_id: label.entity_id(), payload: json!({"text": "hi"}), version: 2 };
    assert_eq!(bridge.on_receive(&upd), Received::Applied(2));
    assert_eq!(label.snapshot().text, "hi");
    assert_eq!(bridge.entities().len(), 2);
}

#[test]
fn detach_stops_routing() {
    let (mut bridge, _rx) = bridge();
    let store = Arc::new(StateStore::new(EntityId::new(), Counter { count: 0 }));
    bridge.attach(store.clone());

    assert!(bridge.detach(store.entity_id()));
    assert!(!bridge.contains(store.entity_id()));
    let upd = StateUpdate { entity_id: store.entity_id(), payload: json!({"count": 1}), version: 2 };
    assert_eq!(bridge.on_receive(&upd), Received::Unknown);
}

#[test]
fn replication_reproduces_owner_state_exactly() {
    let (mut owner_bridge, mut wire) = bridge();
    let (mut replica_bridge, _rx) = bridge();
    let id = EntityId::new();
    let owner = Arc::new(StateStore::new(id, Counter { count: 0 }));
    let replica = Arc::new(StateStore::new(id, Counter { count: 0 }));
    owner_bridge.attach(owner.clone());
    replica_bridge.attach(replica.clone());

    owner.mutate(Counter { count: 41 }).unwrap();
    owner.mutate(Counter { count: 42 }).unwrap();
    owner_bridge.publish(id).unwrap();

    let WireMessage::Update(update) = WireMessage::from_frame(&wire.try_recv().unwrap()).unwrap() else {
        panic!("expected update");
    };
    replica_bridge.on_receive(&update);

    assert_eq!(replica.snapshot().payload(), owner.snapshot().payload());
    assert_eq!(replica.version(), owner.version());
}

#[test]
fn hydrate_overrides_newer_local_state() {
    let (mut bridge, _rx) = bridge();
    let store = Arc::new(StateStore::new(EntityId::new(), Counter { count: 0 }));
    bridge.attach(store.clone());
    store.mutate(Counter { count: 9 }).unwrap();
    store.mutate(Counter { count: 10 }).unwrap();

    let authoritative = StateUpdate { entity_id: store.entity_id(), payload: json!({"count": 4}), version: 2 };
    assert_eq!(bridge.hydrate(&authoritative), Received::Applied(2));
    assert_eq!(store.snapshot().count, 4);
    assert_eq!(store.version(), 2);

    let malformed = StateUpdate { entity_id: store.entity_id(), payload: json!({"nope": 1}), version: 7 };
    assert_eq!(bridge.hydrate(&malformed), Received::Rejected);
    assert_eq!(store.snapshot().count, 4);
}
