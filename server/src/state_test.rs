use super::*;
use ownsync::ClaimRequest;
use serde_json::json;

#[test]
fn room_state_starts_empty() {
    let room = RoomState::new();
    assert!(room.entities.is_empty());
    assert!(room.clients.is_empty());
    assert_eq!(room.ownership.policy(), Arbitration::Authority);
    assert!(room.snapshot().is_empty());
}

#[test]
fn row_carries_owner_and_claim_time() {
    let mut room = RoomState::new();
    let entity_id = EntityId::new();
    let owner = ParticipantId::new();
    room.entities
        .insert(entity_id, AuthorityEntity { payload: json!({"count": 3}), version: 4 });
    room.ownership
        .take_ownership(&ClaimRequest { entity_id, requester_id: owner, timestamp: 77 });

    let row = room.row(entity_id).unwrap();
    assert_eq!(row.payload, json!({"count": 3}));
    assert_eq!(row.version, 4);
    assert_eq!(row.owner_id, Some(owner));
    assert_eq!(row.claimed_at, Some(77));
    assert!(room.row(EntityId::new()).is_none());
}

#[test]
fn snapshot_is_sorted_by_entity_id() {
    let mut room = RoomState::new();
    for _ in 0..5 {
        room.entities
            .insert(EntityId::new(), AuthorityEntity { payload: json!({}), version: 1 });
    }

    let ids: Vec<EntityId> = room.snapshot().iter().map(|r| r.entity_id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
    assert!(room.snapshot().iter().all(|r| r.owner_id.is_none()));
}

#[tokio::test]
async fn seed_helpers_populate_room() {
    let state = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state).await;
    let entity_id = test_helpers::seed_entity(&state, room_id, json!({"count": 0})).await;
    let (participant, _rx) = test_helpers::seed_client(&state, room_id).await;

    let rooms = state.rooms.read().await;
    let room = rooms.get(&room_id).unwrap();
    assert!(room.entities.contains_key(&entity_id));
    assert!(room.clients.contains_key(&participant));
    assert!(room.ownership.contains(entity_id));
}
