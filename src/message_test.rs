use super::*;
use crate::frame::ErrorCode;
use serde_json::json;

fn update_frame(data: serde_json::Value) -> Frame {
    let serde_json::Value::Object(map) = data else {
        panic!("test data must be an object");
    };
    Frame::request(SYSCALL_UPDATE, map.into_iter().collect())
}

#[test]
fn claim_parses_from_its_own_frame() {
    let claim = ClaimRequest::new(EntityId::new(), ParticipantId::new());
    let frame = WireMessage::Claim(claim).to_frame();

    assert_eq!(frame.syscall, "entity:claim");
    assert_eq!(WireMessage::from_frame(&frame).unwrap(), WireMessage::Claim(claim));
}

#[test]
fn owner_with_no_owner_parses_as_none() {
    let entity_id = EntityId::new();
    let frame = WireMessage::Owner { entity_id, owner_id: None, claimed_at: None }.to_frame();

    let parsed = WireMessage::from_frame(&frame).unwrap();
    assert_eq!(parsed, WireMessage::Owner { entity_id, owner_id: None, claimed_at: None });
    assert_eq!(parsed.kind(), "owner");
    assert_eq!(parsed.entity_id(), Some(entity_id));
}

#[test]
fn snapshot_carries_owner_and_version() {
    let row = EntitySnapshot {
        entity_id: EntityId::new(),
        payload: json!({"count": 2}),
        version: 5,
        owner_id: Some(ParticipantId::new()),
        claimed_at: Some(1_700_000_000_000),
    };
    let frame = WireMessage::Snapshot(vec![row.clone()]).to_frame();

    let WireMessage::Snapshot(rows) = WireMessage::from_frame(&frame).unwrap() else {
        panic!("expected snapshot");
    };
    assert_eq!(rows, vec![row]);
}

#[test]
fn update_requires_version() {
    let frame = update_frame(json!({
        "entity_id": EntityId::new(),
        "payload": {"count": 1}
    }));
    let err = WireMessage::from_frame(&frame).unwrap_err();
    assert!(matches!(err, MessageError::MissingField("version")));
    assert_eq!(err.error_code(), "E_MALFORMED_MESSAGE");
}

#[test]
fn update_rejects_non_object_payload() {
    let frame = update_frame(json!({
        "entity_id": EntityId::new(),
        "payload": [1, 2, 3],
        "version": 2
    }));
    assert!(matches!(
        WireMessage::from_frame(&frame),
        Err(MessageError::InvalidField { field: "payload", .. })
    ));
}

#[test]
fn update_rejects_negative_version() {
    let frame = update_frame(json!({
        "entity_id": EntityId::new(),
        "payload": {},
        "version": -1
    }));
    assert!(matches!(
        WireMessage::from_frame(&frame),
        Err(MessageError::InvalidField { field: "version", .. })
    ));
}

#[test]
fn update_rejects_bad_entity_id() {
    let frame = update_frame(json!({
        "entity_id": "not-a-uuid",
        "payload": {},
        "version": 2
    }));
    assert!(matches!(
        WireMessage::from_frame(&frame),
        Err(MessageError::InvalidField { field: "entity_id", .. })
    ));
}

#[test]
fn snapshot_rejects_scalar_payload_rows() {
    let frame = Frame::request(SYSCALL_SNAPSHOT, Data::new()).with_data(
        FIELD_ENTITIES,
        json!([{"entity_id": EntityId::new(), "payload": 3, "version": 1, "owner_id": null, "claimed_at": null}]),
    );
    assert!(matches!(
        WireMessage::from_frame(&frame),
        Err(MessageError::InvalidField { field: "entities", .. })
    ));
}

#[test]
fn unknown_syscall_is_rejected() {
    let frame = Frame::request("cursor:move", Data::new());
    let err = WireMessage::from_frame(&frame).unwrap_err();
    assert!(matches!(err, MessageError::UnknownSyscall(_)));
    assert_eq!(err.error_code(), "E_UNKNOWN_SYSCALL");
}

#[test]
fn update_survives_binary_transport() {
    let update = StateUpdate { entity_id: EntityId::new(), payload: json!({"count": 1, "label": "a"}), version: 2 };
    let frame = WireMessage::Update(update.clone()).to_frame();

    let restored = crate::frame::decode(&crate::frame::encode(&frame)).unwrap();
    assert_eq!(WireMessage::from_frame(&restored).unwrap(), WireMessage::Update(update));
}
