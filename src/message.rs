//! Typed protocol messages carried inside frames.
//!
//! DESIGN
//! ======
//! The three core kinds are `claim`, `release` and `update`. The session
//! authority adds `owner` (claim resolution), `snapshot` (join hydration),
//! `spawn` / `despawn` (entity lifecycle) and `part` (participant left).
//!
//! Each kind maps to one syscall. Fields live flat in `Frame::data` under
//! the `FIELD_*` keys. Parsing is strict: a missing or ill-typed field
//! rejects the whole message, so a malformed frame can never partially
//! reach a store.

use crate::frame::{Data, Frame};
use crate::state::{ClaimRequest, EntityId, EntitySnapshot, ParticipantId, StateUpdate, Version};

// =============================================================================
// SYSCALLS
// =============================================================================

pub const SYSCALL_CLAIM: &str = "entity:claim";
pub const SYSCALL_RELEASE: &str = "entity:release";
pub const SYSCALL_UPDATE: &str = "entity:update";
pub const SYSCALL_OWNER: &str = "entity:owner";
pub const SYSCALL_SPAWN: &str = "entity:spawn";
pub const SYSCALL_DESPAWN: &str = "entity:despawn";
pub const SYSCALL_SNAPSHOT: &str = "room:snapshot";
pub const SYSCALL_PART: &str = "room:part";
pub const SYSCALL_JOIN: &str = "room:join";
pub const SYSCALL_CONNECTED: &str = "session:connected";

// =============================================================================
// FIELDS
// =============================================================================

pub const FIELD_ENTITY_ID: &str = "entity_id";
pub const FIELD_REQUESTER_ID: &str = "requester_id";
pub const FIELD_PARTICIPANT_ID: &str = "participant_id";
pub const FIELD_OWNER_ID: &str = "owner_id";
pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_VERSION: &str = "version";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_CLAIMED_AT: &str = "claimed_at";
pub const FIELD_ENTITIES: &str = "entities";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("unknown message syscall: {0}")]
    UnknownSyscall(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl crate::frame::ErrorCode for MessageError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownSyscall(_) => "E_UNKNOWN_SYSCALL",
            Self::MissingField(_) | Self::InvalidField { .. } => "E_MALFORMED_MESSAGE",
        }
    }
}

/// A protocol message, independent of the frame it travels in.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Claim(ClaimRequest),
    Release { entity_id: EntityId, requester_id: ParticipantId },
    Update(StateUpdate),
    Owner { entity_id: EntityId, owner_id: Option<ParticipantId>, claimed_at: Option<i64> },
    Snapshot(Vec<EntitySnapshot>),
    Spawn(EntitySnapshot),
    Despawn { entity_id: EntityId },
    Part { participant_id: ParticipantId },
}

impl WireMessage {
    /// Short message kind, as named in the wire schema.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Claim(_) => "claim",
            Self::Release { .. } => "release",
            Self::Update(_) => "update",
            Self::Owner { .. } => "owner",
            Self::Snapshot(_) => "snapshot",
            Self::Spawn(_) => "spawn",
            Self::Despawn { .. } => "despawn",
            Self::Part { .. } => "part",
        }
    }

    #[must_use]
    pub fn syscall(&self) -> &'static str {
        match self {
            Self::Claim(_) => SYSCALL_CLAIM,
            Self::Release { .. } => SYSCALL_RELEASE,
            Self::Update(_) => SYSCALL_UPDATE,
            Self::Owner { .. } => SYSCALL_OWNER,
            Self::Snapshot(_) => SYSCALL_SNAPSHOT,
            Self::Spawn(_) => SYSCALL_SPAWN,
            Self::Despawn { .. } => SYSCALL_DESPAWN,
            Self::Part { .. } => SYSCALL_PART,
        }
    }

    /// Entity the message is about, if it concerns exactly one.
    #[must_use]
    pub fn entity_id(&self) -> Option<EntityId> {
        match self {
            Self::Claim(claim) => Some(claim.entity_id),
            Self::Release { entity_id, .. } | Self::Owner { entity_id, .. } | Self::Despawn { entity_id } => {
                Some(*entity_id)
            }
            Self::Update(update) => Some(update.entity_id),
            Self::Spawn(snapshot) => Some(snapshot.entity_id),
            Self::Snapshot(_) | Self::Part { .. } => None,
        }
    }

    /// Wrap the message in a request frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let mut data = Data::new();
        match self {
            Self::Claim(claim) => {
                data.insert(FIELD_ENTITY_ID.into(), serde_json::json!(claim.entity_id));
                data.insert(FIELD_REQUESTER_ID.into(), serde_json::json!(claim.requester_id));
                data.insert(FIELD_TIMESTAMP.into(), serde_json::json!(claim.timestamp));
            }
            Self::Release { entity_id, requester_id } => {
                data.insert(FIELD_ENTITY_ID.into(), serde_json::json!(entity_id));
                data.insert(FIELD_REQUESTER_ID.into(), serde_json::json!(requester_id));
            }
            Self::Update(update) => {
                data.insert(FIELD_ENTITY_ID.into(), serde_json::json!(update.entity_id));
                data.insert(FIELD_PAYLOAD.into(), update.payload.clone());
                data.insert(FIELD_VERSION.into(), serde_json::json!(update.version));
            }
            Self::Owner { entity_id, owner_id, claimed_at } => {
                data.insert(FIELD_ENTITY_ID.into(), serde_json::json!(entity_id));
                data.insert(FIELD_OWNER_ID.into(), serde_json::json!(owner_id));
                data.insert(FIELD_CLAIMED_AT.into(), serde_json::json!(claimed_at));
            }
            Self::Snapshot(entities) => {
                data.insert(FIELD_ENTITIES.into(), serde_json::to_value(entities).unwrap_or_default());
            }
            Self::Spawn(snapshot) => {
                data.insert(FIELD_ENTITY_ID.into(), serde_json::json!(snapshot.entity_id));
                data.insert(FIELD_PAYLOAD.into(), snapshot.payload.clone());
                data.insert(FIELD_VERSION.into(), serde_json::json!(snapshot.version));
                data.insert(FIELD_OWNER_ID.into(), serde_json::json!(snapshot.owner_id));
                data.insert(FIELD_CLAIMED_AT.into(), serde_json::json!(snapshot.claimed_at));
            }
            Self::Despawn { entity_id } => {
                data.insert(FIELD_ENTITY_ID.into(), serde_json::json!(entity_id));
            }
            Self::Part { participant_id } => {
                data.insert(FIELD_PARTICIPANT_ID.into(), serde_json::json!(participant_id));
            }
        }
        Frame::request(self.syscall(), data)
    }

    /// Parse a frame into a message. Status is not inspected: a snapshot
    /// sent as a join reply parses the same as one sent unsolicited.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSyscall` for frames outside the protocol and
    /// `MissingField` / `InvalidField` for malformed data.
    pub fn from_frame(frame: &Frame) -> Result<Self, MessageError> {
        let data = &frame.data;
        match frame.syscall.as_str() {
            SYSCALL_CLAIM => Ok(Self::Claim(ClaimRequest {
                entity_id: id_field(data, FIELD_ENTITY_ID)?,
                requester_id: id_field(data, FIELD_REQUESTER_ID)?,
                timestamp: i64_field(data, FIELD_TIMESTAMP)?,
            })),
            SYSCALL_RELEASE => Ok(Self::Release {
                entity_id: id_field(data, FIELD_ENTITY_ID)?,
                requester_id: id_field(data, FIELD_REQUESTER_ID)?,
            }),
            SYSCALL_UPDATE => Ok(Self::Update(StateUpdate {
                entity_id: id_field(data, FIELD_ENTITY_ID)?,
                payload: payload_field(data)?,
                version: version_field(data)?,
            })),
            SYSCALL_OWNER => Ok(Self::Owner {
                entity_id: id_field(data, FIELD_ENTITY_ID)?,
                owner_id: optional_id_field(data, FIELD_OWNER_ID)?,
                claimed_at: optional_i64_field(data, FIELD_CLAIMED_AT)?,
            }),
            SYSCALL_SNAPSHOT => {
                let raw = data
                    .get(FIELD_ENTITIES)
                    .ok_or(MessageError::MissingField(FIELD_ENTITIES))?;
                let entities: Vec<EntitySnapshot> = serde_json::from_value(raw.clone())
                    .map_err(|e| MessageError::InvalidField { field: FIELD_ENTITIES, reason: e.to_string() })?;
                if entities.iter().any(|e| !e.payload.is_object()) {
                    return Err(MessageError::InvalidField {
                        field: FIELD_ENTITIES,
                        reason: "entity payload must be a JSON object".into(),
                    });
                }
                Ok(Self::Snapshot(entities))
            }
            SYSCALL_SPAWN => Ok(Self::Spawn(EntitySnapshot {
                entity_id: id_field(data, FIELD_ENTITY_ID)?,
                payload: payload_field(data)?,
                version: version_field(data)?,
                owner_id: optional_id_field(data, FIELD_OWNER_ID)?,
                claimed_at: optional_i64_field(data, FIELD_CLAIMED_AT)?,
            })),
            SYSCALL_DESPAWN => Ok(Self::Despawn { entity_id: id_field(data, FIELD_ENTITY_ID)? }),
            SYSCALL_PART => Ok(Self::Part { participant_id: id_field(data, FIELD_PARTICIPANT_ID)? }),
            other => Err(MessageError::UnknownSyscall(other.to_owned())),
        }
    }
}

// =============================================================================
// FIELD HELPERS
// =============================================================================

fn id_field<T: std::str::FromStr>(data: &Data, field: &'static str) -> Result<T, MessageError> {
    let raw = data.get(field).ok_or(MessageError::MissingField(field))?;
    let Some(s) = raw.as_str() else {
        return Err(MessageError::InvalidField { field, reason: "expected uuid string".into() });
    };
    s.parse()
        .map_err(|_| MessageError::InvalidField { field, reason: format!("invalid uuid: {s}") })
}

fn optional_id_field<T: std::str::FromStr>(data: &Data, field: &'static str) -> Result<Option<T>, MessageError> {
    match data.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(_) => id_field(data, field).map(Some),
    }
}

fn i64_field(data: &Data, field: &'static str) -> Result<i64, MessageError> {
    data.get(field)
        .ok_or(MessageError::MissingField(field))?
        .as_i64()
        .ok_or_else(|| MessageError::InvalidField { field, reason: "expected integer".into() })
}

fn optional_i64_field(data: &Data, field: &'static str) -> Result<Option<i64>, MessageError> {
    match data.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(_) => i64_field(data, field).map(Some),
    }
}

fn version_field(data: &Data) -> Result<Version, MessageError> {
    data.get(FIELD_VERSION)
        .ok_or(MessageError::MissingField(FIELD_VERSION))?
        .as_u64()
        .ok_or_else(|| MessageError::InvalidField {
            field: FIELD_VERSION,
            reason: "expected non-negative integer".into(),
        })
}

fn payload_field(data: &Data) -> Result<serde_json::Value, MessageError> {
    let payload = data
        .get(FIELD_PAYLOAD)
        .ok_or(MessageError::MissingField(FIELD_PAYLOAD))?;
    if !payload.is_object() {
        return Err(MessageError::InvalidField { field: FIELD_PAYLOAD, reason: "expected JSON object".into() });
    }
    Ok(payload.clone())
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
