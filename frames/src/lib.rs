//! Binary envelope for ownsync traffic.
//!
//! Every claim, ownership decision, state update and room snapshot crosses
//! the socket as one `Envelope`. The fixed routing fields (ids, room,
//! sender, syscall, status) are plain protobuf fields; the message body is
//! a `google.protobuf.Value` so entity payloads keep whatever JSON shape the
//! application gave them.
//!
//! The session authority (`server`) and the websocket connector in `ownsync`
//! both link this crate, so neither side can drift from the other's field
//! numbering.
//!
//! NUMBERS
//! =======
//! `google.protobuf.Value` has a single double-typed number kind. On decode,
//! a whole double within ±2^53 becomes a JSON integer again. Entity
//! versions, `claimed_at` stamps and frame timestamps therefore read back
//! with `as_u64`/`as_i64`. Versions past 2^53 are not exact on this wire.

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 2^53 - 1. Whole doubles up to this magnitude map to one integer each.
const EXACT_INTEGER_LIMIT: f64 = 9_007_199_254_740_991.0;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// Status tag outside the four the protocol defines.
    #[error("invalid frame status: {0}")]
    InvalidStatus(i32),
}

/// Where a frame sits in a request/reply exchange.
///
/// Broadcasts such as `entity:owner` or `entity:update` travel as `Request`;
/// the authority's direct answers (join snapshot, claim decision) are
/// `Done`, and refusals are `Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Request,
    Item,
    Done,
    Error,
}

impl Status {
    /// Protobuf tag for this status.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        EnvelopeStatus::from(self) as i32
    }

    fn from_i32(tag: i32) -> Result<Self, CodecError> {
        EnvelopeStatus::try_from(tag)
            .map(Self::from)
            .map_err(|_| CodecError::InvalidStatus(tag))
    }
}

/// Frame as both ends see it once the envelope is unpacked. Ids stay
/// strings here; `ownsync::frame` parses them into UUIDs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    /// Request this frame answers. Set on snapshot replies and corrections.
    pub parent_id: Option<String>,
    /// Creation time, ms since the Unix epoch.
    pub ts: i64,
    pub room_id: Option<String>,
    /// Participant the frame speaks for. The authority overwrites it with
    /// the connection's participant id on every inbound frame.
    pub from: Option<String>,
    /// `prefix:op`, e.g. `"entity:claim"` or `"room:snapshot"`.
    pub syscall: String,
    pub status: Status,
    /// Message body: claim fields, a state update, snapshot rows.
    pub data: Value,
}

/// Pack a frame into envelope bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    <Envelope as From<&Frame>>::from(frame).encode_to_vec()
}

/// Unpack envelope bytes.
///
/// # Errors
///
/// `Decode` when the bytes are not an envelope, `InvalidStatus` when the
/// status tag is unknown.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    Frame::try_from(Envelope::decode(bytes)?)
}

// =============================================================================
// ENVELOPE
// =============================================================================

#[derive(Clone, PartialEq, Message)]
struct Envelope {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, optional, tag = "2")]
    parent_id: Option<String>,
    #[prost(int64, tag = "3")]
    ts: i64,
    #[prost(string, optional, tag = "4")]
    room_id: Option<String>,
    #[prost(string, optional, tag = "5")]
    from: Option<String>,
    #[prost(string, tag = "6")]
    syscall: String,
    #[prost(enumeration = "EnvelopeStatus", tag = "7")]
    status: i32,
    #[prost(message, optional, tag = "8")]
    data: Option<prost_types::Value>,
}

/// Tags are part of the wire format; never renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum EnvelopeStatus {
    Request = 0,
    Done = 1,
    Error = 2,
    Item = 3,
}

impl From<Status> for EnvelopeStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Request => Self::Request,
            Status::Item => Self::Item,
            Status::Done => Self::Done,
            Status::Error => Self::Error,
        }
    }
}

impl From<EnvelopeStatus> for Status {
    fn from(status: EnvelopeStatus) -> Self {
        match status {
            EnvelopeStatus::Request => Self::Request,
            EnvelopeStatus::Item => Self::Item,
            EnvelopeStatus::Done => Self::Done,
            EnvelopeStatus::Error => Self::Error,
        }
    }
}

impl From<&Frame> for Envelope {
    fn from(frame: &Frame) -> Self {
        Self {
            id: frame.id.clone(),
            parent_id: frame.parent_id.clone(),
            ts: frame.ts,
            room_id: frame.room_id.clone(),
            from: frame.from.clone(),
            syscall: frame.syscall.clone(),
            status: frame.status.as_i32(),
            data: Some(to_proto(&frame.data)),
        }
    }
}

impl TryFrom<Envelope> for Frame {
    type Error = CodecError;

    fn try_from(envelope: Envelope) -> Result<Self, CodecError> {
        let status = Status::from_i32(envelope.status)?;
        // A body-less envelope is an empty message, not a null one.
        let data = envelope
            .data
            .as_ref()
            .map_or_else(|| Value::Object(Map::new()), from_proto);
        Ok(Self {
            id: envelope.id,
            parent_id: envelope.parent_id,
            ts: envelope.ts,
            room_id: envelope.room_id,
            from: envelope.from,
            syscall: envelope.syscall,
            status,
            data,
        })
    }
}

// =============================================================================
// BODY
// =============================================================================

fn to_proto(value: &Value) -> prost_types::Value {
    use prost_types::value::Kind;

    let kind = match value {
        Value::Null => Kind::NullValue(prost_types::NullValue::NullValue.into()),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(prost_types::ListValue { values: items.iter().map(to_proto).collect() }),
        Value::Object(fields) => Kind::StructValue(prost_types::Struct {
            fields: fields.iter().map(|(k, v)| (k.clone(), to_proto(v))).collect(),
        }),
    };
    prost_types::Value { kind: Some(kind) }
}

fn from_proto(value: &prost_types::Value) -> Value {
    use prost_types::value::Kind;

    match &value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(*b),
        Some(Kind::NumberValue(n)) => number(*n),
        Some(Kind::StringValue(s)) => Value::String(s.clone()),
        Some(Kind::ListValue(list)) => Value::Array(list.values.iter().map(from_proto).collect()),
        Some(Kind::StructValue(fields)) => {
            Value::Object(fields.fields.iter().map(|(k, v)| (k.clone(), from_proto(v))).collect())
        }
    }
}

/// Whole doubles in the exact range become integers; NaN and infinities,
/// which JSON cannot hold, become null.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn number(n: f64) -> Value {
    if n.is_finite() && n.trunc() == n && n.abs() <= EXACT_INTEGER_LIMIT {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
