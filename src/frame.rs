//! Frame: the envelope every protocol message travels in.
//!
//! ARCHITECTURE
//! ============
//! Clients and the session authority exchange frames. The syscall names the
//! operation (`entity:claim`, `room:join`, ...), the flat `data` map carries
//! its fields. Replies correlate to requests via `parent_id`.
//!
//! DESIGN
//! ======
//! - Flat data: payload is always `Map<String, Value>`.
//! - Typed interpretation of `data` lives in `message`; transports only
//!   move frames and never inspect `data`.
//! - Conversion to and from `frames::Frame` is the only place this type
//!   meets the binary codec.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::now_ms;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Frame data key for error messages.
pub const FRAME_MESSAGE: &str = "message";

/// Frame data key for grepable error codes.
pub const FRAME_CODE: &str = "code";

/// Frame data key for the retryable flag on error frames.
pub const FRAME_RETRYABLE: &str = "retryable";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// Lifecycle position of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Request,
    Item,
    Done,
    Error,
}

/// The protocol envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    pub from: Option<String>,
    pub syscall: String,
    pub status: Status,
    pub data: Data,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {field} uuid: {value}")]
    InvalidId { field: &'static str, value: String },
    #[error("frame data must be a JSON object")]
    DataNotObject,
    #[error("codec error: {0}")]
    Codec(#[from] frames::CodecError),
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl Frame {
    /// Create a request frame. Also used for unsolicited notifications.
    pub fn request(syscall: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            room_id: None,
            from: None,
            syscall: syscall.into(),
            status: Status::Request,
            data,
        }
    }

    /// Create an error response from a plain string. Terminal.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(message.into()));
        self.reply(Status::Error, data)
    }

    /// Create a structured error response from a typed error. Terminal.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(FRAME_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(FRAME_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        self.reply(Status::Error, data)
    }

    /// Build a reply frame. Inherits `parent_id`, `room_id`, and `syscall`.
    fn reply(&self, status: Status, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            ts: now_ms(),
            room_id: self.room_id,
            from: None,
            syscall: self.syscall.clone(),
            status,
            data,
        }
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_room_id(mut self, room_id: Uuid) -> Self {
        self.room_id = Some(room_id);
        self
    }

    #[must_use]
    pub fn with_parent_id(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// ROUTING
// =============================================================================

impl Frame {
    /// Extract the syscall prefix (everything before the first ':').
    #[must_use]
    pub fn prefix(&self) -> &str {
        let Some((prefix, _)) = self.syscall.split_once(':') else {
            return &self.syscall;
        };
        prefix
    }

    /// Extract the syscall operation (everything after the first ':').
    #[must_use]
    pub fn op(&self) -> &str {
        self.syscall.split_once(':').map_or("", |(_, op)| op)
    }
}

// =============================================================================
// WIRE CONVERSION
// =============================================================================

impl From<Status> for frames::Status {
    fn from(status: Status) -> Self {
        match status {
            Status::Request => Self::Request,
            Status::Item => Self::Item,
            Status::Done => Self::Done,
            Status::Error => Self::Error,
        }
    }
}

impl From<frames::Status> for Status {
    fn from(status: frames::Status) -> Self {
        match status {
            frames::Status::Request => Self::Request,
            frames::Status::Item => Self::Item,
            frames::Status::Done => Self::Done,
            frames::Status::Error => Self::Error,
        }
    }
}

impl From<&Frame> for frames::Frame {
    fn from(frame: &Frame) -> Self {
        let data = frame
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<serde_json::Map<_, _>>();
        Self {
            id: frame.id.to_string(),
            parent_id: frame.parent_id.map(|id| id.to_string()),
            ts: frame.ts,
            room_id: frame.room_id.map(|id| id.to_string()),
            from: frame.from.clone(),
            syscall: frame.syscall.clone(),
            status: frame.status.into(),
            data: serde_json::Value::Object(data),
        }
    }
}

impl TryFrom<frames::Frame> for Frame {
    type Error = FrameError;

    fn try_from(wire: frames::Frame) -> Result<Self, Self::Error> {
        let serde_json::Value::Object(map) = wire.data else {
            return Err(FrameError::DataNotObject);
        };
        Ok(Self {
            id: parse_id("id", &wire.id)?,
            parent_id: wire
                .parent_id
                .as_deref()
                .map(|v| parse_id("parent_id", v))
                .transpose()?,
            ts: wire.ts,
            room_id: wire
                .room_id
                .as_deref()
                .map(|v| parse_id("room_id", v))
                .transpose()?,
            from: wire.from,
            syscall: wire.syscall,
            status: wire.status.into(),
            data: map.into_iter().collect(),
        })
    }
}

fn parse_id(field: &'static str, value: &str) -> Result<Uuid, FrameError> {
    value
        .parse()
        .map_err(|_| FrameError::InvalidId { field, value: value.to_owned() })
}

/// Encode a frame for a binary transport.
#[must_use]
pub fn encode(frame: &Frame) -> Vec<u8> {
    frames::encode_frame(&frames::Frame::from(frame))
}

/// Decode a frame received from a binary transport.
///
/// # Errors
///
/// Returns a codec error for malformed bytes and `InvalidId` / `DataNotObject`
/// for frames that decode but do not fit the envelope.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    let wire = frames::decode_frame(bytes)?;
    Frame::try_from(wire)
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
