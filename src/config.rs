//! Sync configuration parsed from environment variables.

use uuid::Uuid;

use crate::ownership::Arbitration;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3000/api/ws";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub arbitration: Arbitration,
    pub channel_capacity: usize,
    pub server_url: String,
    /// Room to join. The nil uuid is the shared default room.
    pub room_id: Uuid,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            arbitration: Arbitration::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            server_url: DEFAULT_SERVER_URL.to_owned(),
            room_id: Uuid::nil(),
        }
    }
}

impl SyncConfig {
    /// Build typed sync config from environment variables.
    ///
    /// Optional:
    /// - `OWNSYNC_ARBITRATION`: `authority` (default) or `peer`
    /// - `OWNSYNC_CHANNEL_CAPACITY`: default 256
    /// - `OWNSYNC_SERVER_URL`: default `ws://127.0.0.1:3000/api/ws`
    /// - `OWNSYNC_ROOM`: room uuid, default nil
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for an unknown arbitration policy or a malformed
    /// room id. A malformed capacity falls back to the default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`], reading keys through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`SyncConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let arbitration = match lookup("OWNSYNC_ARBITRATION") {
            None => Arbitration::default(),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|reason| ConfigError::Invalid { key: "OWNSYNC_ARBITRATION", reason })?,
        };

        let room_id = match lookup("OWNSYNC_ROOM") {
            None => Uuid::nil(),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key: "OWNSYNC_ROOM", reason: format!("not a uuid: {raw}") })?,
        };

        let server_url = lookup("OWNSYNC_SERVER_URL")
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_owned());

        Ok(Self {
            arbitration,
            channel_capacity: env_parse(&lookup, "OWNSYNC_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY).max(1),
            server_url,
            room_id,
        })
    }
}

pub(crate) fn env_parse<T>(lookup: impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
