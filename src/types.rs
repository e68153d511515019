//! Core data model shared by the dispatcher and the routing layer.
//!
//! - [`SequenceToken`]: opaque log position used for cursoring and dedup
//! - [`Event`]: one immutable record read from a group's derived log
//! - [`LifecycleState`]: registry-side view of a group's Dispatcher
//! - [`GroupNaming`]: derived-log and service naming conventions

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Group label returned when the metadata service has no real membership.
pub const UNAVAILABLE_GROUP: &str = "UNAVAILABLE";

/// Position of an event in a group's derived log.
///
/// Tokens order by `(partition, offset)` and render as `"<partition>:<offset>"`.
/// A token is never reused for a different payload within a group's lifetime,
/// so clients deduplicate redelivered events by comparing tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceToken {
    pub partition: i32,
    pub offset: i64,
}

impl SequenceToken {
    #[inline]
    pub const fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }

    /// Token of the next record in the same partition.
    #[inline]
    pub const fn next(self) -> Self {
        Self {
            partition: self.partition,
            offset: self.offset + 1,
        }
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.offset)
    }
}

impl FromStr for SequenceToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (partition, offset) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidRequest(format!("malformed sequence token '{s}'")))?;
        let partition = partition
            .trim()
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("malformed sequence token '{s}'")))?;
        let offset = offset
            .trim()
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("malformed sequence token '{s}'")))?;
        Ok(Self { partition, offset })
    }
}

impl Serialize for SequenceToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SequenceToken {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One record from a group's derived log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub entity_id: String,
    pub item_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub sequence_token: SequenceToken,
}

impl Event {
    /// Decode a raw log record.
    ///
    /// The record key carries the entity id. When the key is absent the
    /// payload's `asset_uuid` field is used instead. The item id comes from the
    /// payload's `id` field. `timestamp_ms` is the broker timestamp, falling
    /// back to the time of decoding when the broker supplies none.
    pub fn from_record(
        key: Option<&[u8]>,
        payload: &[u8],
        sequence_token: SequenceToken,
        timestamp_ms: Option<i64>,
    ) -> Result<Self> {
        let payload: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| Error::Log(format!("undecodable payload at {sequence_token}: {e}")))?;

        let entity_id = match key.filter(|k| !k.is_empty()) {
            Some(k) => String::from_utf8_lossy(k).into_owned(),
            None => field_str(&payload, "asset_uuid").ok_or_else(|| {
                Error::Log(format!("record at {sequence_token} has no entity key"))
            })?,
        };
        let item_id = field_str(&payload, "id");

        let timestamp = timestamp_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Ok(Self {
            entity_id,
            item_id,
            timestamp,
            payload,
            sequence_token,
        })
    }
}

/// Look up a string field, accepting the upper-cased column names ksqlDB emits.
fn field_str(value: &serde_json::Value, name: &str) -> Option<String> {
    value
        .get(name)
        .or_else(|| value.get(name.to_uppercase()))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Registry-side lifecycle of a group's Dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Unknown,
    Provisioning,
    Active,
    Degraded,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Unknown => "UNKNOWN",
            LifecycleState::Provisioning => "PROVISIONING",
            LifecycleState::Active => "ACTIVE",
            LifecycleState::Degraded => "DEGRADED",
            LifecycleState::Stopped => "STOPPED",
        }
    }

    pub const ALL: [LifecycleState; 5] = [
        LifecycleState::Unknown,
        LifecycleState::Provisioning,
        LifecycleState::Active,
        LifecycleState::Degraded,
        LifecycleState::Stopped,
    ];
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Naming conventions for per-group resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupNaming {
    /// Prefix for derived logs, `<prefix>_<group>`.
    pub derived_log_prefix: String,
    /// Prefix for per-group Dispatcher services, `<prefix>-<sanitized group>`.
    pub service_prefix: String,
}

impl Default for GroupNaming {
    fn default() -> Self {
        Self {
            derived_log_prefix: "asset_stream".to_string(),
            service_prefix: "stream-api-group".to_string(),
        }
    }
}

impl GroupNaming {
    /// Derived log (stream and topic) id for a group.
    ///
    /// Characters outside `[A-Za-z0-9_]` are replaced by `_` so the id is a
    /// valid ksqlDB identifier and Kafka topic name.
    pub fn derived_log_id(&self, group: &str) -> String {
        let group: String = group
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        format!("{}_{}", self.derived_log_prefix, group)
    }

    /// Consumer group used by a group's Dispatcher.
    pub fn consumer_group(&self, group: &str) -> String {
        format!("{}_consumer_group", self.derived_log_id(group))
    }

    /// Service id of a group's Dispatcher.
    pub fn service_id(&self, group: &str) -> String {
        format!("{}-{}", self.service_prefix, sanitize_service_name(group))
    }
}

/// Lowercase and replace every non-alphanumeric character with `-`.
pub fn sanitize_service_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}
