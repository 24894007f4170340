//! Bundle data model shared by the endpoint service and engine adapters.
//!
//! A [`Bundle`] is one message unit of the store-and-forward transport. The
//! endpoint identifier names the destination on outbound bundles and the
//! source on delivered ones. The payload is either held in memory or refers
//! to a file on disk, never both.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Seconds between the Unix epoch and the DTN epoch (2000-01-01T00:00:00Z).
pub const DTN_EPOCH_UNIX_SECS: i64 = 946_684_800;

/// Endpoint identifier used when a bundle is sent without an open endpoint.
pub const NULL_ENDPOINT_ID: &str = "dtn:none";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("unknown priority ordinal {0}")]
    UnknownPriority(u8),
}

/// Class of service requested for a bundle.
///
/// The ordinal is what crosses the engine boundary. `Invalid` only appears on
/// bundles built from engine deliveries and is rejected on sends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Bulk,
    #[default]
    Standard,
    Expedited,
    Invalid,
}

impl Priority {
    pub fn ordinal(self) -> u8 {
        match self {
            Priority::Bulk => 0,
            Priority::Standard => 1,
            Priority::Expedited => 2,
            Priority::Invalid => 3,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Result<Self, ModelError> {
        match ordinal {
            0 => Ok(Priority::Bulk),
            1 => Ok(Priority::Standard),
            2 => Ok(Priority::Expedited),
            3 => Ok(Priority::Invalid),
            other => Err(ModelError::UnknownPriority(other)),
        }
    }

    /// Whether a client may submit a bundle with this priority.
    pub fn is_sendable(self) -> bool {
        !matches!(self, Priority::Invalid)
    }
}

/// Bundle payload: in-memory bytes or a path to a readable file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Bytes(Bytes),
    File(PathBuf),
}

impl Payload {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            Payload::File(_) => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Payload::Bytes(_) => None,
            Payload::File(path) => Some(path.as_path()),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Payload::File(_))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Payload::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<PathBuf> for Payload {
    fn from(path: PathBuf) -> Self {
        Payload::File(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub endpoint_id: String,
    /// Seconds since the DTN epoch.
    pub creation_time: u64,
    /// Lifetime counter; interpreted by the engine only.
    pub time_to_live: u32,
    pub priority: Priority,
    payload: Payload,
}

impl Bundle {
    /// Builds an outbound bundle stamped with the current time.
    pub fn new(
        endpoint_id: impl Into<String>,
        priority: Priority,
        time_to_live: u32,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            creation_time: dtn_now(),
            time_to_live,
            priority,
            payload: payload.into(),
        }
    }

    /// Builds a bundle from fields reported by the engine for a delivery.
    pub fn delivered(
        source_endpoint_id: impl Into<String>,
        creation_time: u64,
        time_to_live: u32,
        payload: Payload,
    ) -> Self {
        Self {
            endpoint_id: source_endpoint_id.into(),
            creation_time,
            time_to_live,
            priority: Priority::Invalid,
            payload,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Replaces the payload with in-memory bytes, dropping any file reference.
    pub fn set_payload_bytes(&mut self, bytes: impl Into<Bytes>) {
        self.payload = Payload::Bytes(bytes.into());
    }

    /// Replaces the payload with a file reference, dropping any bytes.
    pub fn set_payload_file(&mut self, path: impl Into<PathBuf>) {
        self.payload = Payload::File(path.into());
    }

    pub fn creation_datetime(&self) -> OffsetDateTime {
        let unix = DTN_EPOCH_UNIX_SECS.saturating_add(self.creation_time as i64);
        OffsetDateTime::from_unix_timestamp(unix).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

/// Current time in seconds since the DTN epoch. Clocks set before 2000 read 0.
pub fn dtn_now() -> u64 {
    dtn_seconds(OffsetDateTime::now_utc())
}

pub fn dtn_seconds(at: OffsetDateTime) -> u64 {
    let secs = at.unix_timestamp() - DTN_EPOCH_UNIX_SECS;
    u64::try_from(secs).unwrap_or(0)
}
