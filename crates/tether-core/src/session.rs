//! Session data model: the presence record held in the session directory.
//!
//! A session is the logical, reconnect-surviving presence of one client
//! device. Its `id` outlives any single socket: a reconnect may reuse it on a
//! different node, at which point `reside` moves with it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Globally unique session identifier.
pub type SessionId = String;

/// Client identity, resolved by the authenticator before a connection exists.
pub type Uid = u64;

/// Identity (reachable `host:port` address) of a gateway node.
pub type NodeId = String;

/// Presence status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// A socket for this session is open on `reside`.
    Active,
    /// The client went away. Retained for reuse on reconnect.
    NoActive,
    /// The owning node drained before shutdown. A reconnect anywhere resumes it.
    TemporaryOffline,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::NoActive => "no_active",
            Status::TemporaryOffline => "temporary_offline",
        }
    }

    /// Whether a reconnect on the same device may take this session over.
    pub fn is_reusable(self) -> bool {
        matches!(self, Status::NoActive | Status::TemporaryOffline)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Status::Active),
            "no_active" => Ok(Status::NoActive),
            "temporary_offline" => Ok(Status::TemporaryOffline),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// Client device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Web,
    Ios,
    Android,
    Desktop,
    #[default]
    Unknown,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Web => "web",
            Device::Ios => "ios",
            Device::Android => "android",
            Device::Desktop => "desktop",
            Device::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "web" => Ok(Device::Web),
            "ios" => Ok(Device::Ios),
            "android" => Ok(Device::Android),
            "desktop" => Ok(Device::Desktop),
            "unknown" => Ok(Device::Unknown),
            other => Err(ModelError::UnknownDevice(other.to_string())),
        }
    }
}

/// The presence record persisted in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub uid: Uid,
    pub device: Device,
    pub status: Status,
    /// Unix milliseconds of the last (re-)connect.
    pub ctime: u64,
    /// Unix milliseconds of the last heartbeat or data frame.
    pub last_active_time: u64,
    /// Node currently holding the socket.
    pub reside: NodeId,
    /// Client remote address.
    pub ip: String,
}

// Field names in the directory hash. Part of the shared store layout.
pub const FIELD_ID: &str = "id";
pub const FIELD_UID: &str = "uid";
pub const FIELD_DEVICE: &str = "device";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_CTIME: &str = "ctime";
pub const FIELD_LAST_ACTIVE_TIME: &str = "last_active_time";
pub const FIELD_RESIDE: &str = "reside";
pub const FIELD_IP: &str = "ip";

impl SessionRecord {
    /// Flatten into hash fields for the directory store.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_ID.into(), self.id.clone()),
            (FIELD_UID.into(), self.uid.to_string()),
            (FIELD_DEVICE.into(), self.device.to_string()),
            (FIELD_STATUS.into(), self.status.to_string()),
            (FIELD_CTIME.into(), self.ctime.to_string()),
            (FIELD_LAST_ACTIVE_TIME.into(), self.last_active_time.to_string()),
            (FIELD_RESIDE.into(), self.reside.clone()),
            (FIELD_IP.into(), self.ip.clone()),
        ]
    }

    /// Rebuild from hash fields. Every field must be present and parse.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, ModelError> {
        fn field<'a>(
            fields: &'a HashMap<String, String>,
            name: &'static str,
        ) -> Result<&'a str, ModelError> {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or(ModelError::MissingField(name))
        }

        fn number(fields: &HashMap<String, String>, name: &'static str) -> Result<u64, ModelError> {
            field(fields, name)?
                .parse()
                .map_err(|_| ModelError::InvalidField(name))
        }

        Ok(Self {
            id: field(fields, FIELD_ID)?.to_string(),
            uid: number(fields, FIELD_UID)?,
            device: field(fields, FIELD_DEVICE)?.parse()?,
            status: field(fields, FIELD_STATUS)?.parse()?,
            ctime: number(fields, FIELD_CTIME)?,
            last_active_time: number(fields, FIELD_LAST_ACTIVE_TIME)?,
            reside: field(fields, FIELD_RESIDE)?.to_string(),
            ip: field(fields, FIELD_IP)?.to_string(),
        })
    }
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("unknown session status: {0}")]
    UnknownStatus(String),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid value in field: {0}")]
    InvalidField(&'static str),
}
