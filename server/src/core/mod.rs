pub mod error;
mod identity;

pub use identity::{CLIENT_ID_HEADER, resolve_serial, serial_from_client_id};

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Role of an object, identified by its key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Device,
    Shared,
    Link,
    Structure,
    User,
    Schedule,
    DeviceAlertDialog,
    Weather,
    Other,
}

/// Typed object key, e.g. `device.01AB02AC` or `user.xyz`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn device(serial: &str) -> Self {
        Self(format!("device.{serial}"))
    }

    pub fn shared(serial: &str) -> Self {
        Self(format!("shared.{serial}"))
    }

    pub fn link(serial: &str) -> Self {
        Self(format!("link.{serial}"))
    }

    pub fn structure(id: &str) -> Self {
        Self(format!("structure.{id}"))
    }

    pub fn user(id: &str) -> Self {
        Self(format!("user.{id}"))
    }

    pub fn device_alert_dialog(serial: &str) -> Self {
        Self(format!("device_alert_dialog.{serial}"))
    }

    pub fn weather(postal: &str) -> Self {
        Self(format!("weather.{postal}"))
    }

    pub fn kind(&self) -> ObjectKind {
        match self.0.split('.').next().unwrap_or("") {
            "device" => ObjectKind::Device,
            "shared" => ObjectKind::Shared,
            "link" => ObjectKind::Link,
            "structure" => ObjectKind::Structure,
            "user" => ObjectKind::User,
            "schedule" => ObjectKind::Schedule,
            "device_alert_dialog" => ObjectKind::DeviceAlertDialog,
            "weather" => ObjectKind::Weather,
            _ => ObjectKind::Other,
        }
    }

    /// The type prefix as it appears on the wire, e.g. `device`.
    pub fn type_name(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// The part after the type prefix, usually a serial or user id.
    pub fn suffix(&self) -> &str {
        self.0.split_once('.').map(|(_, s)| s).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjectKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// A revisioned object under `(serial, object_key)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateObject {
    pub key: ObjectKey,
    pub revision: i64,
    pub timestamp: i64,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

impl StateObject {
    /// Server-newer rule: revision dominates, timestamp breaks ties.
    pub fn is_newer_than(&self, client_revision: i64, client_timestamp: i64) -> bool {
        self.revision > client_revision
            || (self.revision == client_revision && self.timestamp > client_timestamp)
    }
}

/// Change event emitted by the state service for every effective write.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub serial: String,
    pub key: ObjectKey,
    pub revision: i64,
    pub timestamp: i64,
    pub value: Value,
}

/// User ids carry a well-known prefix; object key suffixes use the bare form.
pub fn strip_user_prefix(user_id: &str) -> &str {
    user_id.strip_prefix("user_").unwrap_or(user_id)
}
