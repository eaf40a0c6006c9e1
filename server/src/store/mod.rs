mod memory;
mod postgres;
mod sqlite;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::{ObjectKey, StateObject};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entry not found")]
    NotFound,
    #[error("conflicting write")]
    Conflict,
    #[error("entry code space exhausted")]
    ExhaustedCodes,
    #[error("store unavailable")]
    Unavailable(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct DeviceOwner {
    pub serial: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EntryKey {
    pub code: String,
    pub serial: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct WeatherEntry {
    pub postal_code: String,
    pub country: String,
    pub fetched_at: i64,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct EnabledIntegration {
    pub user_id: String,
    pub config: Value,
}

/// Authorization context attached to a validated API key.
#[derive(Debug, Clone)]
pub struct ApiKeyContext {
    pub user_id: String,
    pub name: String,
    pub serials: Vec<String>,
    pub scopes: Vec<String>,
}

impl ApiKeyContext {
    /// Empty serial list means the key is valid for all devices.
    pub fn allows_serial(&self, serial: &str) -> bool {
        self.serials.is_empty() || self.serials.iter().any(|s| s == serial)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == scope)
    }
}

const ENTRY_CODE_ATTEMPTS: usize = 8;

pub(crate) fn random_entry_code() -> String {
    use rand::Rng as _;

    let mut rng = rand::rng();
    let mut code = String::with_capacity(7);
    for _ in 0..3 {
        code.push(char::from_digit(rng.random_range(0..10), 10).unwrap_or('0'));
    }
    for _ in 0..4 {
        code.push(rng.random_range(b'A'..=b'Z') as char);
    }
    code
}

pub(crate) fn hash_api_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

pub(crate) fn key_preview(raw: &str) -> String {
    raw.chars().take(8).collect()
}

/// Persistence backends. All three are plug-compatible; `Memory` backs tests
/// and throwaway deployments, the other two are durable.
pub enum StateStore {
    Postgres(PostgresStore),
    Sqlite(SqliteStore),
    Memory(MemoryStore),
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $body:expr) => {
        match $self {
            StateStore::Postgres($store) => $body,
            StateStore::Sqlite($store) => $body,
            StateStore::Memory($store) => $body,
        }
    };
}

impl StateStore {
    pub async fn migrate(&self) -> Result<()> {
        dispatch!(self, s => s.migrate().await)
    }

    pub async fn upsert_state(
        &self,
        serial: &str,
        key: &ObjectKey,
        revision: i64,
        timestamp: i64,
        value: &Value,
    ) -> Result<()> {
        dispatch!(self, s => s.upsert_state(serial, key, revision, timestamp, value).await)
    }

    pub async fn get_state(&self, serial: &str, key: &ObjectKey) -> Result<Option<StateObject>> {
        dispatch!(self, s => s.get_state(serial, key).await)
    }

    pub async fn get_device_state(&self, serial: &str) -> Result<Vec<StateObject>> {
        dispatch!(self, s => s.get_device_state(serial).await)
    }

    pub async fn list_serials(&self) -> Result<Vec<String>> {
        dispatch!(self, s => s.list_serials().await)
    }

    pub async fn list_serials_with_postal(&self, postal: &str) -> Result<Vec<String>> {
        dispatch!(self, s => s.list_serials_with_postal(postal).await)
    }

    pub async fn generate_entry_key(&self, serial: &str, ttl_seconds: u64) -> Result<EntryKey> {
        dispatch!(self, s => s.generate_entry_key(serial, ttl_seconds).await)
    }

    pub async fn get_entry_key(&self, code: &str) -> Result<Option<EntryKey>> {
        dispatch!(self, s => s.get_entry_key(code).await)
    }

    pub async fn mark_entry_key_claimed(&self, code: &str, user_id: &str, claimed_at: i64) -> Result<()> {
        dispatch!(self, s => s.mark_entry_key_claimed(code, user_id, claimed_at).await)
    }

    pub async fn purge_expired_entry_keys(&self, now_ms: i64) -> Result<u64> {
        dispatch!(self, s => s.purge_expired_entry_keys(now_ms).await)
    }

    pub async fn get_device_owner(&self, serial: &str) -> Result<Option<DeviceOwner>> {
        dispatch!(self, s => s.get_device_owner(serial).await)
    }

    pub async fn put_device_owner(&self, serial: &str, user_id: &str) -> Result<()> {
        dispatch!(self, s => s.put_device_owner(serial, user_id).await)
    }

    pub async fn list_user_devices(&self, user_id: &str) -> Result<Vec<String>> {
        dispatch!(self, s => s.list_user_devices(user_id).await)
    }

    pub async fn get_shared_with_me(&self, user_id: &str) -> Result<Vec<String>> {
        dispatch!(self, s => s.get_shared_with_me(user_id).await)
    }

    pub async fn get_weather(&self, postal: &str, country: &str) -> Result<Option<WeatherEntry>> {
        dispatch!(self, s => s.get_weather(postal, country).await)
    }

    pub async fn upsert_weather(&self, postal: &str, country: &str, fetched_at: i64, payload: &Value) -> Result<()> {
        dispatch!(self, s => s.upsert_weather(postal, country, fetched_at, payload).await)
    }

    pub async fn list_enabled_integrations(&self, kind: &str) -> Result<Vec<EnabledIntegration>> {
        dispatch!(self, s => s.list_enabled_integrations(kind).await)
    }

    /// Validates a raw bearer key and stamps `last_used_at` as a side effect.
    pub async fn validate_api_key(&self, raw_key: &str) -> Result<Option<ApiKeyContext>> {
        dispatch!(self, s => s.validate_api_key(raw_key).await)
    }

    pub async fn insert_api_key(
        &self,
        raw_key: &str,
        user_id: &str,
        name: &str,
        serials: &[String],
        scopes: &[String],
    ) -> Result<()> {
        dispatch!(self, s => s.insert_api_key(raw_key, user_id, name, serials, scopes).await)
    }
}
