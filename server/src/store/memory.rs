use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use support::time::now_ms;

use crate::core::{ObjectKey, StateObject};

use super::{
    ApiKeyContext, DeviceOwner, EnabledIntegration, EntryKey, Result, StoreError, WeatherEntry,
    hash_api_key, random_entry_code,
};

/// Volatile backend. Same contract as the durable stores; state lives for the
/// lifetime of the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<(String, String), StateObject>,
    owners: HashMap<String, DeviceOwner>,
    shares: HashMap<String, HashSet<String>>,
    entry_keys: HashMap<String, EntryKey>,
    weather: HashMap<(String, String), WeatherEntry>,
    integrations: HashMap<(String, String), (bool, Value)>,
    api_keys: HashMap<String, ApiKeyRecord>,
}

struct ApiKeyRecord {
    user_id: String,
    name: String,
    serials: Vec<String>,
    scopes: Vec<String>,
    last_used_at: Option<i64>,
    revoked_at: Option<i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    pub async fn upsert_state(
        &self,
        serial: &str,
        key: &ObjectKey,
        revision: i64,
        timestamp: i64,
        value: &Value,
    ) -> Result<()> {
        let object = StateObject {
            key: key.clone(),
            revision,
            timestamp,
            value: value.clone(),
            updated_at: Utc::now(),
        };
        self.inner
            .write()
            .objects
            .insert((serial.to_string(), key.as_str().to_string()), object);
        Ok(())
    }

    pub async fn get_state(&self, serial: &str, key: &ObjectKey) -> Result<Option<StateObject>> {
        Ok(self
            .inner
            .read()
            .objects
            .get(&(serial.to_string(), key.as_str().to_string()))
            .cloned())
    }

    pub async fn get_device_state(&self, serial: &str) -> Result<Vec<StateObject>> {
        Ok(self
            .inner
            .read()
            .objects
            .iter()
            .filter(|((s, _), _)| s == serial)
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    pub async fn list_serials(&self) -> Result<Vec<String>> {
        let mut serials: Vec<String> = self
            .inner
            .read()
            .objects
            .keys()
            .map(|(s, _)| s.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        serials.sort();
        Ok(serials)
    }

    pub async fn list_serials_with_postal(&self, postal: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .objects
            .iter()
            .filter(|((s, k), obj)| {
                k == &format!("device.{s}")
                    && obj.value.get("postal_code").and_then(Value::as_str) == Some(postal)
            })
            .map(|((s, _), _)| s.clone())
            .collect())
    }

    pub async fn generate_entry_key(&self, serial: &str, ttl_seconds: u64) -> Result<EntryKey> {
        let mut inner = self.inner.write();
        inner.entry_keys.retain(|_, k| k.serial != serial);

        for _ in 0..super::ENTRY_CODE_ATTEMPTS {
            let code = random_entry_code();
            if inner.entry_keys.contains_key(&code) {
                continue;
            }

            let now = now_ms();
            let key = EntryKey {
                code: code.clone(),
                serial: serial.to_string(),
                created_at: now,
                expires_at: now + (ttl_seconds as i64) * 1000,
                claimed_by: None,
                claimed_at: None,
            };
            inner.entry_keys.insert(code, key.clone());
            return Ok(key);
        }

        Err(StoreError::ExhaustedCodes)
    }

    pub async fn get_entry_key(&self, code: &str) -> Result<Option<EntryKey>> {
        Ok(self.inner.read().entry_keys.get(code).cloned())
    }

    pub async fn mark_entry_key_claimed(&self, code: &str, user_id: &str, claimed_at: i64) -> Result<()> {
        let mut inner = self.inner.write();
        let key = inner.entry_keys.get_mut(code).ok_or(StoreError::NotFound)?;
        key.claimed_by = Some(user_id.to_string());
        key.claimed_at = Some(claimed_at);
        Ok(())
    }

    pub async fn purge_expired_entry_keys(&self, now_ms: i64) -> Result<u64> {
        let mut inner = self.inner.write();
        let before = inner.entry_keys.len();
        // claimed codes are terminal records and survive the sweep
        inner
            .entry_keys
            .retain(|_, k| k.claimed_by.is_some() || k.expires_at > now_ms);
        Ok((before - inner.entry_keys.len()) as u64)
    }

    pub async fn get_device_owner(&self, serial: &str) -> Result<Option<DeviceOwner>> {
        Ok(self.inner.read().owners.get(serial).cloned())
    }

    pub async fn put_device_owner(&self, serial: &str, user_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(owner) = inner.owners.get(serial) {
            if owner.user_id != user_id {
                return Err(StoreError::Conflict);
            }
            return Ok(());
        }
        inner.owners.insert(
            serial.to_string(),
            DeviceOwner {
                serial: serial.to_string(),
                user_id: user_id.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub async fn list_user_devices(&self, user_id: &str) -> Result<Vec<String>> {
        let mut serials: Vec<String> = self
            .inner
            .read()
            .owners
            .values()
            .filter(|o| o.user_id == user_id)
            .map(|o| o.serial.clone())
            .collect();
        serials.sort();
        Ok(serials)
    }

    pub async fn get_shared_with_me(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .shares
            .get(user_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub async fn get_weather(&self, postal: &str, country: &str) -> Result<Option<WeatherEntry>> {
        Ok(self
            .inner
            .read()
            .weather
            .get(&(postal.to_string(), country.to_string()))
            .cloned())
    }

    pub async fn upsert_weather(&self, postal: &str, country: &str, fetched_at: i64, payload: &Value) -> Result<()> {
        self.inner.write().weather.insert(
            (postal.to_string(), country.to_string()),
            WeatherEntry {
                postal_code: postal.to_string(),
                country: country.to_string(),
                fetched_at,
                payload: payload.clone(),
            },
        );
        Ok(())
    }

    pub async fn list_enabled_integrations(&self, kind: &str) -> Result<Vec<EnabledIntegration>> {
        Ok(self
            .inner
            .read()
            .integrations
            .iter()
            .filter(|((_, k), (enabled, _))| k == kind && *enabled)
            .map(|((user_id, _), (_, config))| EnabledIntegration {
                user_id: user_id.clone(),
                config: config.clone(),
            })
            .collect())
    }

    /// Integration configs are written by the dashboard; tests seed them here.
    #[cfg(test)]
    pub fn set_integration(&self, user_id: &str, kind: &str, enabled: bool, config: Value) {
        self.inner
            .write()
            .integrations
            .insert((user_id.to_string(), kind.to_string()), (enabled, config));
    }

    #[cfg(test)]
    pub fn add_share(&self, user_id: &str, serial: &str) {
        self.inner
            .write()
            .shares
            .entry(user_id.to_string())
            .or_default()
            .insert(serial.to_string());
    }

    pub async fn validate_api_key(&self, raw_key: &str) -> Result<Option<ApiKeyContext>> {
        let hash = hash_api_key(raw_key);
        let mut inner = self.inner.write();
        let Some(record) = inner.api_keys.get_mut(&hash) else {
            return Ok(None);
        };
        if record.revoked_at.is_some() {
            return Ok(None);
        }
        record.last_used_at = Some(now_ms());
        Ok(Some(ApiKeyContext {
            user_id: record.user_id.clone(),
            name: record.name.clone(),
            serials: record.serials.clone(),
            scopes: record.scopes.clone(),
        }))
    }

    pub async fn insert_api_key(
        &self,
        raw_key: &str,
        user_id: &str,
        name: &str,
        serials: &[String],
        scopes: &[String],
    ) -> Result<()> {
        self.inner.write().api_keys.insert(
            hash_api_key(raw_key),
            ApiKeyRecord {
                user_id: user_id.to_string(),
                name: name.to_string(),
                serials: serials.to_vec(),
                scopes: scopes.to_vec(),
                last_used_at: None,
                revoked_at: None,
            },
        );
        Ok(())
    }
}
