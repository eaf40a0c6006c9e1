use serde_json::Value;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use support::time::{from_ms, now_ms};

use crate::core::{ObjectKey, StateObject};

use super::{
    ApiKeyContext, DeviceOwner, EnabledIntegration, EntryKey, Result, StoreError, WeatherEntry,
    hash_api_key, key_preview, random_entry_code,
};

/// Embedded relational backend. JSON values are stored as serialized TEXT and
/// all timestamps as millisecond integers.
pub struct SqliteStore {
    pool: SqlitePool,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS device_objects (
        serial TEXT NOT NULL,
        object_key TEXT NOT NULL,
        revision INTEGER NOT NULL,
        ts INTEGER NOT NULL,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (serial, object_key))",
    "CREATE TABLE IF NOT EXISTS device_owners (
        serial TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        created_at INTEGER NOT NULL)",
    "CREATE TABLE IF NOT EXISTS device_shares (
        serial TEXT NOT NULL,
        user_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (serial, user_id))",
    "CREATE TABLE IF NOT EXISTS entry_keys (
        code TEXT PRIMARY KEY,
        serial TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        claimed_by TEXT,
        claimed_at INTEGER)",
    "CREATE TABLE IF NOT EXISTS weather_cache (
        postal_code TEXT NOT NULL,
        country TEXT NOT NULL,
        fetched_at INTEGER NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (postal_code, country))",
    "CREATE TABLE IF NOT EXISTS integration_configs (
        user_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 0,
        config TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (user_id, kind))",
    "CREATE TABLE IF NOT EXISTS api_keys (
        key_hash TEXT PRIMARY KEY,
        key_preview TEXT NOT NULL,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        serials TEXT NOT NULL,
        scopes TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        last_used_at INTEGER,
        revoked_at INTEGER)",
];

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
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
        sqlx::query(
            "INSERT INTO device_objects (serial, object_key, revision, ts, value, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (serial, object_key)
             DO UPDATE SET revision = excluded.revision, ts = excluded.ts,
                           value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(serial)
        .bind(key.as_str())
        .bind(revision)
        .bind(timestamp)
        .bind(value.to_string())
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_state(&self, serial: &str, key: &ObjectKey) -> Result<Option<StateObject>> {
        let row = sqlx::query(
            "SELECT object_key, revision, ts, value, updated_at
             FROM device_objects WHERE serial = $1 AND object_key = $2",
        )
        .bind(serial)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(object_from_row))
    }

    pub async fn get_device_state(&self, serial: &str) -> Result<Vec<StateObject>> {
        let rows = sqlx::query(
            "SELECT object_key, revision, ts, value, updated_at
             FROM device_objects WHERE serial = $1 ORDER BY object_key",
        )
        .bind(serial)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(object_from_row).collect())
    }

    pub async fn list_serials(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT serial FROM device_objects ORDER BY serial")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("serial")).collect())
    }

    pub async fn list_serials_with_postal(&self, postal: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT serial FROM device_objects
             WHERE object_key = 'device.' || serial
             AND json_extract(value, '$.postal_code') = $1",
        )
        .bind(postal)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("serial")).collect())
    }

    pub async fn generate_entry_key(&self, serial: &str, ttl_seconds: u64) -> Result<EntryKey> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM entry_keys WHERE serial = $1")
            .bind(serial)
            .execute(&mut *tx)
            .await?;

        for _ in 0..super::ENTRY_CODE_ATTEMPTS {
            let code = random_entry_code();
            let now = now_ms();
            let expires_at = now + (ttl_seconds as i64) * 1000;

            let res = sqlx::query(
                "INSERT INTO entry_keys (code, serial, created_at, expires_at)
                 VALUES ($1, $2, $3, $4) ON CONFLICT (code) DO NOTHING",
            )
            .bind(&code)
            .bind(serial)
            .bind(now)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;

            if res.rows_affected() == 1 {
                tx.commit().await?;
                return Ok(EntryKey {
                    code,
                    serial: serial.to_string(),
                    created_at: now,
                    expires_at,
                    claimed_by: None,
                    claimed_at: None,
                });
            }
        }

        tx.rollback().await?;
        Err(StoreError::ExhaustedCodes)
    }

    pub async fn get_entry_key(&self, code: &str) -> Result<Option<EntryKey>> {
        let row = sqlx::query(
            "SELECT code, serial, created_at, expires_at, claimed_by, claimed_at
             FROM entry_keys WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| EntryKey {
            code: r.get("code"),
            serial: r.get("serial"),
            created_at: r.get("created_at"),
            expires_at: r.get("expires_at"),
            claimed_by: r.get("claimed_by"),
            claimed_at: r.get("claimed_at"),
        }))
    }

    pub async fn mark_entry_key_claimed(&self, code: &str, user_id: &str, claimed_at: i64) -> Result<()> {
        let res = sqlx::query("UPDATE entry_keys SET claimed_by = $2, claimed_at = $3 WHERE code = $1")
            .bind(code)
            .bind(user_id)
            .bind(claimed_at)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn purge_expired_entry_keys(&self, now_ms: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM entry_keys WHERE claimed_by IS NULL AND expires_at <= $1")
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn get_device_owner(&self, serial: &str) -> Result<Option<DeviceOwner>> {
        let row = sqlx::query("SELECT serial, user_id, created_at FROM device_owners WHERE serial = $1")
            .bind(serial)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| DeviceOwner {
            serial: r.get("serial"),
            user_id: r.get("user_id"),
            created_at: from_ms(r.get("created_at")),
        }))
    }

    pub async fn put_device_owner(&self, serial: &str, user_id: &str) -> Result<()> {
        let res = sqlx::query(
            "INSERT INTO device_owners (serial, user_id, created_at)
             VALUES ($1, $2, $3) ON CONFLICT (serial) DO NOTHING",
        )
        .bind(serial)
        .bind(user_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            let existing = self.get_device_owner(serial).await?;
            if existing.map(|o| o.user_id) != Some(user_id.to_string()) {
                return Err(StoreError::Conflict);
            }
        }
        Ok(())
    }

    pub async fn list_user_devices(&self, user_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT serial FROM device_owners WHERE user_id = $1 ORDER BY serial")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("serial")).collect())
    }

    pub async fn get_shared_with_me(&self, user_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT serial FROM device_shares WHERE user_id = $1 ORDER BY serial")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("serial")).collect())
    }

    pub async fn get_weather(&self, postal: &str, country: &str) -> Result<Option<WeatherEntry>> {
        let row = sqlx::query(
            "SELECT postal_code, country, fetched_at, payload
             FROM weather_cache WHERE postal_code = $1 AND country = $2",
        )
        .bind(postal)
        .bind(country)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| WeatherEntry {
            postal_code: r.get("postal_code"),
            country: r.get("country"),
            fetched_at: r.get("fetched_at"),
            payload: parse_json(r.get("payload")),
        }))
    }

    pub async fn upsert_weather(&self, postal: &str, country: &str, fetched_at: i64, payload: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO weather_cache (postal_code, country, fetched_at, payload)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (postal_code, country)
             DO UPDATE SET fetched_at = excluded.fetched_at, payload = excluded.payload",
        )
        .bind(postal)
        .bind(country)
        .bind(fetched_at)
        .bind(payload.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_enabled_integrations(&self, kind: &str) -> Result<Vec<EnabledIntegration>> {
        let rows = sqlx::query("SELECT user_id, config FROM integration_configs WHERE kind = $1 AND enabled = 1")
            .bind(kind)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| EnabledIntegration {
                user_id: r.get("user_id"),
                config: parse_json(r.get("config")),
            })
            .collect())
    }

    pub async fn validate_api_key(&self, raw_key: &str) -> Result<Option<ApiKeyContext>> {
        let row = sqlx::query(
            "UPDATE api_keys SET last_used_at = $2
             WHERE key_hash = $1 AND revoked_at IS NULL
             RETURNING user_id, name, serials, scopes",
        )
        .bind(hash_api_key(raw_key))
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ApiKeyContext {
            user_id: r.get("user_id"),
            name: r.get("name"),
            serials: string_list(&parse_json(r.get("serials"))),
            scopes: string_list(&parse_json(r.get("scopes"))),
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
        sqlx::query(
            "INSERT INTO api_keys (key_hash, key_preview, user_id, name, serials, scopes, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (key_hash) DO NOTHING",
        )
        .bind(hash_api_key(raw_key))
        .bind(key_preview(raw_key))
        .bind(user_id)
        .bind(name)
        .bind(serde_json::json!(serials).to_string())
        .bind(serde_json::json!(scopes).to_string())
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn object_from_row(row: SqliteRow) -> StateObject {
    StateObject {
        key: ObjectKey::new(row.get::<String, _>("object_key")),
        revision: row.get("revision"),
        timestamp: row.get("ts"),
        value: parse_json(row.get("value")),
        updated_at: from_ms(row.get("updated_at")),
    }
}

fn parse_json(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::Null)
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
