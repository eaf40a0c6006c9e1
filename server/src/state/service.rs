use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};

use support::json::{deep_merge, values_equal};
use support::time::now_ms;

use crate::core::error::ServiceError;
use crate::core::{ObjectKey, ObjectKind, StateChange, StateObject, strip_user_prefix};
use crate::rules;
use crate::store::StateStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PERSIST_QUEUE_CAPACITY: usize = 1024;

/// Authoritative in-memory cache over the StateStore.
///
/// Buckets hydrate lazily on first access to a serial. Writes to the same
/// `(serial, key)` serialize through a per-key mutex; persistence happens
/// asynchronously through the writer queue and never fails the caller.
pub struct DeviceStateService {
    store: Arc<StateStore>,
    cache: RwLock<HashMap<String, DeviceBucket>>,
    key_locks: parking_lot::Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    event_tx: broadcast::Sender<StateChange>,
    persist_tx: mpsc::Sender<PersistJob>,
}

struct DeviceBucket {
    objects: HashMap<ObjectKey, StateObject>,
}

enum PersistJob {
    Write { serial: String, object: StateObject },
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
pub struct MergeOptions {
    /// Device identity annotation written into the merged value.
    pub touched_id: Option<String>,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub object: StateObject,
    pub changed: bool,
}

impl DeviceStateService {
    pub fn new(store: Arc<StateStore>) -> (Arc<Self>, PersistenceWriter) {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (persist_tx, persist_rx) = mpsc::channel(PERSIST_QUEUE_CAPACITY);

        let service = Arc::new(Self {
            store: store.clone(),
            cache: RwLock::new(HashMap::new()),
            key_locks: parking_lot::Mutex::new(HashMap::new()),
            event_tx,
            persist_tx,
        });

        let writer = PersistenceWriter {
            store,
            rx: persist_rx,
        };

        (service, writer)
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.event_tx.subscribe()
    }

    pub async fn get(&self, serial: &str, key: &ObjectKey) -> Result<Option<StateObject>, ServiceError> {
        self.hydrate(serial).await?;
        Ok(self
            .cache
            .read()
            .await
            .get(serial)
            .and_then(|bucket| bucket.objects.get(key))
            .cloned())
    }

    pub async fn get_all(&self, serial: &str) -> Result<Vec<StateObject>, ServiceError> {
        self.hydrate(serial).await?;
        let mut objects: Vec<StateObject> = self
            .cache
            .read()
            .await
            .get(serial)
            .map(|bucket| bucket.objects.values().cloned().collect())
            .unwrap_or_default();
        objects.sort_by(|a, b| a.key.as_str().cmp(b.key.as_str()));
        Ok(objects)
    }

    /// Deep-merge `incoming` into the current value and bump the revision iff
    /// the merged value differs. Device objects additionally get fan-timer
    /// preservation and structure-id backfill applied before the comparison.
    pub async fn merge_update(
        &self,
        serial: &str,
        key: &ObjectKey,
        incoming: &Value,
        opts: MergeOptions,
    ) -> Result<MergeOutcome, ServiceError> {
        self.hydrate(serial).await?;
        let lock = self.key_lock(serial, key);
        let _guard = lock.lock().await;

        let prior = self
            .cache
            .read()
            .await
            .get(serial)
            .and_then(|bucket| bucket.objects.get(key))
            .cloned();

        let prior_value = prior
            .as_ref()
            .map(|o| o.value.clone())
            .unwrap_or_else(|| Value::Object(Map::new()));

        let mut merged = deep_merge(&prior_value, incoming);

        if key.kind() == ObjectKind::Device {
            rules::preserve_fan_timer(&prior_value, &mut merged);
            self.backfill_structure_id(serial, &mut merged).await;
        }

        if let Some(id) = &opts.touched_id
            && let Some(map) = merged.as_object_mut()
        {
            map.insert("touched_id".to_string(), Value::String(id.clone()));
        }

        let changed = prior
            .as_ref()
            .map(|o| !values_equal(&o.value, &merged))
            .unwrap_or(true);

        let (revision, timestamp) = match (&prior, changed) {
            (Some(p), false) => (p.revision, p.timestamp),
            (Some(p), true) => (p.revision + 1, now_ms()),
            (None, _) => (1, now_ms()),
        };

        let object = StateObject {
            key: key.clone(),
            revision,
            timestamp,
            value: merged,
            updated_at: Utc::now(),
        };

        self.commit(serial, &object, changed).await;

        Ok(MergeOutcome { object, changed })
    }

    /// Client-newer reconciliation: store the client's revision and timestamp
    /// with the server value overlaid onto the client value.
    pub async fn accept_client(
        &self,
        serial: &str,
        key: &ObjectKey,
        revision: i64,
        timestamp: i64,
        client_value: Option<&Value>,
    ) -> Result<StateObject, ServiceError> {
        self.hydrate(serial).await?;
        let lock = self.key_lock(serial, key);
        let _guard = lock.lock().await;

        let prior = self
            .cache
            .read()
            .await
            .get(serial)
            .and_then(|bucket| bucket.objects.get(key))
            .cloned();

        let value = match (client_value, prior.as_ref()) {
            (Some(cv), Some(p)) => deep_merge(cv, &p.value),
            (Some(cv), None) => cv.clone(),
            (None, Some(p)) => p.value.clone(),
            (None, None) => Value::Object(Map::new()),
        };

        let object = StateObject {
            key: key.clone(),
            revision,
            timestamp,
            value,
            updated_at: Utc::now(),
        };

        self.commit(serial, &object, true).await;

        Ok(object)
    }

    /// Blocks until every queued persistence job has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.persist_tx.send(PersistJob::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    async fn commit(&self, serial: &str, object: &StateObject, changed: bool) {
        self.cache
            .write()
            .await
            .entry(serial.to_string())
            .or_insert_with(|| DeviceBucket {
                objects: HashMap::new(),
            })
            .objects
            .insert(object.key.clone(), object.clone());

        if !changed {
            return;
        }

        if let Err(e) = self
            .persist_tx
            .send(PersistJob::Write {
                serial: serial.to_string(),
                object: object.clone(),
            })
            .await
        {
            tracing::error!("Persistence queue closed, dropping write for {}/{}: {}", serial, object.key, e);
        }

        let _ = self.event_tx.send(StateChange {
            serial: serial.to_string(),
            key: object.key.clone(),
            revision: object.revision,
            timestamp: object.timestamp,
            value: object.value.clone(),
        });
    }

    async fn backfill_structure_id(&self, serial: &str, merged: &mut Value) {
        let Some(map) = merged.as_object_mut() else { return };
        if map.contains_key("structure_id") {
            return;
        }

        match self.store.get_device_owner(serial).await {
            Ok(Some(owner)) => {
                map.insert(
                    "structure_id".to_string(),
                    Value::String(strip_user_prefix(&owner.user_id).to_string()),
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Owner lookup failed for {}, skipping structure backfill: {}", serial, e);
            }
        }
    }

    async fn hydrate(&self, serial: &str) -> Result<(), ServiceError> {
        if self.cache.read().await.contains_key(serial) {
            return Ok(());
        }

        let objects = self.store.get_device_state(serial).await.map_err(|e| {
            tracing::error!("Error hydrating device {}: {}", serial, e);
            ServiceError::StoreUnavailable
        })?;

        let mut cache = self.cache.write().await;
        cache.entry(serial.to_string()).or_insert_with(|| DeviceBucket {
            objects: objects.into_iter().map(|o| (o.key.clone(), o)).collect(),
        });

        Ok(())
    }

    fn key_lock(&self, serial: &str, key: &ObjectKey) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .entry((serial.to_string(), key.as_str().to_string()))
            .or_default()
            .clone()
    }
}

/// Drains the persistence queue. Write failures are logged and retried once;
/// they never propagate to the device-facing path.
pub struct PersistenceWriter {
    store: Arc<StateStore>,
    rx: mpsc::Receiver<PersistJob>,
}

impl PersistenceWriter {
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            match job {
                PersistJob::Write { serial, object } => self.persist(&serial, &object).await,
                PersistJob::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }

    async fn persist(&self, serial: &str, object: &StateObject) {
        for attempt in 0..2 {
            match self
                .store
                .upsert_state(serial, &object.key, object.revision, object.timestamp, &object.value)
                .await
            {
                Ok(_) => return,
                Err(e) if attempt == 0 => {
                    tracing::warn!("Persisting {}/{} failed, retrying: {}", serial, object.key, e);
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
                Err(e) => {
                    tracing::error!("Dropping persistence write for {}/{}: {}", serial, object.key, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    fn new_service() -> (Arc<DeviceStateService>, PersistenceWriter) {
        DeviceStateService::new(Arc::new(StateStore::Memory(MemoryStore::new())))
    }

    #[tokio::test]
    async fn first_write_creates_revision_one() {
        let (service, _writer) = new_service();
        let outcome = service
            .merge_update("ABC123", &ObjectKey::shared("ABC123"), &json!({"target_temperature": 21.0}), MergeOptions::default())
            .await
            .unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.object.revision, 1);
    }

    #[tokio::test]
    async fn noop_write_keeps_revision_and_timestamp() {
        let (service, _writer) = new_service();
        let key = ObjectKey::shared("ABC123");

        let first = service
            .merge_update("ABC123", &key, &json!({"target_temperature": 21.0}), MergeOptions::default())
            .await
            .unwrap();
        let second = service
            .merge_update("ABC123", &key, &json!({"target_temperature": 21.0}), MergeOptions::default())
            .await
            .unwrap();

        assert!(!second.changed);
        assert_eq!(second.object.revision, first.object.revision);
        assert_eq!(second.object.timestamp, first.object.timestamp);
    }

    #[tokio::test]
    async fn partial_update_merges_and_bumps() {
        let (service, _writer) = new_service();
        let key = ObjectKey::device("ABC123");

        service
            .merge_update(
                "ABC123",
                &key,
                &json!({"away": false, "fan_timer_duration": 900, "postal_code": "94107"}),
                MergeOptions::default(),
            )
            .await
            .unwrap();

        let outcome = service
            .merge_update("ABC123", &key, &json!({"away": true}), MergeOptions::default())
            .await
            .unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.object.revision, 2);
        assert_json_eq!(
            outcome.object.value,
            json!({"away": true, "fan_timer_duration": 900, "postal_code": "94107"})
        );
    }

    #[tokio::test]
    async fn fan_timer_fields_survive_null_outs() {
        let (service, _writer) = new_service();
        let key = ObjectKey::device("ABC123");

        service
            .merge_update(
                "ABC123",
                &key,
                &json!({"fan_mode": "auto", "fan_timer_duration": 900}),
                MergeOptions::default(),
            )
            .await
            .unwrap();

        let outcome = service
            .merge_update(
                "ABC123",
                &key,
                &json!({"fan_mode": null, "current_temperature": 20.5}),
                MergeOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.object.value["fan_mode"], json!("auto"));
        assert_eq!(outcome.object.value["fan_timer_duration"], json!(900));
    }

    #[tokio::test]
    async fn structure_id_backfilled_from_owner() {
        let store = Arc::new(StateStore::Memory(MemoryStore::new()));
        store.put_device_owner("ABC123", "user_xyz").await.unwrap();
        let (service, _writer) = DeviceStateService::new(store);

        let outcome = service
            .merge_update("ABC123", &ObjectKey::device("ABC123"), &json!({"away": false}), MergeOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.object.value["structure_id"], json!("xyz"));
    }

    #[tokio::test]
    async fn accept_client_stores_client_revision_with_server_overlay() {
        let (service, _writer) = new_service();
        let key = ObjectKey::shared("ABC123");

        service
            .merge_update("ABC123", &key, &json!({"target_temperature": 20.0, "mode": "heat"}), MergeOptions::default())
            .await
            .unwrap();

        let accepted = service
            .accept_client("ABC123", &key, 9, 5_000_000_000_000, Some(&json!({"target_temperature": 22.0, "extra": 1})))
            .await
            .unwrap();

        assert_eq!(accepted.revision, 9);
        assert_eq!(accepted.timestamp, 5_000_000_000_000);
        // server value wins where both sides carry the field
        assert_eq!(accepted.value["target_temperature"], json!(20.0));
        assert_eq!(accepted.value["extra"], json!(1));
    }

    #[tokio::test]
    async fn concurrent_writes_serialize_per_key() {
        let (service, _writer) = new_service();
        let key = ObjectKey::shared("ABC123");

        service
            .merge_update("ABC123", &key, &json!({"target_temperature": 20.0}), MergeOptions::default())
            .await
            .unwrap();

        let a = {
            let service = service.clone();
            let key = key.clone();
            tokio::spawn(async move {
                service
                    .merge_update("ABC123", &key, &json!({"target_temperature": 21.0}), MergeOptions::default())
                    .await
                    .unwrap()
            })
        };
        let b = {
            let service = service.clone();
            let key = key.clone();
            tokio::spawn(async move {
                service
                    .merge_update("ABC123", &key, &json!({"target_temperature": 22.0}), MergeOptions::default())
                    .await
                    .unwrap()
            })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let last = service.get("ABC123", &key).await.unwrap().unwrap();
        assert_eq!(last.revision, 3);
        assert!(a.changed && b.changed);
        let t = last.value["target_temperature"].as_f64().unwrap();
        assert!(t == 21.0 || t == 22.0);
    }

    #[tokio::test]
    async fn change_events_fire_only_on_effective_writes() {
        let (service, _writer) = new_service();
        let mut events = service.subscribe_changes();
        let key = ObjectKey::shared("ABC123");

        service
            .merge_update("ABC123", &key, &json!({"mode": "heat"}), MergeOptions::default())
            .await
            .unwrap();
        service
            .merge_update("ABC123", &key, &json!({"mode": "heat"}), MergeOptions::default())
            .await
            .unwrap();
        service
            .merge_update("ABC123", &key, &json!({"mode": "cool"}), MergeOptions::default())
            .await
            .unwrap();

        assert_eq!(events.recv().await.unwrap().revision, 1);
        assert_eq!(events.recv().await.unwrap().revision, 2);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn flush_waits_for_queued_persistence() {
        let store = Arc::new(StateStore::Memory(MemoryStore::new()));
        let (service, writer) = DeviceStateService::new(store.clone());
        tokio::spawn(writer.run());

        service
            .merge_update("ABC123", &ObjectKey::device("ABC123"), &json!({"away": true}), MergeOptions::default())
            .await
            .unwrap();
        service.flush().await;

        let persisted = store
            .get_state("ABC123", &ObjectKey::device("ABC123"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.revision, 1);
    }
}
