use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use support::time::{is_plausible_ms, now_ms};

use crate::core::error::ServiceError;
use crate::core::{ObjectKey, StateObject, strip_user_prefix};
use crate::rules;
use crate::state::{DeviceStateService, MergeOptions};
use crate::store::{EntryKey, StateStore, StoreError};

const GC_INTERVAL: Duration = Duration::from_secs(3600);

pub struct PairingService {
    store: Arc<StateStore>,
    state: Arc<DeviceStateService>,
    entry_key_ttl_seconds: u64,
}

#[derive(Debug)]
pub struct ClaimOutcome {
    pub serial: String,
    pub structure_id: String,
    /// Objects materialized by the claim, per serial bucket, for wake-up.
    pub changed: Vec<(String, StateObject)>,
}

impl PairingService {
    pub fn new(store: Arc<StateStore>, state: Arc<DeviceStateService>, entry_key_ttl_seconds: u64) -> Self {
        Self {
            store,
            state,
            entry_key_ttl_seconds,
        }
    }

    pub async fn generate(&self, serial: &str) -> Result<EntryKey, ServiceError> {
        let key = self.store.generate_entry_key(serial, self.entry_key_ttl_seconds).await?;
        tracing::info!("Issued entry key for {} (expires {})", serial, key.expires_at);
        Ok(key)
    }

    /// Redeems a code and materializes the pairing side effects. Each step is
    /// idempotent, so a failed claim can be retried safely.
    pub async fn claim(&self, code: &str, user_id: &str) -> Result<ClaimOutcome, ServiceError> {
        let entry = self
            .store
            .get_entry_key(code)
            .await?
            .ok_or(ServiceError::NotFound)?;

        if entry.claimed_by.is_some() {
            return Err(ServiceError::Conflict("entry code already claimed".to_string()));
        }

        // expires_at is milliseconds; a value that fits a seconds clock is
        // corrupt and treated as already expired
        if !is_plausible_ms(entry.expires_at) || entry.expires_at <= now_ms() {
            return Err(ServiceError::NotFound);
        }

        self.store.mark_entry_key_claimed(code, user_id, now_ms()).await?;

        if let Some(owner) = self.store.get_device_owner(&entry.serial).await?
            && owner.user_id != user_id
        {
            return Err(ServiceError::Conflict("device already linked".to_string()));
        }

        match self.store.put_device_owner(&entry.serial, user_id).await {
            Ok(()) => {}
            Err(StoreError::Conflict) => {
                return Err(ServiceError::Conflict("device already linked".to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let changed = self.materialize(&entry.serial, user_id).await?;

        tracing::info!("Device {} linked to {}", entry.serial, user_id);

        Ok(ClaimOutcome {
            serial: entry.serial,
            structure_id: strip_user_prefix(user_id).to_string(),
            changed,
        })
    }

    async fn materialize(&self, serial: &str, user_id: &str) -> Result<Vec<(String, StateObject)>, ServiceError> {
        let sid = strip_user_prefix(user_id);
        let structure_ref = format!("structure.{sid}");
        let device_ref = format!("device.{serial}");
        let mut changed = vec![];

        if let Some(obj) = rules::ensure_device_alert_dialog(&self.state, serial).await? {
            changed.push((serial.to_string(), obj));
        }

        let outcome = self
            .state
            .merge_update(
                serial,
                &ObjectKey::device(serial),
                &json!({"structure_id": sid}),
                MergeOptions::default(),
            )
            .await?;
        if outcome.changed {
            changed.push((serial.to_string(), outcome.object));
        }

        let structure_key = ObjectKey::structure(sid);
        let structure_update = match self.state.get(serial, &structure_key).await? {
            None => json!({
                "name": "Home",
                "devices": [device_ref.clone()],
                "time_zone": "UTC",
                "country_code": "US",
                "away": false,
                "user": format!("user.{sid}"),
            }),
            Some(existing) => {
                let mut devices = existing
                    .value
                    .get("devices")
                    .and_then(|d| d.as_array())
                    .cloned()
                    .unwrap_or_default();
                if !devices.iter().any(|d| d == &json!(device_ref.clone())) {
                    devices.push(json!(device_ref));
                }
                json!({"devices": devices})
            }
        };
        let outcome = self
            .state
            .merge_update(serial, &structure_key, &structure_update, MergeOptions::default())
            .await?;
        if outcome.changed {
            changed.push((serial.to_string(), outcome.object));
        }

        let outcome = self
            .state
            .merge_update(
                serial,
                &ObjectKey::link(serial),
                &json!({"structure": structure_ref}),
                MergeOptions::default(),
            )
            .await?;
        if outcome.changed {
            changed.push((serial.to_string(), outcome.object));
        }

        let user_key = ObjectKey::user(sid);
        let user_update = match self.state.get(serial, &user_key).await? {
            None => json!({
                "name": "",
                "structures": [structure_ref.clone()],
                "structure_memberships": [{"structure": structure_ref.clone(), "roles": ["owner"]}],
            }),
            Some(existing) => {
                let mut structures = existing
                    .value
                    .get("structures")
                    .and_then(|s| s.as_array())
                    .cloned()
                    .unwrap_or_default();
                let mut memberships = existing
                    .value
                    .get("structure_memberships")
                    .and_then(|m| m.as_array())
                    .cloned()
                    .unwrap_or_default();

                if !structures.iter().any(|s| s == &json!(structure_ref.clone())) {
                    structures.push(json!(structure_ref.clone()));
                }
                if !memberships
                    .iter()
                    .any(|m| m.get("structure") == Some(&json!(structure_ref.clone())))
                {
                    memberships.push(json!({"structure": structure_ref.clone(), "roles": ["owner"]}));
                }

                json!({"structures": structures, "structure_memberships": memberships})
            }
        };
        let outcome = self
            .state
            .merge_update(serial, &user_key, &user_update, MergeOptions::default())
            .await?;
        if outcome.changed {
            changed.push((serial.to_string(), outcome.object));
        }

        Ok(changed)
    }

    /// Hourly entry-key sweep.
    pub async fn run_gc(&self) {
        let mut interval = tokio::time::interval(GC_INTERVAL);
        loop {
            interval.tick().await;
            match self.store.purge_expired_entry_keys(now_ms()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Purged {} expired entry keys", n),
                Err(e) => tracing::warn!("Entry key purge failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn new_pairing() -> (Arc<StateStore>, Arc<DeviceStateService>, PairingService) {
        let store = Arc::new(StateStore::Memory(MemoryStore::new()));
        let (state, writer) = DeviceStateService::new(store.clone());
        tokio::spawn(writer.run());
        let pairing = PairingService::new(store.clone(), state.clone(), 3600);
        (store, state, pairing)
    }

    #[tokio::test]
    async fn claim_materializes_all_pairing_objects() {
        let (_store, state, pairing) = new_pairing();

        let code = pairing.generate("ABC123").await.unwrap().code;
        let outcome = pairing.claim(&code, "user_xyz").await.unwrap();

        assert_eq!(outcome.serial, "ABC123");
        assert_eq!(outcome.structure_id, "xyz");

        let device = state.get("ABC123", &ObjectKey::device("ABC123")).await.unwrap().unwrap();
        assert_eq!(device.value["structure_id"], json!("xyz"));

        let structure = state.get("ABC123", &ObjectKey::structure("xyz")).await.unwrap().unwrap();
        assert_eq!(structure.value["devices"], json!(["device.ABC123"]));

        let link = state.get("ABC123", &ObjectKey::link("ABC123")).await.unwrap().unwrap();
        assert_eq!(link.value["structure"], json!("structure.xyz"));

        let user = state.get("ABC123", &ObjectKey::user("xyz")).await.unwrap().unwrap();
        assert_eq!(user.value["structures"], json!(["structure.xyz"]));

        assert!(
            state
                .get("ABC123", &ObjectKey::device_alert_dialog("ABC123"))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn claimed_code_cannot_be_claimed_again() {
        let (_store, _state, pairing) = new_pairing();

        let code = pairing.generate("ABC123").await.unwrap().code;
        pairing.claim(&code, "user_xyz").await.unwrap();

        let err = pairing.claim(&code, "user_xyz").await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn fresh_code_reclaim_by_same_user_is_idempotent() {
        let (_store, state, pairing) = new_pairing();

        let code = pairing.generate("ABC123").await.unwrap().code;
        pairing.claim(&code, "user_xyz").await.unwrap();

        let code = pairing.generate("ABC123").await.unwrap().code;
        pairing.claim(&code, "user_xyz").await.unwrap();

        let structure = state.get("ABC123", &ObjectKey::structure("xyz")).await.unwrap().unwrap();
        assert_eq!(structure.value["devices"], json!(["device.ABC123"]));
    }

    #[tokio::test]
    async fn linked_device_rejects_other_users() {
        let (_store, _state, pairing) = new_pairing();

        let code = pairing.generate("ABC123").await.unwrap().code;
        pairing.claim(&code, "user_xyz").await.unwrap();

        let code = pairing.generate("ABC123").await.unwrap().code;
        let err = pairing.claim(&code, "user_other").await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let (_store, _state, pairing) = new_pairing();
        let err = pairing.claim("000XXXX", "user_xyz").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound));
    }

    #[tokio::test]
    async fn second_device_joins_the_existing_structure() {
        let (_store, state, pairing) = new_pairing();

        let code = pairing.generate("ABC123").await.unwrap().code;
        pairing.claim(&code, "user_xyz").await.unwrap();

        // user objects exist in the second bucket independently
        let code = pairing.generate("DEF456").await.unwrap().code;
        pairing.claim(&code, "user_xyz").await.unwrap();

        let structure = state.get("DEF456", &ObjectKey::structure("xyz")).await.unwrap().unwrap();
        assert_eq!(structure.value["devices"], json!(["device.DEF456"]));

        let first = state.get("ABC123", &ObjectKey::structure("xyz")).await.unwrap().unwrap();
        assert_eq!(first.value["devices"], json!(["device.ABC123"]));
    }
}
