mod mqtt;

pub use mqtt::{MqttIntegration, MqttIntegrationConfig};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use support::json::values_equal;

use crate::core::StateChange;
use crate::state::DeviceStateService;
use crate::store::StateStore;
use crate::subscription::{PresenceEvent, SubscriptionManager};

pub const KIND_MQTT: &str = "mqtt";
const SUPPORTED_KINDS: &[&str] = &[KIND_MQTT];
const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IntegrationId {
    pub kind: String,
    pub user_id: String,
}

pub enum Integration {
    Mqtt(MqttIntegration),
}

impl Integration {
    pub async fn initialize(&mut self) -> anyhow::Result<()> {
        match self {
            Integration::Mqtt(i) => i.initialize().await,
        }
    }

    pub async fn on_state_change(&self, change: &StateChange) -> anyhow::Result<()> {
        match self {
            Integration::Mqtt(i) => i.on_state_change(change).await,
        }
    }

    pub async fn on_device_connected(&self, serial: &str) -> anyhow::Result<()> {
        match self {
            Integration::Mqtt(i) => i.on_device_connected(serial).await,
        }
    }

    pub async fn on_device_disconnected(&self, serial: &str) -> anyhow::Result<()> {
        match self {
            Integration::Mqtt(i) => i.on_device_disconnected(serial).await,
        }
    }

    pub async fn shutdown(&mut self) {
        match self {
            Integration::Mqtt(i) => i.shutdown().await,
        }
    }
}

struct Loaded {
    config: Value,
    integration: Integration,
}

/// Keeps the loaded integration set reconciled against the store and fans
/// state/presence events out to every loaded integration. Callback failures
/// are isolated per integration.
pub struct IntegrationManager {
    store: Arc<StateStore>,
    state: Arc<DeviceStateService>,
    subs: Arc<SubscriptionManager>,
    loaded: HashMap<IntegrationId, Loaded>,
}

impl IntegrationManager {
    pub fn new(store: Arc<StateStore>, state: Arc<DeviceStateService>, subs: Arc<SubscriptionManager>) -> Self {
        Self {
            store,
            state,
            subs,
            loaded: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut changes = self.state.subscribe_changes();
        let mut presence = self.subs.subscribe_presence();
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile().await,
                change = changes.recv() => match change {
                    Ok(change) => self.fan_out_state_change(change).await,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Integration fan-out lagged by {} state changes", n);
                    }
                    Err(RecvError::Closed) => return,
                },
                event = presence.recv() => match event {
                    Ok(event) => self.fan_out_presence(event).await,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Integration fan-out lagged by {} presence events", n);
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }

    /// One reconciliation cycle: load enabled configs, shut down removed
    /// ones, replace changed ones, construct new ones.
    pub async fn reconcile(&mut self) {
        let mut want: HashMap<IntegrationId, Value> = HashMap::new();
        for kind in SUPPORTED_KINDS {
            match self.store.list_enabled_integrations(kind).await {
                Ok(enabled) => {
                    for item in enabled {
                        want.insert(
                            IntegrationId {
                                kind: (*kind).to_string(),
                                user_id: item.user_id,
                            },
                            item.config,
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!("Integration reconciliation skipped for {}: {}", kind, e);
                    return;
                }
            }
        }

        let current: Vec<IntegrationId> = self.loaded.keys().cloned().collect();
        for id in current {
            match want.get(&id) {
                None => {
                    tracing::info!("Integration {}/{} disabled, shutting down", id.kind, id.user_id);
                    if let Some(mut loaded) = self.loaded.remove(&id) {
                        loaded.integration.shutdown().await;
                    }
                }
                Some(config) if !values_equal(config, &self.loaded[&id].config) => {
                    tracing::info!("Integration {}/{} config changed, reloading", id.kind, id.user_id);
                    if let Some(mut loaded) = self.loaded.remove(&id) {
                        loaded.integration.shutdown().await;
                    }
                    // stays in `want`, reconstructed below
                }
                Some(_) => {
                    want.remove(&id);
                }
            }
        }

        for (id, config) in want {
            match self.construct(&id, &config) {
                Ok(mut integration) => match integration.initialize().await {
                    Ok(()) => {
                        tracing::info!("Integration {}/{} loaded", id.kind, id.user_id);
                        self.loaded.insert(id, Loaded { config, integration });
                    }
                    Err(e) => {
                        tracing::warn!("Integration {}/{} failed to initialize, retrying next cycle: {}", id.kind, id.user_id, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Integration {}/{} has an invalid config: {}", id.kind, id.user_id, e);
                }
            }
        }
    }

    fn construct(&self, id: &IntegrationId, config: &Value) -> anyhow::Result<Integration> {
        match id.kind.as_str() {
            KIND_MQTT => {
                let config: MqttIntegrationConfig = serde_json::from_value(config.clone())?;
                Ok(Integration::Mqtt(MqttIntegration::new(
                    id.user_id.clone(),
                    config,
                    self.state.clone(),
                    self.subs.clone(),
                    self.store.clone(),
                )))
            }
            other => anyhow::bail!("unsupported integration type {other}"),
        }
    }

    async fn fan_out_state_change(&self, change: StateChange) {
        let calls = self.loaded.iter().map(|(id, loaded)| {
            let change = &change;
            async move {
                if let Err(e) = loaded.integration.on_state_change(change).await {
                    tracing::warn!("Integration {}/{} state-change callback failed: {}", id.kind, id.user_id, e);
                }
            }
        });
        futures::future::join_all(calls).await;
    }

    async fn fan_out_presence(&self, event: PresenceEvent) {
        let calls = self.loaded.iter().map(|(id, loaded)| {
            let event = &event;
            async move {
                let result = if event.connected {
                    loaded.integration.on_device_connected(&event.serial).await
                } else {
                    loaded.integration.on_device_disconnected(&event.serial).await
                };
                if let Err(e) = result {
                    tracing::warn!("Integration {}/{} presence callback failed: {}", id.kind, id.user_id, e);
                }
            }
        });
        futures::future::join_all(calls).await;
    }

    #[cfg(test)]
    pub fn is_loaded(&self, kind: &str, user_id: &str) -> bool {
        self.loaded.contains_key(&IntegrationId {
            kind: kind.to_string(),
            user_id: user_id.to_string(),
        })
    }

    #[cfg(test)]
    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::subscription::SubscriptionConfig;
    use serde_json::json;

    fn broker_config(port: u16) -> Value {
        json!({"host": "127.0.0.1", "port": port, "prefix": "renest"})
    }

    fn new_manager(store: Arc<StateStore>) -> IntegrationManager {
        let (state, _writer) = DeviceStateService::new(store.clone());
        let subs = Arc::new(SubscriptionManager::new(SubscriptionConfig {
            max_per_device: 6,
            timeout_ms: 60_000,
        }));
        IntegrationManager::new(store, state, subs)
    }

    #[tokio::test]
    async fn reconcile_loads_and_unloads_with_the_store() {
        let memory = MemoryStore::new();
        memory.set_integration("user_xyz", KIND_MQTT, true, broker_config(1883));
        let store = Arc::new(StateStore::Memory(memory));
        let mut manager = new_manager(store.clone());

        manager.reconcile().await;
        assert!(manager.is_loaded(KIND_MQTT, "user_xyz"));

        let StateStore::Memory(memory) = store.as_ref() else { unreachable!() };
        memory.set_integration("user_xyz", KIND_MQTT, false, broker_config(1883));

        manager.reconcile().await;
        assert!(!manager.is_loaded(KIND_MQTT, "user_xyz"));
        assert_eq!(manager.loaded_count(), 0);
    }

    #[tokio::test]
    async fn config_change_replaces_the_loaded_integration() {
        let memory = MemoryStore::new();
        memory.set_integration("user_xyz", KIND_MQTT, true, broker_config(1883));
        let store = Arc::new(StateStore::Memory(memory));
        let mut manager = new_manager(store.clone());

        manager.reconcile().await;
        assert_eq!(manager.loaded_count(), 1);

        let StateStore::Memory(memory) = store.as_ref() else { unreachable!() };
        memory.set_integration("user_xyz", KIND_MQTT, true, broker_config(1884));

        manager.reconcile().await;
        assert_eq!(manager.loaded_count(), 1);
        let id = IntegrationId {
            kind: KIND_MQTT.to_string(),
            user_id: "user_xyz".to_string(),
        };
        assert_eq!(manager.loaded[&id].config["port"], json!(1884));
    }

    #[tokio::test]
    async fn unchanged_config_is_left_alone() {
        let memory = MemoryStore::new();
        memory.set_integration("user_xyz", KIND_MQTT, true, broker_config(1883));
        let store = Arc::new(StateStore::Memory(memory));
        let mut manager = new_manager(store);

        manager.reconcile().await;
        manager.reconcile().await;
        assert_eq!(manager.loaded_count(), 1);
    }

    #[tokio::test]
    async fn invalid_config_is_skipped() {
        let memory = MemoryStore::new();
        memory.set_integration("user_xyz", KIND_MQTT, true, json!({"port": "not-a-number"}));
        let store = Arc::new(StateStore::Memory(memory));
        let mut manager = new_manager(store);

        manager.reconcile().await;
        assert_eq!(manager.loaded_count(), 0);
    }
}
