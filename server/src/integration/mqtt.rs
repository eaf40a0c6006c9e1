use std::collections::HashSet;
use std::sync::Arc;

use infrastructure::{Mqtt, MqttConfig, MqttInMessage, MqttLastWill, MqttPublisher};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::control::clamp_temperature;
use crate::core::{ObjectKey, ObjectKind, StateChange};
use crate::state::{DeviceStateService, MergeOptions};
use crate::store::StateStore;
use crate::subscription::SubscriptionManager;

const AVAILABILITY_TOPIC: &str = "status";

#[derive(Debug, Deserialize, Clone)]
pub struct MqttIntegrationConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

fn default_prefix() -> String {
    "renest".to_string()
}

/// Message-broker integration: publishes object changes as raw and normalized
/// topics, consumes command topics, and maintains an availability topic with
/// an `offline` last will.
pub struct MqttIntegration {
    user_id: String,
    config: MqttIntegrationConfig,
    state: Arc<DeviceStateService>,
    subs: Arc<SubscriptionManager>,
    store: Arc<StateStore>,
    allowed: HashSet<String>,
    publisher: Option<MqttPublisher>,
    task: Option<JoinHandle<()>>,
}

impl MqttIntegration {
    pub fn new(
        user_id: String,
        config: MqttIntegrationConfig,
        state: Arc<DeviceStateService>,
        subs: Arc<SubscriptionManager>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            user_id,
            config,
            state,
            subs,
            store,
            allowed: HashSet::new(),
            publisher: None,
            task: None,
        }
    }

    pub async fn initialize(&mut self) -> anyhow::Result<()> {
        let owned = self.store.list_user_devices(&self.user_id).await?;
        let shared = self.store.get_shared_with_me(&self.user_id).await?;
        self.allowed = owned.into_iter().chain(shared).collect();

        let prefix = self.config.prefix.trim_matches('/').to_string();
        let mqtt_config = MqttConfig {
            host: self.config.host.clone(),
            port: self.config.port,
            client_id: self
                .config
                .client_id
                .clone()
                .unwrap_or_else(|| format!("renest-{}", crate::core::strip_user_prefix(&self.user_id))),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            last_will: Some(MqttLastWill {
                topic: format!("{prefix}/{AVAILABILITY_TOPIC}"),
                payload: "offline".to_string(),
                retain: true,
            }),
        };

        let mut mqtt = Mqtt::connect(&mqtt_config);
        let commands = mqtt
            .subscribe_all(&[format!("{prefix}/+/+/set"), format!("{prefix}/+/ha/+/set")])
            .await?;
        let connected = mqtt.connection_events();
        let publisher = mqtt.publisher(prefix.clone());
        self.publisher = Some(publisher.clone());

        let pump = CommandPump {
            state: self.state.clone(),
            subs: self.subs.clone(),
            allowed: self.allowed.clone(),
            prefix,
            publisher,
        };

        self.task = Some(tokio::spawn(async move {
            tokio::select! {
                _ = mqtt.run() => {},
                _ = pump.run(commands, connected) => {},
            }
        }));

        tracing::info!("MQTT integration for {} initialized ({} devices)", self.user_id, self.allowed.len());

        Ok(())
    }

    pub async fn on_state_change(&self, change: &StateChange) -> anyhow::Result<()> {
        if !self.allowed.contains(&change.serial) {
            return Ok(());
        }
        let Some(publisher) = &self.publisher else {
            anyhow::bail!("integration not initialized");
        };

        let object_type = change.key.type_name();

        publisher
            .publish(&[&change.serial, object_type], change.value.to_string())
            .await?;

        if let Some(map) = change.value.as_object() {
            for (field, value) in map {
                // field names come off the wire; a bad one skips its topic
                // without aborting the rest of the fan-out
                if let Err(e) = publisher
                    .publish(&[&change.serial, object_type, field], scalar_payload(value))
                    .await
                {
                    tracing::warn!("Skipping field topic for {}/{}: {}", change.serial, field, e);
                }
            }
        }

        if matches!(change.key.kind(), ObjectKind::Device | ObjectKind::Shared) {
            let device = self
                .state
                .get(&change.serial, &ObjectKey::device(&change.serial))
                .await
                .ok()
                .flatten();
            let shared = self
                .state
                .get(&change.serial, &ObjectKey::shared(&change.serial))
                .await
                .ok()
                .flatten();

            let payload = climate_payload(device.as_ref().map(|o| &o.value), shared.as_ref().map(|o| &o.value));
            publisher
                .publish(&[&change.serial, "ha", "climate"], payload.to_string())
                .await?;
        }

        Ok(())
    }

    pub async fn on_device_connected(&self, serial: &str) -> anyhow::Result<()> {
        self.publish_device_availability(serial, "online").await
    }

    pub async fn on_device_disconnected(&self, serial: &str) -> anyhow::Result<()> {
        self.publish_device_availability(serial, "offline").await
    }

    async fn publish_device_availability(&self, serial: &str, payload: &str) -> anyhow::Result<()> {
        if !self.allowed.contains(serial) {
            return Ok(());
        }
        let Some(publisher) = &self.publisher else {
            anyhow::bail!("integration not initialized");
        };
        publisher.publish_retained(&[serial, "availability"], payload).await
    }

    #[cfg(test)]
    pub(crate) fn allowed_serials(&self) -> &HashSet<String> {
        &self.allowed
    }

    pub async fn shutdown(&mut self) {
        if let Some(publisher) = &self.publisher {
            let _ = publisher.publish_retained(&[AVAILABILITY_TOPIC], "offline").await;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.publisher = None;
        tracing::info!("MQTT integration for {} shut down", self.user_id);
    }
}

/// Consumes inbound command topics and the broker connection events.
struct CommandPump {
    state: Arc<DeviceStateService>,
    subs: Arc<SubscriptionManager>,
    allowed: HashSet<String>,
    prefix: String,
    publisher: MqttPublisher,
}

impl CommandPump {
    async fn run(self, mut commands: mpsc::Receiver<MqttInMessage>, mut connected: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                Some(()) = connected.recv() => {
                    if let Err(e) = self.publisher.publish_retained(&[AVAILABILITY_TOPIC], "online").await {
                        tracing::warn!("Error publishing availability: {}", e);
                    }
                }
                msg = commands.recv() => match msg {
                    Some(msg) => self.handle_command(&msg).await,
                    None => return,
                },
            }
        }
    }

    async fn handle_command(&self, msg: &MqttInMessage) {
        let Some(target) = parse_command_topic(&self.prefix, &msg.topic) else {
            tracing::debug!("Ignoring non-command topic {}", msg.topic);
            return;
        };

        let serial = target.serial();
        if !self.allowed.contains(serial) {
            tracing::warn!("Rejecting MQTT command for unauthorized serial {}", serial);
            return;
        }

        let payload: Value = match serde_json::from_str(&msg.payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Unparseable MQTT command payload on {}: {}", msg.topic, e);
                return;
            }
        };

        let (key, fields) = match &target {
            CommandTopic::Capability { serial, capability } => match capability.as_str() {
                "climate" => (ObjectKey::shared(serial), climate_command_fields(&payload)),
                "away" => (ObjectKey::device(serial), away_command_fields(&payload)),
                other => {
                    tracing::debug!("Unsupported capability {} on {}", other, msg.topic);
                    return;
                }
            },
            CommandTopic::Object { serial, object_type } => {
                let Some(map) = payload.as_object() else {
                    tracing::warn!("Object command payload on {} is not a mapping", msg.topic);
                    return;
                };
                (
                    ObjectKey::new(format!("{object_type}.{serial}")),
                    Value::Object(map.clone()),
                )
            }
        };

        match self.state.merge_update(serial, &key, &fields, MergeOptions::default()).await {
            Ok(outcome) if outcome.changed => {
                self.subs.notify(serial, &outcome.object);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("MQTT command write to {} failed: {}", key, e);
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum CommandTopic {
    Capability { serial: String, capability: String },
    Object { serial: String, object_type: String },
}

impl CommandTopic {
    fn serial(&self) -> &str {
        match self {
            CommandTopic::Capability { serial, .. } | CommandTopic::Object { serial, .. } => serial,
        }
    }
}

fn parse_command_topic(prefix: &str, topic: &str) -> Option<CommandTopic> {
    let rel = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let parts: Vec<&str> = rel.split('/').collect();

    match parts.as_slice() {
        [serial, "ha", capability, "set"] => Some(CommandTopic::Capability {
            serial: (*serial).to_string(),
            capability: (*capability).to_string(),
        }),
        [serial, object_type, "set"] if *object_type != "ha" => Some(CommandTopic::Object {
            serial: (*serial).to_string(),
            object_type: (*object_type).to_string(),
        }),
        _ => None,
    }
}

/// Discovery-shape payload assembled from the device and shared objects.
fn climate_payload(device: Option<&Value>, shared: Option<&Value>) -> Value {
    let mut out = serde_json::Map::new();

    if let Some(shared) = shared.and_then(Value::as_object) {
        for field in ["current_temperature", "target_temperature", "target_temperature_type"] {
            if let Some(v) = shared.get(field) {
                let name = if field == "target_temperature_type" { "mode" } else { field };
                out.insert(name.to_string(), v.clone());
            }
        }
    }
    if let Some(device) = device.and_then(Value::as_object) {
        for field in ["away", "current_humidity", "fan_mode", "postal_code"] {
            if let Some(v) = device.get(field) {
                out.insert(field.to_string(), v.clone());
            }
        }
    }

    Value::Object(out)
}

fn climate_command_fields(payload: &Value) -> Value {
    let mut fields = serde_json::Map::new();

    if let Some(t) = payload.get("target_temperature").and_then(Value::as_f64) {
        fields.insert("target_temperature".to_string(), json!(clamp_temperature(t)));
    }
    if let Some(mode) = payload.get("mode").and_then(Value::as_str) {
        fields.insert("target_temperature_type".to_string(), json!(mode));
    }

    Value::Object(fields)
}

fn away_command_fields(payload: &Value) -> Value {
    let away = match payload {
        Value::Bool(b) => *b,
        Value::Object(map) => map.get("away").and_then(Value::as_bool).unwrap_or(false),
        _ => false,
    };
    json!({"away": away, "auto_away": if away { 1 } else { 0 }})
}

fn scalar_payload(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
