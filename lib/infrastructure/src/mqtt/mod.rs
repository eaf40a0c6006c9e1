mod client;
mod publisher;

pub use client::Mqtt;
pub use publisher::MqttPublisher;

use serde::Deserialize;

/// Decoded inbound publish, delivered on the channel `Mqtt::subscribe_all`
/// hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttInMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(skip)]
    pub last_will: Option<MqttLastWill>,
}

#[derive(Debug, Clone)]
pub struct MqttLastWill {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl MqttConfig {
    pub fn new_client(&self) -> Mqtt {
        Mqtt::connect(self)
    }
}
