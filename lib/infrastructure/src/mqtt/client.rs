use std::sync::Arc;
use std::time::Duration;

use rumqttc::v5::{
    AsyncClient, Event::Incoming, EventLoop, MqttOptions,
    mqttbytes::{
        QoS,
        v5::{ConnectProperties, LastWill, Packet},
    },
};
use tokio::sync::mpsc;

use super::{MqttConfig, MqttInMessage, MqttPublisher};

const ROUTE_CHANNEL_CAPACITY: usize = 32;

/// MQTT connection owning the rumqttc event loop. Inbound publishes are
/// routed to subscribers by matching the topic against each subscribed
/// filter, so a consumer holding several wildcard filters gets one channel
/// for all of them.
pub struct Mqtt {
    client: Arc<AsyncClient>,
    event_loop: EventLoop,
    routes: Vec<Route>,
    connected_txs: Vec<mpsc::Sender<()>>,
}

struct Route {
    filter: TopicFilter,
    tx: mpsc::Sender<MqttInMessage>,
}

impl Mqtt {
    pub fn connect(config: &MqttConfig) -> Self {
        let mut mqttoptions = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        mqttoptions.set_clean_start(false);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttoptions.set_credentials(user, pass);
        }

        if let Some(will) = &config.last_will {
            mqttoptions.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                QoS::AtLeastOnce,
                will.retain,
                None,
            ));
        }

        let mut connect_props = ConnectProperties::new();
        connect_props.session_expiry_interval = 60.into();
        connect_props.max_packet_size = Some(1024 * 1024);
        mqttoptions.set_connect_properties(connect_props);

        let (client, event_loop) = AsyncClient::new(mqttoptions, 10);

        Mqtt {
            client: Arc::new(client),
            event_loop,
            routes: vec![],
            connected_txs: vec![],
        }
    }

    /// Subscribes to a set of topic filters and returns the channel their
    /// messages arrive on.
    pub async fn subscribe_all(&mut self, filters: &[String]) -> anyhow::Result<mpsc::Receiver<MqttInMessage>> {
        let (tx, rx) = mpsc::channel(ROUTE_CHANNEL_CAPACITY);

        for raw in filters {
            let filter = TopicFilter::parse(raw)?;
            tracing::info!("Subscribing to topic filter {:?}", raw);

            self.client.subscribe(raw, QoS::AtLeastOnce).await?;
            self.routes.push(Route {
                filter,
                tx: tx.clone(),
            });
        }

        Ok(rx)
    }

    /// Channel that receives a tick for every broker (re)connection.
    pub fn connection_events(&mut self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(4);
        self.connected_txs.push(tx);
        rx
    }

    pub fn publisher(&self, prefix: impl Into<String>) -> MqttPublisher {
        MqttPublisher::new(self.client.clone(), prefix)
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::warn!("Error disconnecting MQTT client: {}", e);
        }
    }

    pub async fn run(mut self) {
        loop {
            match self.event_loop.poll().await {
                Ok(Incoming(Packet::Publish(publish))) => {
                    self.route_publish(&publish);
                }
                Ok(Incoming(Packet::ConnAck(_))) => {
                    for tx in self.connected_txs.iter() {
                        let _ = tx.try_send(());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("MQTT error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn route_publish(&self, publish: &rumqttc::v5::mqttbytes::v5::Publish) {
        let (Ok(topic), Ok(payload)) = (
            std::str::from_utf8(&publish.topic),
            std::str::from_utf8(&publish.payload),
        ) else {
            tracing::warn!("Dropping MQTT message with non-UTF-8 topic or payload");
            return;
        };

        let mut delivered = false;
        for route in self.routes.iter().filter(|r| r.filter.matches(topic)) {
            delivered = true;
            let message = MqttInMessage {
                topic: topic.to_string(),
                payload: payload.to_string(),
            };
            // subscribers that stop draining lose messages rather than
            // stalling the event loop
            if let Err(e) = route.tx.try_send(message) {
                tracing::warn!("Dropping MQTT message on {}: {}", topic, e);
            }
        }

        if !delivered {
            tracing::trace!("No route for MQTT message on {}", topic);
        }
    }
}

/// MQTT topic filter with `+` (one level) and trailing `#` (all levels).
struct TopicFilter {
    levels: Vec<String>,
}

impl TopicFilter {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        if raw.is_empty() {
            anyhow::bail!("empty topic filter");
        }

        let levels: Vec<String> = raw.split('/').map(str::to_string).collect();
        if let Some(pos) = levels.iter().position(|l| l == "#")
            && pos != levels.len() - 1
        {
            anyhow::bail!("'#' is only valid as the last level of a filter: {raw}");
        }

        Ok(Self { levels })
    }

    fn matches(&self, topic: &str) -> bool {
        let mut topic_levels = topic.split('/');

        for filter_level in &self.levels {
            if filter_level == "#" {
                return true;
            }
            match topic_levels.next() {
                Some(level) if filter_level == "+" || filter_level == level => {}
                _ => return false,
            }
        }

        topic_levels.next().is_none()
    }
}
