use std::sync::Arc;

use rumqttc::v5::{AsyncClient, mqttbytes::QoS};

/// Publishes to segmented topics under a fixed prefix, the shape the outbound
/// integrations speak: `{prefix}/{serial}/{object_type}[/{field}]`. Segments
/// are validated so a device-supplied field name can never smuggle wildcards
/// or extra levels into the topic.
#[derive(Clone)]
pub struct MqttPublisher {
    client: Arc<AsyncClient>,
    prefix: String,
}

impl MqttPublisher {
    pub(super) fn new(client: Arc<AsyncClient>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub async fn publish(&self, segments: &[&str], payload: impl Into<String>) -> anyhow::Result<()> {
        self.send(segments, payload.into(), false).await
    }

    pub async fn publish_retained(&self, segments: &[&str], payload: impl Into<String>) -> anyhow::Result<()> {
        self.send(segments, payload.into(), true).await
    }

    async fn send(&self, segments: &[&str], payload: String, retain: bool) -> anyhow::Result<()> {
        let topic = self.topic_for(segments)?;
        tracing::trace!("Publishing MQTT message to {topic} (retain={retain})");

        self.client
            .publish(topic.clone(), QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| {
                tracing::error!("Error publishing MQTT message to {}: {}", topic, e);
                e.into()
            })
    }

    fn topic_for(&self, segments: &[&str]) -> anyhow::Result<String> {
        if segments.is_empty() {
            anyhow::bail!("topic needs at least one segment");
        }

        let mut topic = self.prefix.clone();
        for segment in segments {
            if segment.is_empty() || segment.contains(['/', '+', '#']) {
                anyhow::bail!("invalid topic segment {segment:?}");
            }
            if !topic.is_empty() {
                topic.push('/');
            }
            topic.push_str(segment);
        }

        Ok(topic)
    }
}
