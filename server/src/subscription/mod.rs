use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use actix_web::web::Bytes;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::core::error::ServiceError;
use crate::core::{ObjectKey, StateObject};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriptionConfig {
    pub max_per_device: usize,
    pub timeout_ms: u64,
}

/// One object the client declared interest in, with its known revision.
#[derive(Debug, Clone)]
pub struct Interest {
    pub key: ObjectKey,
    pub revision: i64,
    pub timestamp: i64,
}

/// Device presence derived from parked long-polls: connected while at least
/// one subscription is parked for the serial.
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    pub serial: String,
    pub connected: bool,
}

struct Parked {
    id: Uuid,
    session: Option<String>,
    interests: Vec<Interest>,
    tx: mpsc::Sender<Bytes>,
    deadline: Instant,
}

impl Parked {
    fn wants(&self, delta: &StateObject) -> bool {
        self.interests
            .iter()
            .any(|i| i.key == delta.key && delta.is_newer_than(i.revision, i.timestamp))
    }
}

/// Chunked response body of a parked subscription. Yields at most one JSON
/// document (the wake-up delta) and ends when the subscription is dropped.
#[derive(Debug)]
pub struct ParkedBody {
    rx: mpsc::Receiver<Bytes>,
}

impl futures::Stream for ParkedBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

/// Holds parked long-poll responses keyed by serial and routes change
/// notifications to them. Notifications for one serial are totally ordered by
/// the table lock; sends are non-blocking.
pub struct SubscriptionManager {
    parked: parking_lot::Mutex<HashMap<String, Vec<Parked>>>,
    config: SubscriptionConfig,
    presence_tx: broadcast::Sender<PresenceEvent>,
}

impl SubscriptionManager {
    pub fn new(config: SubscriptionConfig) -> Self {
        let (presence_tx, _) = broadcast::channel(64);
        Self {
            parked: parking_lot::Mutex::new(HashMap::new()),
            config,
            presence_tx,
        }
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence_tx.subscribe()
    }

    /// Parks a new subscription, enforcing the per-device cap.
    pub fn park(
        &self,
        serial: &str,
        session: Option<String>,
        interests: Vec<Interest>,
    ) -> Result<ParkedBody, ServiceError> {
        let id = Uuid::new_v4();
        {
            let mut parked = self.parked.lock();
            let subs = parked.entry(serial.to_string()).or_default();
            subs.retain(|s| !s.tx.is_closed());

            if subs.len() >= self.config.max_per_device {
                return Err(ServiceError::RateLimited);
            }

            let was_idle = subs.is_empty();

            let (tx, rx) = mpsc::channel(4);
            subs.push(Parked {
                id,
                session,
                interests,
                tx,
                deadline: Instant::now() + Duration::from_millis(self.config.timeout_ms),
            });

            tracing::debug!("Parked subscription {} for {}", id, serial);

            if was_idle {
                let _ = self.presence_tx.send(PresenceEvent {
                    serial: serial.to_string(),
                    connected: true,
                });
            }

            Ok(ParkedBody { rx })
        }
    }

    pub fn notify(&self, serial: &str, delta: &StateObject) -> (usize, usize) {
        self.notify_all(serial, std::slice::from_ref(delta))
    }

    /// Wakes every subscription whose declared interests are now outdated by
    /// at least one delta. Returns `(notified, removed)`.
    pub fn notify_all(&self, serial: &str, deltas: &[StateObject]) -> (usize, usize) {
        if deltas.is_empty() {
            return (0, 0);
        }

        let mut notified = 0;
        let mut removed = 0;
        let mut went_idle = false;

        {
            let mut parked = self.parked.lock();
            let Some(subs) = parked.get_mut(serial) else {
                return (0, 0);
            };

            subs.retain(|sub| {
                if sub.tx.is_closed() {
                    removed += 1;
                    return false;
                }

                let relevant: Vec<&StateObject> = deltas.iter().filter(|d| sub.wants(d)).collect();
                if relevant.is_empty() {
                    return true;
                }

                removed += 1;
                match sub.tx.try_send(delta_document(&relevant)) {
                    Ok(()) => {
                        notified += 1;
                        tracing::debug!("Woke subscription {} for {} with {} objects", sub.id, serial, relevant.len());
                    }
                    Err(e) => {
                        tracing::debug!("Subscriber {} for {} gone before wake: {}", sub.id, serial, e);
                    }
                }
                false
            });

            if subs.is_empty() {
                parked.remove(serial);
                went_idle = true;
            }
        }

        if went_idle {
            let _ = self.presence_tx.send(PresenceEvent {
                serial: serial.to_string(),
                connected: false,
            });
        }

        (notified, removed)
    }

    /// Expires subscriptions past their deadline, closing them with an empty
    /// body. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut idle_serials = vec![];

        {
            let mut parked = self.parked.lock();
            parked.retain(|serial, subs| {
                subs.retain(|sub| {
                    let keep = now < sub.deadline && !sub.tx.is_closed();
                    if !keep {
                        removed += 1;
                        tracing::debug!("Expiring subscription {} for {}", sub.id, serial);
                    }
                    keep
                });
                if subs.is_empty() {
                    idle_serials.push(serial.clone());
                    return false;
                }
                true
            });
        }

        for serial in idle_serials {
            let _ = self.presence_tx.send(PresenceEvent { serial, connected: false });
        }

        removed
    }

    pub async fn run_sweeper(&self) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = self.sweep();
            if removed > 0 {
                tracing::debug!("Sweeper expired {} subscriptions", removed);
            }
        }
    }

    /// Drains every parked subscription with an empty result and waits a
    /// bounded grace period for transports to observe the close.
    pub async fn shutdown(&self) {
        let drained: Vec<String> = {
            let mut parked = self.parked.lock();
            let serials = parked.keys().cloned().collect();
            parked.clear();
            serials
        };

        for serial in drained {
            let _ = self.presence_tx.send(PresenceEvent { serial, connected: false });
        }

        tokio::time::sleep(SHUTDOWN_GRACE).await;
    }

    pub fn parked_total(&self) -> usize {
        self.parked.lock().values().map(Vec::len).sum()
    }

    pub fn parked_for(&self, serial: &str) -> usize {
        self.parked.lock().get(serial).map(Vec::len).unwrap_or(0)
    }

    pub fn sessions_for(&self, serial: &str) -> Vec<String> {
        self.parked
            .lock()
            .get(serial)
            .map(|subs| {
                subs.iter()
                    .map(|s| s.session.clone().unwrap_or_else(|| s.id.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The single JSON document a woken subscriber receives.
fn delta_document(objects: &[&StateObject]) -> Bytes {
    let objects: Vec<serde_json::Value> = objects
        .iter()
        .map(|o| {
            json!({
                "object_key": o.key.as_str(),
                "object_revision": o.revision,
                "object_timestamp": o.timestamp,
                "value": o.value,
            })
        })
        .collect();

    Bytes::from(json!({ "objects": objects }).to_string())
}
