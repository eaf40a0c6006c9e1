use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use support::time::now_ms;

use crate::core::error::ServiceError;
use crate::core::{ObjectKey, StateObject, strip_user_prefix};
use crate::state::{DeviceStateService, MergeOptions};
use crate::store::StateStore;
use crate::subscription::SubscriptionManager;

#[derive(Debug, Deserialize, Clone)]
pub struct WeatherSettings {
    pub upstream_url: String,
    pub cache_ttl_ms: i64,
    pub fetch_timeout_ms: u64,
}

/// Upstream weather feed. The HTTP variant proxies the reverse-engineered
/// provider; the stub backs tests.
pub enum WeatherProvider {
    Http(HttpWeatherProvider),
    #[cfg(test)]
    Stub(StubWeatherProvider),
}

impl WeatherProvider {
    async fn fetch(&self, query: &str) -> anyhow::Result<Value> {
        match self {
            WeatherProvider::Http(p) => p.fetch(query).await,
            #[cfg(test)]
            WeatherProvider::Stub(p) => p.fetch(query),
        }
    }
}

pub struct HttpWeatherProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWeatherProvider {
    pub fn new(settings: &WeatherSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.fetch_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.upstream_url.clone(),
        })
    }

    async fn fetch(&self, query: &str) -> anyhow::Result<Value> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("query", query)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
pub struct StubWeatherProvider {
    pub payload: Value,
    pub fail: std::sync::atomic::AtomicBool,
    pub fetches: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl StubWeatherProvider {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            fail: std::sync::atomic::AtomicBool::new(false),
            fetches: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn fetch(&self, _query: &str) -> anyhow::Result<Value> {
        use std::sync::atomic::Ordering;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("upstream down");
        }
        Ok(self.payload.clone())
    }
}

/// TTL-gated proxy over the upstream feed. Fresh refreshes fan the payload out
/// into the `weather.*` and `user.*` objects of every device in that postal
/// code.
pub struct WeatherService {
    store: Arc<StateStore>,
    state: Arc<DeviceStateService>,
    subs: Arc<SubscriptionManager>,
    provider: WeatherProvider,
    cache_ttl_ms: i64,
}

impl WeatherService {
    pub fn new(
        store: Arc<StateStore>,
        state: Arc<DeviceStateService>,
        subs: Arc<SubscriptionManager>,
        provider: WeatherProvider,
        cache_ttl_ms: i64,
    ) -> Self {
        Self {
            store,
            state,
            subs,
            provider,
            cache_ttl_ms,
        }
    }

    pub async fn lookup(&self, raw_query: &str) -> Result<Value, ServiceError> {
        let query = raw_query.trim();
        if query.is_empty() {
            return Err(ServiceError::BadRequest("empty weather query".to_string()));
        }

        // IP-form queries bypass the cache entirely
        if query.parse::<IpAddr>().is_ok() {
            return self
                .provider
                .fetch(query)
                .await
                .map_err(|e| {
                    tracing::warn!("Weather fetch for {} failed: {}", query, e);
                    ServiceError::UpstreamUnavailable
                });
        }

        let (postal, country) = split_query(query);

        let cached = self.store.get_weather(postal, country).await.unwrap_or_else(|e| {
            tracing::warn!("Weather cache read failed for {}: {}", postal, e);
            None
        });

        if let Some(entry) = &cached
            && now_ms() - entry.fetched_at < self.cache_ttl_ms
        {
            return Ok(entry.payload.clone());
        }

        match self.provider.fetch(query).await {
            Ok(payload) => {
                if let Err(e) = self.store.upsert_weather(postal, country, now_ms(), &payload).await {
                    tracing::warn!("Weather cache write failed for {}: {}", postal, e);
                }
                self.propagate(postal, &payload).await;
                Ok(payload)
            }
            Err(e) => {
                tracing::warn!("Weather fetch for {} failed: {}", query, e);
                match cached {
                    Some(entry) => Ok(entry.payload),
                    None => Err(ServiceError::UpstreamUnavailable),
                }
            }
        }
    }

    /// Refresh triggered by a device reporting a new postal code. The device
    /// gets the current payload even when the cache is still fresh.
    pub async fn refresh_for_postal(&self, postal: &str) {
        match self.lookup(postal).await {
            Ok(payload) => self.propagate(postal, &payload).await,
            Err(e) => tracing::debug!("Weather refresh for {} skipped: {}", postal, e),
        }
    }

    async fn propagate(&self, postal: &str, payload: &Value) {
        let serials = match self.store.list_serials_with_postal(postal).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Postal lookup failed for {}: {}", postal, e);
                return;
            }
        };

        for serial in serials {
            let mut changed: Vec<StateObject> = vec![];

            match self
                .state
                .merge_update(&serial, &ObjectKey::weather(postal), payload, MergeOptions::default())
                .await
            {
                Ok(outcome) if outcome.changed => changed.push(outcome.object),
                Ok(_) => {}
                Err(e) => tracing::warn!("Weather object update failed for {}: {}", serial, e),
            }

            if let Ok(Some(owner)) = self.store.get_device_owner(&serial).await {
                let user_key = ObjectKey::user(strip_user_prefix(&owner.user_id));
                match self
                    .state
                    .merge_update(&serial, &user_key, &json!({"weather": payload}), MergeOptions::default())
                    .await
                {
                    Ok(outcome) if outcome.changed => changed.push(outcome.object),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("User weather update failed for {}: {}", serial, e),
                }
            }

            if !changed.is_empty() {
                self.subs.notify_all(&serial, &changed);
            }
        }
    }
}

fn split_query(query: &str) -> (&str, &str) {
    match query.split_once(',') {
        Some((postal, country)) => (postal.trim(), country.trim()),
        None => (query, "US"),
    }
}
