use std::sync::Arc;
use std::time::Instant;

use infrastructure::DatabaseConfig;

use crate::integration::IntegrationManager;
use crate::pairing::PairingService;
use crate::settings::Settings;
use crate::state::DeviceStateService;
use crate::store::{MemoryStore, PostgresStore, SqliteStore, StateStore};
use crate::subscription::SubscriptionManager;
use crate::weather::{HttpWeatherProvider, WeatherProvider, WeatherService};

mod control;
mod core;
mod integration;
mod pairing;
mod rules;
mod settings;
mod state;
mod store;
mod subscription;
mod transport;
mod weather;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let settings = Settings::new().expect("Error reading configuration");
    settings.monitoring.init().expect("Error initializing logging");

    let store = Arc::new(
        new_store(&settings.database)
            .await
            .expect("Error initializing state store"),
    );
    store.migrate().await.expect("Error preparing state store schema");

    if let Some(raw_key) = &settings.control.bootstrap_api_key {
        let user = settings
            .control
            .bootstrap_user
            .clone()
            .unwrap_or_else(|| "user_admin".to_string());
        store
            .insert_api_key(raw_key, &user, "bootstrap", &[], &[])
            .await
            .expect("Error installing bootstrap API key");
    }

    let (state, persistence) = DeviceStateService::new(store.clone());
    let subs = Arc::new(SubscriptionManager::new(settings.transport.subscriptions.clone()));
    let pairing = Arc::new(PairingService::new(
        store.clone(),
        state.clone(),
        settings.pairing.entry_key_ttl_seconds,
    ));

    let weather_provider =
        WeatherProvider::Http(HttpWeatherProvider::new(&settings.weather).expect("Error building weather client"));
    let weather = Arc::new(WeatherService::new(
        store.clone(),
        state.clone(),
        subs.clone(),
        weather_provider,
        settings.weather.cache_ttl_ms,
    ));

    let integrations = IntegrationManager::new(store.clone(), state.clone(), subs.clone());

    let persistence_task = tokio::spawn(persistence.run());

    let transport_exec = {
        let ctx = transport::TransportState {
            state: state.clone(),
            subs: subs.clone(),
            pairing: pairing.clone(),
            weather: weather.clone(),
            store: store.clone(),
            settings: settings.transport.clone(),
        };
        let server = settings.transport.server.clone();
        async move {
            server
                .run_server(move || vec![transport::new_routes(ctx.clone())])
                .await
                .expect("Device transport server failed");
        }
    };

    let control_exec = {
        let ctx = control::ControlState {
            state: state.clone(),
            subs: subs.clone(),
            store: store.clone(),
            pairing: pairing.clone(),
            started_at: Instant::now(),
        };
        let server = settings.control.server.clone();
        async move {
            server
                .run_server(move || vec![control::new_routes(ctx.clone())])
                .await
                .expect("Control server failed");
        }
    };

    tracing::info!(
        "Serving devices on port {} and the control API on port {}",
        settings.transport.server.port,
        settings.control.server.port
    );

    tokio::select!(
        _ = transport_exec => {},
        _ = control_exec => {},
        _ = subs.run_sweeper() => {},
        _ = integrations.run() => {},
        _ = pairing.run_gc() => {},
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        },
    );

    // drain parked long-polls, then let queued persistence land
    subs.shutdown().await;
    state.flush().await;
    persistence_task.abort();
}

async fn new_store(config: &DatabaseConfig) -> anyhow::Result<StateStore> {
    Ok(match config {
        DatabaseConfig::Postgres { url } => {
            StateStore::Postgres(PostgresStore::new(DatabaseConfig::new_pg_pool(url).await?))
        }
        DatabaseConfig::Sqlite { path } => {
            StateStore::Sqlite(SqliteStore::new(DatabaseConfig::new_sqlite_pool(path).await?))
        }
        DatabaseConfig::Memory => StateStore::Memory(MemoryStore::new()),
    })
}
