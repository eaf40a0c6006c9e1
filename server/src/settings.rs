use config::{Config, ConfigError, Environment, File};
use infrastructure::{DatabaseConfig, HttpServerConfig, MonitoringConfig};
use serde::Deserialize;

use crate::subscription::SubscriptionConfig;
use crate::weather::WeatherSettings;

/// Full configuration surface: optional `config.toml` overlaid by `RENEST_*`
/// environment variables (`__` separates nesting, e.g.
/// `RENEST_TRANSPORT__SERVER__PORT`).
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub monitoring: MonitoringConfig,
    pub database: DatabaseConfig,
    pub transport: TransportSettings,
    pub control: ControlSettings,
    pub weather: WeatherSettings,
    pub pairing: PairingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportSettings {
    pub server: HttpServerConfig,
    /// Public base URL devices should be pointed at by the entry document.
    pub external_url: String,
    pub upload_dir: String,
    pub tier_name: String,
    pub subscriptions: SubscriptionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlSettings {
    pub server: HttpServerConfig,
    /// Installed at startup so the dashboard can talk to a fresh deployment.
    #[serde(default)]
    pub bootstrap_api_key: Option<String>,
    #[serde(default)]
    pub bootstrap_user: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PairingSettings {
    pub entry_key_ttl_seconds: u64,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("monitoring.debug", false)?
            .set_default("database.backend", "sqlite")?
            .set_default("database.path", "renest.db")?
            .set_default("transport.server.host", "0.0.0.0")?
            .set_default("transport.server.port", 3000_i64)?
            .set_default("transport.external_url", "http://localhost:3000/nest")?
            .set_default("transport.upload_dir", "uploads")?
            .set_default("transport.tier_name", "production")?
            .set_default("transport.subscriptions.max_per_device", 6_i64)?
            .set_default("transport.subscriptions.timeout_ms", 300_000_i64)?
            .set_default("control.server.host", "127.0.0.1")?
            .set_default("control.server.port", 3001_i64)?
            .set_default("control.server.permissive_cors", true)?
            .set_default("weather.upstream_url", "https://weather.renest.example/v1")?
            .set_default("weather.cache_ttl_ms", 1_800_000_i64)?
            .set_default("weather.fetch_timeout_ms", 5_000_i64)?
            .set_default("pairing.entry_key_ttl_seconds", 3_600_i64)?
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::with_prefix("RENEST").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_a_complete_configuration() {
        let settings = Settings::new().unwrap();

        assert_eq!(settings.transport.server.port, 3000);
        assert_eq!(settings.control.server.port, 3001);
        assert!(matches!(settings.database, DatabaseConfig::Sqlite { .. }));
        assert_eq!(settings.transport.subscriptions.max_per_device, 6);
        assert_eq!(settings.transport.subscriptions.timeout_ms, 300_000);
        assert!(settings.control.bootstrap_api_key.is_none());
    }
}
