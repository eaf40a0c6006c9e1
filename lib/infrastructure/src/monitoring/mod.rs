use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub debug: bool,
}

impl MonitoringConfig {
    pub fn init(&self) -> anyhow::Result<()> {
        let default_directives = if self.debug { "debug" } else { "info" };

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives));

        tracing_subscriber::fmt().with_env_filter(filter).init();

        Ok(())
    }
}
