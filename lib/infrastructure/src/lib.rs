mod db;
mod http;
mod monitoring;
mod mqtt;

pub use db::DatabaseConfig;
pub use http::server::HttpServerConfig;
pub use monitoring::MonitoringConfig;
pub use mqtt::{Mqtt, MqttConfig, MqttInMessage, MqttLastWill, MqttPublisher};
