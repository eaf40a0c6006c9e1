use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use actix_web::*;
use anyhow::Context as _;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct HttpServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Directory holding `cert.pem` and `key.pem`. When absent, plain HTTP.
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,
    #[serde(default)]
    pub permissive_cors: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl HttpServerConfig {
    pub async fn run_server<F>(&self, scopes: F) -> anyhow::Result<()>
    where
        F: Fn() -> Vec<Scope> + Send + Clone + 'static,
    {
        let permissive_cors = self.permissive_cors;
        let http_server = HttpServer::new(move || {
            let mut app = App::new()
                .wrap(middleware::Condition::new(
                    permissive_cors,
                    actix_cors::Cors::permissive(),
                ))
                .wrap(tracing_actix_web::TracingLogger::default());

            for scope in scopes() {
                app = app.service(scope);
            }

            app
        })
        .workers(2)
        .disable_signals();

        let http_server = match &self.cert_dir {
            Some(dir) => {
                let tls = load_tls_config(dir)
                    .with_context(|| format!("Error loading TLS material from {}", dir.display()))?;
                http_server.bind_rustls_0_23((self.host.as_str(), self.port), tls)?
            }
            None => http_server.bind((self.host.as_str(), self.port))?,
        };

        http_server
            .run()
            .await
            .with_context(|| format!("Error starting HTTP server on port {}", self.port))
    }
}

fn load_tls_config(dir: &Path) -> anyhow::Result<rustls::ServerConfig> {
    let cert_file = File::open(dir.join("cert.pem")).context("cert.pem not readable")?;
    let key_file = File::open(dir.join("key.pem")).context("key.pem not readable")?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("Error parsing cert.pem")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("Error parsing key.pem")?
        .context("key.pem contains no private key")?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Error assembling TLS server config")
}
