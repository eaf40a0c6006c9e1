use anyhow::Context as _;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum DatabaseConfig {
    Postgres { url: String },
    Sqlite { path: String },
    /// No durable store; state lives for the lifetime of the process.
    Memory,
}

impl DatabaseConfig {
    pub async fn new_pg_pool(url: &str) -> anyhow::Result<sqlx::PgPool> {
        sqlx::postgres::PgPoolOptions::new()
            .min_connections(2)
            .max_connections(8)
            .connect(url)
            .await
            .with_context(|| format!("Error connecting to database {url}"))
    }

    pub async fn new_sqlite_pool(path: &str) -> anyhow::Result<sqlx::SqlitePool> {
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Error opening database file {path}"))
    }
}
