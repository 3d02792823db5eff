//! Database pool construction and the shared application context handed to
//! every process.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;
use crate::net::Fetcher;

/// A transaction on the shared pool.  All mutating operations take one of
/// these so the caller controls commit/rollback boundaries.
pub type PgTx = sqlx::Transaction<'static, sqlx::Postgres>;

/// Shared context: configuration, database pool, HTTP client.
/// Constructed once in `main` and passed down; there is no global state.
#[derive(Clone)]
pub struct App {
    pub config: Config,
    pub pool: PgPool,
    pub http: Fetcher,
}

impl App {
    pub async fn connect(config: Config, application_name: &str) -> Result<App> {
        // the queue worker concurrency check counts connections by
        // application_name, so workers must hold exactly one
        let max_connections = if application_name == "cfbot_queue_worker" {
            1
        } else {
            5
        };
        Self::connect_with_limit(config, application_name, max_connections).await
    }

    pub async fn connect_with_limit(
        config: Config,
        application_name: &str,
        max_connections: u32,
    ) -> Result<App> {
        let http = Fetcher::new(
            &config.user_agent,
            config.timeout,
            config.slow_fetch_sleep,
        );
        let options: sqlx::postgres::PgConnectOptions = config
            .dsn
            .parse()
            .with_context(|| format!("invalid DSN {:?}", config.dsn))?;
        let options = options.application_name(application_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("failed to connect to database")?;
        Ok(App { config, pool, http })
    }

    /// Apply pending migrations.  Safe to run from every entry point; the
    /// migrator takes its own lock.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run database migrations")?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<PgTx> {
        Ok(self.pool.begin().await?)
    }
}
