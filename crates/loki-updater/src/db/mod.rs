//! Knowledge store access
//!
//! A single SQLite database behind a one-connection pool: the updater is the
//! only writer and every mutating step of a run shares one connection.

pub mod checkpoint;
pub mod mode;
pub mod schema;
pub mod settings;

pub use checkpoint::Checkpoint;
pub use mode::StoreMode;
pub use schema::{PositionColumns, SchemaCatalog, TableSpec};

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    catalog: Arc<SchemaCatalog>,
    read_only: bool,
}

impl Store {
    /// Open (creating if needed) the store and apply the catalog's schema.
    ///
    /// Read-only stores are opened as they are; no DDL is issued.
    #[instrument(skip(config, catalog), fields(path = %config.database_path))]
    pub async fn open(config: &UpdaterConfig, catalog: SchemaCatalog) -> Result<Self> {
        let options = if config.is_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.database_path)
                .create_if_missing(!config.read_only)
        };
        let options = options.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            catalog: Arc::new(catalog),
            read_only: config.read_only,
        };

        if !store.read_only {
            let mut conn = store.acquire().await?;
            store.init_schema(&mut conn, config).await?;
        }

        info!(
            tables = store.catalog.tables().len(),
            read_only = store.read_only,
            "knowledge store opened"
        );
        Ok(store)
    }

    async fn init_schema(&self, conn: &mut SqliteConnection, config: &UpdaterConfig) -> Result<()> {
        for spec in self.catalog.tables() {
            sqlx::query(&spec.ddl).execute(&mut *conn).await?;
            mode::create_indexes(conn, spec).await?;
        }
        settings::default_setting(
            conn,
            settings::SCHEMA_VERSION,
            &settings::CURRENT_SCHEMA_VERSION.to_string(),
        )
        .await?;
        settings::default_setting(conn, settings::FINALIZED, "0").await?;
        settings::default_setting(conn, settings::ZONE_SIZE, &config.zone_size.to_string())
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.acquire().await?;
        settings::get_setting(&mut conn, key).await
    }

    pub async fn is_finalized(&self) -> Result<bool> {
        Ok(settings::is_truthy(
            self.get_setting(settings::FINALIZED).await?.as_deref(),
        ))
    }

    /// Fails with `StoreState` unless the store accepts writes
    pub async fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(UpdateError::StoreState(
                "knowledge store is opened read-only".to_string(),
            ));
        }
        if self.is_finalized().await? {
            return Err(UpdateError::StoreState(
                "knowledge store has been finalized; no further updates are allowed".to_string(),
            ));
        }
        Ok(())
    }

    /// Mark the store finalized. Later refreshes are refused.
    pub async fn finalize(&self) -> Result<()> {
        self.ensure_writable().await?;
        let mut conn = self.acquire().await?;
        settings::set_setting(&mut conn, settings::FINALIZED, "1").await?;
        info!("knowledge store finalized");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
