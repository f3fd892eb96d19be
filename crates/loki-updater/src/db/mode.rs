//! Store performance modes
//!
//! Bulk loads run with relaxed durability and without secondary indexes on
//! the tables being rewritten; queries need the opposite. Pragmas must be
//! set outside a transaction, index drops and rebuilds may run inside one.

use crate::db::schema::TableSpec;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    Query,
    BulkWrite,
}

impl StoreMode {
    fn pragmas(self) -> &'static [&'static str] {
        match self {
            StoreMode::BulkWrite => &[
                "PRAGMA synchronous = OFF",
                "PRAGMA temp_store = MEMORY",
                "PRAGMA cache_size = -100000",
            ],
            StoreMode::Query => &[
                "PRAGMA synchronous = FULL",
                "PRAGMA temp_store = DEFAULT",
                "PRAGMA cache_size = -2000",
            ],
        }
    }
}

pub async fn apply_mode(conn: &mut SqliteConnection, mode: StoreMode) -> Result<()> {
    for pragma in mode.pragmas() {
        sqlx::query(pragma).execute(&mut *conn).await?;
    }
    debug!(?mode, "store mode applied");
    Ok(())
}

pub async fn drop_indexes(conn: &mut SqliteConnection, spec: &TableSpec) -> Result<()> {
    for columns in &spec.indexes {
        let sql = format!("DROP INDEX IF EXISTS {}", spec.index_name(columns));
        sqlx::query(&sql).execute(&mut *conn).await?;
    }
    debug!(table = %spec.name, count = spec.indexes.len(), "indexes dropped");
    Ok(())
}

pub async fn create_indexes(conn: &mut SqliteConnection, spec: &TableSpec) -> Result<()> {
    for columns in &spec.indexes {
        sqlx::query(&spec.create_index_sql(columns))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}
