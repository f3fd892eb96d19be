//! Deferred consistency fix-ups
//!
//! Derived tables that depend on loaded data are rebuilt once per run,
//! after every source and the liftover pass have finished, and only when a
//! table they depend on was written.

use crate::config::DEFAULT_ZONE_SIZE;
use crate::db::settings::{self, ZONE_SIZE};
use crate::error::{Result, UpdateError};
use async_trait::async_trait;
use sqlx::SqliteConnection;
use tracing::info;

#[async_trait]
pub trait FixUp: Send + Sync {
    fn name(&self) -> &str;

    /// Tables whose update makes this fix-up run
    fn triggers(&self) -> Vec<&str>;

    /// Rebuild on the run's connection; returns rows written
    async fn apply(&self, conn: &mut SqliteConnection) -> Result<u64>;
}

/// Region → zone coverage: every `zone_size` window of a chromosome that an
/// entity's region touches gets one `(entity, chr, zone)` row.
#[derive(Debug, Clone)]
pub struct ZoneFixUp {
    region_table: String,
    zone_table: String,
    entity_column: String,
    chr_column: String,
    start_column: String,
    end_column: String,
}

impl ZoneFixUp {
    pub fn new(region_table: &str, zone_table: &str) -> Self {
        Self {
            region_table: region_table.to_string(),
            zone_table: zone_table.to_string(),
            entity_column: "biopolymer_id".to_string(),
            chr_column: "chr".to_string(),
            start_column: "pos_start".to_string(),
            end_column: "pos_end".to_string(),
        }
    }

    pub fn entity_column(mut self, column: &str) -> Self {
        self.entity_column = column.to_string();
        self
    }

    pub fn columns(mut self, chr: &str, start: &str, end: &str) -> Self {
        self.chr_column = chr.to_string();
        self.start_column = start.to_string();
        self.end_column = end.to_string();
        self
    }
}

#[async_trait]
impl FixUp for ZoneFixUp {
    fn name(&self) -> &str {
        "zones"
    }

    fn triggers(&self) -> Vec<&str> {
        vec![self.region_table.as_str()]
    }

    async fn apply(&self, conn: &mut SqliteConnection) -> Result<u64> {
        let zone_size = settings::get_setting_i64(conn, ZONE_SIZE)
            .await?
            .unwrap_or(DEFAULT_ZONE_SIZE);
        if zone_size <= 0 {
            return Err(UpdateError::Consistency(format!(
                "invalid zone size {zone_size}"
            )));
        }

        sqlx::query(&format!("DELETE FROM {}", self.zone_table))
            .execute(&mut *conn)
            .await?;

        let sql = format!(
            r#"
            WITH RECURSIVE z(entity, chr, zone, last_zone) AS (
                SELECT {entity}, {chr}, MIN({start}, {end}) / ?, MAX({start}, {end}) / ?
                FROM {region}
                UNION ALL
                SELECT entity, chr, zone + 1, last_zone FROM z WHERE zone < last_zone
            )
            INSERT OR IGNORE INTO {zones} ({entity}, {chr}, zone)
            SELECT entity, chr, zone FROM z
            "#,
            entity = self.entity_column,
            chr = self.chr_column,
            start = self.start_column,
            end = self.end_column,
            region = self.region_table,
            zones = self.zone_table,
        );
        let written = sqlx::query(&sql)
            .bind(zone_size)
            .bind(zone_size)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        info!(table = %self.zone_table, rows = written, zone_size, "zones rebuilt");
        Ok(written)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::UpdaterConfig;
    use crate::db::{SchemaCatalog, Store, TableSpec};

    #[tokio::test]
    async fn test_zones_cover_every_window_once() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SchemaCatalog::core()
            .with_table(TableSpec::new(
                "region",
                "CREATE TABLE IF NOT EXISTS region (biopolymer_id INTEGER, chr TEXT, pos_start INTEGER, pos_end INTEGER)",
            ))
            .unwrap()
            .with_table(TableSpec::new(
                "region_zone",
                "CREATE TABLE IF NOT EXISTS region_zone (biopolymer_id INTEGER, chr TEXT, zone INTEGER, PRIMARY KEY (biopolymer_id, chr, zone))",
            ))
            .unwrap();
        let store = Store::open(&UpdaterConfig::in_memory(dir.path()), catalog)
            .await
            .unwrap();
        let mut conn = store.acquire().await.unwrap();

        sqlx::query(
            "INSERT INTO region VALUES (1, 'chr1', 50000, 250000), (1, 'chr1', 60000, 70000), (2, 'chr2', 99999, 99999)",
        )
        .execute(&mut *conn)
        .await
        .unwrap();

        let written = ZoneFixUp::new("region", "region_zone")
            .apply(&mut conn)
            .await
            .unwrap();
        assert_eq!(written, 4);

        let zones: Vec<(i64, i64)> =
            sqlx::query_as("SELECT biopolymer_id, zone FROM region_zone ORDER BY biopolymer_id, zone")
                .fetch_all(&mut *conn)
                .await
                .unwrap();
        assert_eq!(zones, vec![(1, 0), (1, 1), (1, 2), (2, 0)]);
    }
}
