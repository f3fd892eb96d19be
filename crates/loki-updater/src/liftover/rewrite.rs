//! Rewriting stored positions onto a new build
//!
//! Rows are walked in rowid batches. Mapped rows are updated in place with
//! `UPDATE OR REPLACE`; rows no chain can carry are deleted.

use super::engine::{LiftOver, LiftTally, Lifted, Region};
use super::index::ChainIndex;
use crate::db::TableSpec;
use crate::error::Result;
use sqlx::{Row, SqliteConnection};
use std::sync::Arc;
use tracing::debug;

pub async fn lift_table(
    conn: &mut SqliteConnection,
    index: &Arc<ChainIndex>,
    spec: &TableSpec,
    source_id: i64,
    min_coverage: f64,
    batch_size: i64,
) -> Result<LiftTally> {
    let (Some(pos), Some(source_column)) = (&spec.positions, &spec.source_column) else {
        return Ok(LiftTally::default());
    };
    let table = &spec.name;
    let end_column = pos.end.as_deref().unwrap_or(&pos.start);

    let select = format!(
        "SELECT rowid AS rid, {chr} AS chr, {start} AS pos_start, {end_column} AS pos_end \
         FROM {table} WHERE {source_column} = ? AND rowid > ? ORDER BY rowid LIMIT ?",
        chr = pos.chr,
        start = pos.start,
    );
    let update = match &pos.end {
        Some(end) => format!(
            "UPDATE OR REPLACE {table} SET {chr} = ?, {start} = ?, {end} = ? WHERE rowid = ?",
            chr = pos.chr,
            start = pos.start,
        ),
        None => format!(
            "UPDATE OR REPLACE {table} SET {chr} = ?, {start} = ? WHERE rowid = ?",
            chr = pos.chr,
            start = pos.start,
        ),
    };
    let delete = format!("DELETE FROM {table} WHERE rowid = ?");

    let mut tally = LiftTally::default();
    let mut last_rowid = 0i64;
    loop {
        let rows = sqlx::query(&select)
            .bind(source_id)
            .bind(last_rowid)
            .bind(batch_size)
            .fetch_all(&mut *conn)
            .await?;
        let Some(last) = rows.last() else { break };
        last_rowid = last.get("rid");

        let regions: Vec<Region<i64>> = rows
            .iter()
            .map(|r| {
                let rowid: i64 = r.get("rid");
                Region::new(
                    rowid.to_string(),
                    r.get::<String, _>("chr"),
                    r.get("pos_start"),
                    r.get("pos_end"),
                    rowid,
                )
            })
            .collect();

        let mut lift = LiftOver::new(Arc::clone(index), regions.into_iter(), min_coverage);
        for lifted in lift.by_ref() {
            match lifted {
                Lifted::Mapped(region) => {
                    let query = sqlx::query(&update).bind(region.chr).bind(region.start);
                    let query = if pos.end.is_some() {
                        query.bind(region.end)
                    } else {
                        query
                    };
                    query.bind(region.payload).execute(&mut *conn).await?;
                },
                Lifted::Unmapped(region) => {
                    sqlx::query(&delete)
                        .bind(region.payload)
                        .execute(&mut *conn)
                        .await?;
                },
            }
        }
        tally.add(lift.tally());
    }

    debug!(
        table = %table,
        source_id,
        mapped = tally.mapped,
        unmapped = tally.unmapped,
        "table lifted"
    );
    Ok(tally)
}
