//! PhaseRun persistence

use super::types::{PhaseRun, PhaseState, PhaseStatus, RunStatus};
use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

const RUN_COLUMNS: &str = r#"
    run_id, source_id, batch_id, status,
    extract_status, extract_start, extract_end, extract_hash,
    transform_status, transform_start, transform_end, transform_hash,
    load_status, load_start, load_end, load_hash,
    error_message, created_at
"#;

/// Insert the run, or update it if it already has an id
pub async fn save_run(conn: &mut SqliteConnection, run: &mut PhaseRun) -> Result<i64> {
    if let Some(id) = run.id {
        sqlx::query(
            r#"
            UPDATE phase_run SET
                status = ?,
                extract_status = ?, extract_start = ?, extract_end = ?, extract_hash = ?,
                transform_status = ?, transform_start = ?, transform_end = ?, transform_hash = ?,
                load_status = ?, load_start = ?, load_end = ?, load_hash = ?,
                error_message = ?
            WHERE run_id = ?
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.extract.status.as_str())
        .bind(run.extract.started_at)
        .bind(run.extract.ended_at)
        .bind(&run.extract.hash)
        .bind(run.transform.status.as_str())
        .bind(run.transform.started_at)
        .bind(run.transform.ended_at)
        .bind(&run.transform.hash)
        .bind(run.load.status.as_str())
        .bind(run.load.started_at)
        .bind(run.load.ended_at)
        .bind(&run.load.hash)
        .bind(&run.error)
        .bind(id)
        .execute(&mut *conn)
        .await?;
        return Ok(id);
    }

    let result = sqlx::query(
        r#"
        INSERT INTO phase_run (
            source_id, batch_id, status,
            extract_status, extract_start, extract_end, extract_hash,
            transform_status, transform_start, transform_end, transform_hash,
            load_status, load_start, load_end, load_hash,
            error_message, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(run.source_id)
    .bind(run.batch_id.to_string())
    .bind(run.status.as_str())
    .bind(run.extract.status.as_str())
    .bind(run.extract.started_at)
    .bind(run.extract.ended_at)
    .bind(&run.extract.hash)
    .bind(run.transform.status.as_str())
    .bind(run.transform.started_at)
    .bind(run.transform.ended_at)
    .bind(&run.transform.hash)
    .bind(run.load.status.as_str())
    .bind(run.load.started_at)
    .bind(run.load.ended_at)
    .bind(&run.load.hash)
    .bind(&run.error)
    .bind(run.created_at)
    .execute(&mut *conn)
    .await?;

    let id = result.last_insert_rowid();
    run.id = Some(id);
    Ok(id)
}

fn phase_state(row: &SqliteRow, prefix: &str) -> PhaseState {
    PhaseState {
        status: PhaseStatus::from(row.get::<String, _>(format!("{prefix}_status").as_str())),
        started_at: row.get::<Option<DateTime<Utc>>, _>(format!("{prefix}_start").as_str()),
        ended_at: row.get::<Option<DateTime<Utc>>, _>(format!("{prefix}_end").as_str()),
        hash: row.get::<Option<String>, _>(format!("{prefix}_hash").as_str()),
    }
}

fn run_from_row(row: &SqliteRow) -> PhaseRun {
    let batch: String = row.get("batch_id");
    PhaseRun {
        id: Some(row.get("run_id")),
        source_id: row.get("source_id"),
        batch_id: Uuid::parse_str(&batch).unwrap_or_else(|_| Uuid::nil()),
        status: RunStatus::from(row.get::<String, _>("status")),
        extract: phase_state(row, "extract"),
        transform: phase_state(row, "transform"),
        load: phase_state(row, "load"),
        error: row.get("error_message"),
        created_at: row.get("created_at"),
    }
}

/// Most recent attempt for a source
pub async fn latest_run(conn: &mut SqliteConnection, source_id: i64) -> Result<Option<PhaseRun>> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM phase_run WHERE source_id = ? ORDER BY run_id DESC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(source_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(run_from_row))
}

/// Extract hash of the last run that completed since the source was last
/// purged, the reference for change detection
pub async fn last_completed_extract_hash(
    conn: &mut SqliteConnection,
    source_id: i64,
) -> Result<Option<String>> {
    let hash: Option<Option<String>> = sqlx::query_scalar(
        r#"
        SELECT extract_hash FROM phase_run
        WHERE source_id = ? AND status = 'completed'
          AND run_id > COALESCE((SELECT purge_mark FROM source WHERE source_id = ?), 0)
        ORDER BY run_id DESC
        LIMIT 1
        "#,
    )
    .bind(source_id)
    .bind(source_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(hash.flatten())
}
