//! Source registry persistence
//!
//! The only module that writes a source's build pointers.

use super::types::{DeclaredBuild, SourceOptions, SourceRecord, SourceWarning};
use crate::error::{Result, UpdateError};
use crate::phase::RunStatus;
use chrono::Utc;
use loki_common::FileFingerprint;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

const SOURCE_COLUMNS: &str = r#"
    source_id, source, display_name, active, version, grch, ucschg,
    current_build, target_build, last_status, last_updated
"#;

fn source_from_row(row: &SqliteRow) -> SourceRecord {
    SourceRecord {
        id: row.get("source_id"),
        name: row.get("source"),
        display_name: row.get("display_name"),
        active: row.get::<i64, _>("active") != 0,
        version: row.get("version"),
        grch: row.get("grch"),
        ucschg: row.get("ucschg"),
        current_build: row.get("current_build"),
        target_build: row.get("target_build"),
        last_status: RunStatus::from(row.get::<String, _>("last_status")),
        last_updated: row.get("last_updated"),
    }
}

/// Id of the named source, registering it on first discovery
pub async fn ensure_source(
    conn: &mut SqliteConnection,
    name: &str,
    display_name: &str,
) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO source (source, display_name, active, created_at)
        VALUES (?, ?, 1, ?)
        ON CONFLICT(source) DO UPDATE SET display_name = excluded.display_name
        "#,
    )
    .bind(name)
    .bind(display_name)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    let id: i64 = sqlx::query_scalar("SELECT source_id FROM source WHERE source = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

pub async fn find_source(conn: &mut SqliteConnection, name: &str) -> Result<Option<SourceRecord>> {
    let sql = format!("SELECT {SOURCE_COLUMNS} FROM source WHERE source = ?");
    let row = sqlx::query(&sql)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(source_from_row))
}

pub async fn require_source(conn: &mut SqliteConnection, name: &str) -> Result<SourceRecord> {
    find_source(conn, name)
        .await?
        .ok_or_else(|| UpdateError::SourceNotFound(name.to_string()))
}

pub async fn get_source(conn: &mut SqliteConnection, id: i64) -> Result<Option<SourceRecord>> {
    let sql = format!("SELECT {SOURCE_COLUMNS} FROM source WHERE source_id = ?");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(source_from_row))
}

pub async fn list_sources(conn: &mut SqliteConnection, active_only: bool) -> Result<Vec<SourceRecord>> {
    let sql = if active_only {
        format!("SELECT {SOURCE_COLUMNS} FROM source WHERE active = 1 ORDER BY source_id")
    } else {
        format!("SELECT {SOURCE_COLUMNS} FROM source ORDER BY source_id")
    };
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    Ok(rows.iter().map(source_from_row).collect())
}

pub async fn set_active(conn: &mut SqliteConnection, id: i64, active: bool) -> Result<()> {
    sqlx::query("UPDATE source SET active = ? WHERE source_id = ?")
        .bind(active)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_last_status(conn: &mut SqliteConnection, id: i64, status: RunStatus) -> Result<()> {
    sqlx::query("UPDATE source SET last_status = ? WHERE source_id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Record a completed load: plugin version and the builds the new rows use
pub async fn record_load(
    conn: &mut SqliteConnection,
    id: i64,
    version: &str,
    declared: DeclaredBuild,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE source SET
            version = ?,
            grch = ?,
            ucschg = ?,
            current_build = ?,
            last_status = 'completed',
            last_updated = ?
        WHERE source_id = ?
        "#,
    )
    .bind(version)
    .bind(declared.grch)
    .bind(declared.ucschg)
    .bind(declared.ucschg)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    debug!(source_id = id, version, ?declared, "source load recorded");
    Ok(())
}

/// Forget what a purged source had loaded: its build pointers, file
/// fingerprints and version. Runs recorded so far stop counting as the
/// change-detection reference, so the next refresh reloads the source.
pub async fn reset_after_purge(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE source SET
            version = NULL,
            grch = NULL,
            ucschg = NULL,
            current_build = NULL,
            last_status = ?,
            purge_mark = (SELECT COALESCE(MAX(run_id), 0) FROM phase_run WHERE source_id = ?)
        WHERE source_id = ?
        "#,
    )
    .bind(RunStatus::Pending.as_str())
    .bind(id)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM source_file WHERE source_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    debug!(source_id = id, "source state reset after purge");
    Ok(())
}

pub async fn set_current_build(conn: &mut SqliteConnection, id: i64, build: i64) -> Result<()> {
    sqlx::query("UPDATE source SET current_build = ? WHERE source_id = ?")
        .bind(build)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Point every active source at the store's target build
pub async fn set_target_build(conn: &mut SqliteConnection, build: i64) -> Result<()> {
    sqlx::query("UPDATE source SET target_build = ? WHERE active = 1")
        .bind(build)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn get_options(conn: &mut SqliteConnection, id: i64) -> Result<SourceOptions> {
    let rows = sqlx::query("SELECT option, value FROM source_option WHERE source_id = ?")
        .bind(id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .iter()
        .map(|r| {
            (
                r.get::<String, _>("option"),
                r.get::<Option<String>, _>("value").unwrap_or_default(),
            )
        })
        .collect())
}

pub async fn replace_options(
    conn: &mut SqliteConnection,
    id: i64,
    options: &SourceOptions,
) -> Result<()> {
    sqlx::query("DELETE FROM source_option WHERE source_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    for (option, value) in options {
        sqlx::query("INSERT INTO source_option (source_id, option, value) VALUES (?, ?, ?)")
            .bind(id)
            .bind(option)
            .bind(value)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub async fn get_files(conn: &mut SqliteConnection, id: i64) -> Result<Vec<FileFingerprint>> {
    let rows = sqlx::query(
        "SELECT filename, size, modified, md5 FROM source_file WHERE source_id = ? ORDER BY filename",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .iter()
        .map(|r| FileFingerprint {
            filename: r.get("filename"),
            size: r.get::<Option<i64>, _>("size").unwrap_or(0),
            modified: r.get::<Option<i64>, _>("modified").unwrap_or(0),
            md5: r.get::<Option<String>, _>("md5").unwrap_or_default(),
        })
        .collect())
}

/// Replace a source's file fingerprints wholesale
pub async fn replace_files(
    conn: &mut SqliteConnection,
    id: i64,
    files: &[FileFingerprint],
) -> Result<()> {
    sqlx::query("DELETE FROM source_file WHERE source_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    for file in files {
        sqlx::query(
            "INSERT INTO source_file (source_id, filename, size, modified, md5) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&file.filename)
        .bind(file.size)
        .bind(file.modified)
        .bind(&file.md5)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Append a warning; warnings are never updated or removed
pub async fn add_warning(
    conn: &mut SqliteConnection,
    id: i64,
    run_id: Option<i64>,
    message: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO warning (source_id, run_id, warning, created_at) VALUES (?, ?, ?, ?)")
        .bind(id)
        .bind(run_id)
        .bind(message)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn list_warnings(conn: &mut SqliteConnection, id: i64) -> Result<Vec<SourceWarning>> {
    let rows = sqlx::query(
        r#"
        SELECT warning_id, source_id, run_id, warning, created_at
        FROM warning WHERE source_id = ? ORDER BY warning_id
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .iter()
        .map(|r| SourceWarning {
            id: r.get("warning_id"),
            source_id: r.get("source_id"),
            run_id: r.get("run_id"),
            message: r.get("warning"),
            created_at: r.get("created_at"),
        })
        .collect())
}

pub async fn add_build_equivalence(
    conn: &mut SqliteConnection,
    source_id: i64,
    grch: i64,
    ucschg: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO build_equivalence (grch, ucschg, source_id) VALUES (?, ?, ?)
        ON CONFLICT(grch) DO UPDATE SET ucschg = excluded.ucschg, source_id = excluded.source_id
        "#,
    )
    .bind(grch)
    .bind(ucschg)
    .bind(source_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Fill in missing GRCh/hg builds from the equivalence table, and start
/// sources with no current build at their declared hg build.
///
/// Returns `(source_id, message)` warnings for sources whose builds could
/// only be half resolved.
pub async fn cross_map_builds(conn: &mut SqliteConnection) -> Result<Vec<(i64, String)>> {
    sqlx::query(
        r#"
        UPDATE source SET grch = (
            SELECT MAX(be.grch) FROM build_equivalence be WHERE be.ucschg = source.ucschg
        )
        WHERE grch IS NULL AND ucschg IS NOT NULL
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        UPDATE source SET ucschg = (
            SELECT be.ucschg FROM build_equivalence be WHERE be.grch = source.grch
        )
        WHERE ucschg IS NULL AND grch IS NOT NULL
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE source SET current_build = ucschg WHERE current_build IS NULL")
        .execute(&mut *conn)
        .await?;

    let rows = sqlx::query(
        r#"
        SELECT source_id, source, grch, ucschg FROM source
        WHERE active = 1 AND ((grch IS NULL) <> (ucschg IS NULL))
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .iter()
        .map(|r| {
            let name: String = r.get("source");
            let grch: Option<i64> = r.get("grch");
            let ucschg: Option<i64> = r.get("ucschg");
            let message = match (grch, ucschg) {
                (Some(g), None) => format!("{name} declares GRCh{g} but no matching hg build is known"),
                (None, Some(u)) => format!("{name} declares hg{u} but no matching GRCh build is known"),
                _ => format!("{name} has an incomplete build declaration"),
            };
            (r.get::<i64, _>("source_id"), message)
        })
        .collect())
}
