//! Key/value store settings

use crate::error::Result;
use sqlx::{Row, SqliteConnection};

pub const SCHEMA_VERSION: &str = "schema";
pub const FINALIZED: &str = "finalized";
pub const TARGET_BUILD: &str = "target_build";
pub const ZONE_SIZE: &str = "zone_size";

pub const CURRENT_SCHEMA_VERSION: i64 = 1;

pub async fn get_setting(conn: &mut SqliteConnection, key: &str) -> Result<Option<String>> {
    let row = sqlx::query("SELECT value FROM setting WHERE setting = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.and_then(|r| r.get::<Option<String>, _>("value")))
}

pub async fn get_setting_i64(conn: &mut SqliteConnection, key: &str) -> Result<Option<i64>> {
    Ok(get_setting(conn, key)
        .await?
        .and_then(|v| v.trim().parse().ok()))
}

pub async fn set_setting(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO setting (setting, value) VALUES (?, ?)
        ON CONFLICT(setting) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert a setting only if it has never been set
pub async fn default_setting(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO setting (setting, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub fn is_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}
