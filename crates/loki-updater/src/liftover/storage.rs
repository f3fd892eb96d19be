//! Chain persistence

use super::chain::{Chain, ChainSegment, NewChain};
use crate::error::{Result, UpdateError};
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;

/// Every chain (with segments) from `old_build` to `new_build`
pub async fn load_chains(
    conn: &mut SqliteConnection,
    old_build: i64,
    new_build: i64,
) -> Result<Vec<Chain>> {
    let rows = sqlx::query(
        r#"
        SELECT chain_id, old_chr, old_start, old_end, new_chr, new_start, new_end, score, is_fwd
        FROM chain
        WHERE old_build = ? AND new_build = ?
        "#,
    )
    .bind(old_build)
    .bind(new_build)
    .fetch_all(&mut *conn)
    .await?;

    let mut chains: HashMap<i64, Chain> = rows
        .iter()
        .map(|r| {
            let id: i64 = r.get("chain_id");
            (
                id,
                Chain {
                    id,
                    old_build,
                    old_chr: r.get("old_chr"),
                    old_start: r.get("old_start"),
                    old_end: r.get("old_end"),
                    new_build,
                    new_chr: r.get("new_chr"),
                    new_start: r.get("new_start"),
                    new_end: r.get("new_end"),
                    score: r.get("score"),
                    forward: r.get::<i64, _>("is_fwd") != 0,
                    segments: Vec::new(),
                },
            )
        })
        .collect();

    let segments = sqlx::query(
        r#"
        SELECT cs.chain_id, cs.old_start, cs.old_end, cs.new_start
        FROM chain_segment cs
        JOIN chain c ON c.chain_id = cs.chain_id
        WHERE c.old_build = ? AND c.new_build = ?
        ORDER BY cs.chain_id, cs.old_start
        "#,
    )
    .bind(old_build)
    .bind(new_build)
    .fetch_all(&mut *conn)
    .await?;

    for r in &segments {
        if let Some(chain) = chains.get_mut(&r.get::<i64, _>("chain_id")) {
            chain.segments.push(ChainSegment {
                old_start: r.get("old_start"),
                old_end: r.get("old_end"),
                new_start: r.get("new_start"),
            });
        }
    }

    Ok(chains.into_values().collect())
}

pub async fn has_chains(conn: &mut SqliteConnection, old_build: i64, new_build: i64) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM chain WHERE old_build = ? AND new_build = ? LIMIT 1")
            .bind(old_build)
            .bind(new_build)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(found.is_some())
}

/// Store one chain and its segments; returns the chain id
pub async fn insert_chain(conn: &mut SqliteConnection, source_id: i64, chain: &NewChain) -> Result<i64> {
    let (old_start, old_end) = chain
        .old_span()
        .ok_or_else(|| UpdateError::Validation("chain has no segments".to_string()))?;
    let (new_start, new_end) = chain
        .new_span()
        .ok_or_else(|| UpdateError::Validation("chain has no segments".to_string()))?;
    if let Some(bad) = chain.segments.iter().find(|s| s.is_empty()) {
        return Err(UpdateError::Validation(format!(
            "chain segment {}-{} is empty",
            bad.old_start, bad.old_end
        )));
    }

    let result = sqlx::query(
        r#"
        INSERT INTO chain (
            old_build, old_chr, old_start, old_end,
            new_build, new_chr, new_start, new_end,
            score, is_fwd, source_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(chain.old_build)
    .bind(&chain.old_chr)
    .bind(old_start)
    .bind(old_end)
    .bind(chain.new_build)
    .bind(&chain.new_chr)
    .bind(new_start)
    .bind(new_end)
    .bind(chain.score)
    .bind(chain.forward)
    .bind(source_id)
    .execute(&mut *conn)
    .await?;
    let chain_id = result.last_insert_rowid();

    for seg in &chain.segments {
        sqlx::query(
            "INSERT INTO chain_segment (chain_id, old_start, old_end, new_start, source_id) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(chain_id)
        .bind(seg.old_start)
        .bind(seg.old_end)
        .bind(seg.new_start)
        .bind(source_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok(chain_id)
}
