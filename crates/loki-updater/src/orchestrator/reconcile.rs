//! Bringing every source onto one build
//!
//! Runs once per refresh after all sources were processed. The target is
//! the newest build any active source currently holds (a purged source
//! holds none); sources behind it are lifted table by table and their
//! build pointer advanced. A source with no chain data for its build pair
//! is left where it is with a warning.

use super::context::RunContext;
use crate::db::settings::{self, TARGET_BUILD};
use crate::db::SchemaCatalog;
use crate::error::Result;
use crate::liftover::rewrite::lift_table;
use crate::liftover::LiftOverEngine;
use crate::registry;
use loki_common::Build;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiftedSource {
    pub source: String,
    pub from_build: i64,
    pub to_build: i64,
    pub mapped: u64,
    pub unmapped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub target_build: Option<i64>,
    pub lifted: Vec<LiftedSource>,
    /// Sources left behind the target for lack of chains
    pub skipped: Vec<String>,
}

#[instrument(skip_all)]
pub async fn reconcile_builds(
    conn: &mut SqliteConnection,
    catalog: &SchemaCatalog,
    liftover: &LiftOverEngine,
    run: &mut RunContext,
    batch_size: i64,
) -> Result<Reconciliation> {
    for (source_id, message) in registry::cross_map_builds(conn).await? {
        // warned once, by the run that loaded the source
        if !run.was_loaded(source_id) {
            continue;
        }
        warn!(source_id, %message, "build cross-mapping incomplete");
        registry::add_warning(conn, source_id, None, &message).await?;
    }

    let target: Option<i64> =
        sqlx::query_scalar("SELECT MAX(current_build) FROM source WHERE active = 1")
            .fetch_one(&mut *conn)
            .await?;
    let Some(target) = target else {
        info!("no source reports a build; nothing to reconcile");
        return Ok(Reconciliation::default());
    };

    settings::set_setting(conn, TARGET_BUILD, &target.to_string()).await?;
    registry::set_target_build(conn, target).await?;

    let mut report = Reconciliation {
        target_build: Some(target),
        ..Default::default()
    };

    for source in registry::list_sources(conn, true).await? {
        let Some(from) = source.current_build.filter(|_| source.needs_liftover(target)) else {
            continue;
        };

        if !liftover.has_chains(conn, from, target).await? {
            let message = format!(
                "no chains from {} to {}; {} left on {}",
                Build(from),
                Build(target),
                source.name,
                Build(from)
            );
            warn!(source = %source.name, "{}", message);
            registry::add_warning(conn, source.id, None, &message).await?;
            report.skipped.push(source.name);
            continue;
        }

        let index = liftover.index(conn, from, target).await?;
        let mut lifted = LiftedSource {
            source: source.name.clone(),
            from_build: from,
            to_build: target,
            mapped: 0,
            unmapped: 0,
        };
        for spec in catalog.positional() {
            let tally = lift_table(
                conn,
                &index,
                spec,
                source.id,
                liftover.min_coverage(),
                batch_size,
            )
            .await?;
            if tally.mapped + tally.unmapped == 0 {
                continue;
            }
            run.mark_updated(&spec.name);
            if tally.unmapped > 0 {
                let message = format!(
                    "{} of {} rows in {} could not be lifted from {} to {} and were dropped",
                    tally.unmapped,
                    tally.mapped + tally.unmapped,
                    spec.name,
                    Build(from),
                    Build(target)
                );
                registry::add_warning(conn, source.id, None, &message).await?;
            }
            lifted.mapped += tally.mapped;
            lifted.unmapped += tally.unmapped;
        }

        registry::set_current_build(conn, source.id, target).await?;
        info!(
            source = %source.name,
            from = %Build(from),
            to = %Build(target),
            mapped = lifted.mapped,
            unmapped = lifted.unmapped,
            "source lifted"
        );
        report.lifted.push(lifted);
    }

    Ok(report)
}
