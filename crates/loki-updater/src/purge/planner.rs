//! Deletion order for a source's rows
//!
//! Order, by priority:
//! 1. curated override tables, in the given order
//! 2. the remaining tables sorted children-before-parents (Kahn) over the
//!    declared dependencies merged with live `PRAGMA foreign_key_list` edges
//! 3. reverse registration order, when the graph has a cycle or the live
//!    metadata cannot be read

use crate::db::{Checkpoint, SchemaCatalog};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    Topological,
    ReverseRegistration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeStep {
    pub table: String,
    pub source_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgePlan {
    pub steps: Vec<PurgeStep>,
    pub strategy: PlanStrategy,
}

impl PurgePlan {
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.table.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    /// Rows deleted per table, in deletion order
    pub per_table: Vec<(String, u64)>,
    pub total: u64,
}

impl PurgeReport {
    pub fn touched_tables(&self) -> impl Iterator<Item = &str> {
        self.per_table
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(t, _)| t.as_str())
    }
}

pub struct PurgePlanner {
    catalog: Arc<SchemaCatalog>,
    overrides: Vec<String>,
    plan: OnceCell<PurgePlan>,
}

impl PurgePlanner {
    pub fn new(catalog: Arc<SchemaCatalog>, overrides: Vec<String>) -> Self {
        Self {
            catalog,
            overrides,
            plan: OnceCell::new(),
        }
    }

    /// The cached plan, computed on first use
    pub async fn plan(&self, conn: &mut SqliteConnection) -> Result<&PurgePlan> {
        self.plan
            .get_or_try_init(|| async move { self.compute_plan(conn).await })
            .await
    }

    async fn compute_plan(&self, conn: &mut SqliteConnection) -> Result<PurgePlan> {
        let purgeable: Vec<(&str, &str)> = self
            .catalog
            .purgeable()
            .filter_map(|t| t.source_column.as_deref().map(|c| (t.name.as_str(), c)))
            .collect();
        let column_of: HashMap<&str, &str> = purgeable.iter().copied().collect();

        let mut steps: Vec<PurgeStep> = Vec::new();
        let mut placed: BTreeSet<&str> = BTreeSet::new();
        for table in &self.overrides {
            let Some((&name, &column)) = column_of.get_key_value(table.as_str()) else {
                warn!(table = %table, "purge override names no purgeable table");
                continue;
            };
            if placed.insert(name) {
                steps.push(PurgeStep {
                    table: name.to_string(),
                    source_column: column.to_string(),
                });
            }
        }

        let remaining: Vec<&str> = purgeable
            .iter()
            .map(|(t, _)| *t)
            .filter(|t| !placed.contains(t))
            .collect();

        let (ordered, strategy) = match self.live_edges(conn, &remaining).await {
            Ok(edges) => match topological_order(&remaining, &edges) {
                Some(order) => (order, PlanStrategy::Topological),
                None => {
                    warn!("foreign key cycle among purgeable tables; using reverse registration order");
                    (reverse_order(&remaining), PlanStrategy::ReverseRegistration)
                },
            },
            Err(e) => {
                warn!(error = %e, "foreign key metadata unavailable; using reverse registration order");
                (reverse_order(&remaining), PlanStrategy::ReverseRegistration)
            },
        };

        steps.extend(ordered.into_iter().map(|table| PurgeStep {
            table: table.to_string(),
            source_column: column_of.get(table).copied().unwrap_or("source_id").to_string(),
        }));

        debug!(?strategy, order = ?steps.iter().map(|s| &s.table).collect::<Vec<_>>(), "purge plan computed");
        Ok(PurgePlan { steps, strategy })
    }

    /// (child, parent) edges among `tables`: declared ones plus live foreign keys
    async fn live_edges<'t>(
        &self,
        conn: &mut SqliteConnection,
        tables: &[&'t str],
    ) -> Result<Vec<(&'t str, &'t str)>> {
        let mut edges: BTreeSet<(&'t str, &'t str)> = BTreeSet::new();
        let lookup = |name: &str| tables.iter().copied().find(|t| t.eq_ignore_ascii_case(name));

        for &child in tables {
            if let Some(spec) = self.catalog.get(child) {
                for parent in &spec.depends_on {
                    if let Some(parent) = lookup(parent) {
                        edges.insert((child, parent));
                    }
                }
            }

            let rows = sqlx::query(&format!("PRAGMA foreign_key_list({child})"))
                .fetch_all(&mut *conn)
                .await?;
            for row in &rows {
                let parent: String = row.try_get("table")?;
                if let Some(parent) = lookup(&parent) {
                    edges.insert((child, parent));
                }
            }
        }
        Ok(edges.into_iter().filter(|(c, p)| c != p).collect())
    }

    /// Delete every row of `source_id` in one transaction
    pub async fn purge(&self, pool: &SqlitePool, source_id: i64) -> Result<PurgeReport> {
        let mut checkpoint = Checkpoint::begin(pool, "purge").await?;
        let report = self.purge_in(checkpoint.conn(), source_id).await?;
        checkpoint.release().await?;
        info!(source_id, total = report.total, "source purged");
        Ok(report)
    }

    /// Delete every row of `source_id` in plan order on the caller's
    /// connection (the caller owns the transaction)
    #[instrument(skip(self, conn))]
    pub async fn purge_in(&self, conn: &mut SqliteConnection, source_id: i64) -> Result<PurgeReport> {
        let plan = self.plan(conn).await?;
        let mut report = PurgeReport::default();
        for step in &plan.steps {
            let sql = format!("DELETE FROM {} WHERE {} = ?", step.table, step.source_column);
            let deleted = sqlx::query(&sql)
                .bind(source_id)
                .execute(&mut *conn)
                .await?
                .rows_affected();
            if deleted > 0 {
                info!(table = %step.table, rows = deleted, "purged source rows");
            }
            report.total += deleted;
            report.per_table.push((step.table.clone(), deleted));
        }
        Ok(report)
    }
}

fn reverse_order<'t>(tables: &[&'t str]) -> Vec<&'t str> {
    tables.iter().rev().copied().collect()
}

/// Kahn's algorithm over (child, parent) edges, emitting a table only once
/// every table referencing it has been emitted. Ties keep registration
/// order. `None` on a cycle.
fn topological_order<'t>(tables: &[&'t str], edges: &[(&'t str, &'t str)]) -> Option<Vec<&'t str>> {
    let mut pending_children: HashMap<&str, usize> = tables.iter().map(|t| (*t, 0)).collect();
    let mut parents_of: HashMap<&str, Vec<&'t str>> = HashMap::new();
    for &(child, parent) in edges {
        *pending_children.entry(parent).or_insert(0) += 1;
        parents_of.entry(child).or_default().push(parent);
    }

    let mut ready: VecDeque<&'t str> = tables
        .iter()
        .copied()
        .filter(|t| pending_children.get(t).copied().unwrap_or(0) == 0)
        .collect();
    let mut order = Vec::with_capacity(tables.len());

    while let Some(table) = ready.pop_front() {
        order.push(table);
        for &parent in parents_of.get(table).map(Vec::as_slice).unwrap_or_default() {
            if let Some(count) = pending_children.get_mut(parent) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(parent);
                }
            }
        }
    }

    (order.len() == tables.len()).then_some(order)
}
