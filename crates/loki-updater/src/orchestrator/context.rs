//! Per-refresh run state
//!
//! Created when a refresh starts and dropped when it returns. Tracks which
//! tables the run touched (fix-ups and index rebuilds key off this), which
//! sources were loaded, and whether chain data changed under the liftover
//! cache.

use crate::db::schema::{CHAIN_SEGMENT_TABLE, CHAIN_TABLE};
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug)]
pub struct RunContext {
    batch_id: Uuid,
    bulk_mode: bool,
    state: RunSnapshot,
}

/// The part of the run state that a rolled-back source must undo
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSnapshot {
    tables_updated: BTreeSet<String>,
    deindexed: BTreeSet<String>,
    sources_loaded: BTreeSet<i64>,
    chains_changed: bool,
}

impl RunContext {
    pub fn new(bulk_mode: bool) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            bulk_mode,
            state: RunSnapshot::default(),
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn bulk_mode(&self) -> bool {
        self.bulk_mode
    }

    pub fn mark_updated(&mut self, table: &str) {
        if table == CHAIN_TABLE || table == CHAIN_SEGMENT_TABLE {
            self.state.chains_changed = true;
        }
        self.state.tables_updated.insert(table.to_string());
    }

    pub fn is_updated(&self, table: &str) -> bool {
        self.state.tables_updated.contains(table)
    }

    pub fn mark_loaded(&mut self, source_id: i64) {
        self.state.sources_loaded.insert(source_id);
    }

    /// The source completed a load in this run
    pub fn was_loaded(&self, source_id: i64) -> bool {
        self.state.sources_loaded.contains(&source_id)
    }

    /// True the first time a table is prepared for bulk loading this run
    pub fn needs_deindex(&self, table: &str) -> bool {
        self.bulk_mode && !self.state.deindexed.contains(table)
    }

    pub fn mark_deindexed(&mut self, table: &str) {
        self.state.deindexed.insert(table.to_string());
    }

    pub fn deindexed(&self) -> impl Iterator<Item = &str> {
        self.state.deindexed.iter().map(String::as_str)
    }

    pub fn chains_changed(&self) -> bool {
        self.state.chains_changed
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.state.clone()
    }

    pub fn restore(&mut self, snapshot: RunSnapshot) {
        self.state = snapshot;
    }
}
