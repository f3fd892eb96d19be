use crate::phase::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Plugin options, sorted by key so their hash is stable
pub type SourceOptions = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: i64,
    pub name: String,
    pub display_name: Option<String>,
    pub active: bool,
    /// Plugin version string recorded at the last successful load
    pub version: Option<String>,
    /// Declared GRCh build family
    pub grch: Option<i64>,
    /// Declared UCSC hg build
    pub ucschg: Option<i64>,
    /// Build the stored rows are expressed in
    pub current_build: Option<i64>,
    pub target_build: Option<i64>,
    pub last_status: RunStatus,
    pub last_updated: Option<DateTime<Utc>>,
}

impl SourceRecord {
    /// Rows are behind the target build and need lifting
    pub fn needs_liftover(&self, target: i64) -> bool {
        matches!(self.current_build, Some(current) if current < target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceWarning {
    pub id: i64,
    pub source_id: i64,
    pub run_id: Option<i64>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Builds declared by a plugin during load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredBuild {
    pub grch: Option<i64>,
    pub ucschg: Option<i64>,
}

impl DeclaredBuild {
    pub fn is_empty(&self) -> bool {
        self.grch.is_none() && self.ucschg.is_none()
    }
}
