//! Per-source extract/transform/load tracking

pub mod storage;
pub mod types;

pub use types::{ExtractOutcome, Phase, PhaseRun, PhaseState, PhaseStatus, RunStatus};
