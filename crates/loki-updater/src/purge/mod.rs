//! Dependency-ordered removal of a source's rows

pub mod planner;

pub use planner::{PlanStrategy, PurgePlan, PurgePlanner, PurgeReport, PurgeStep};
