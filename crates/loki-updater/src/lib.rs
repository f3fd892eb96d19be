//! LOKI Updater
//!
//! Update and reconciliation engine for the LOKI knowledge store.
//!
//! # Overview
//!
//! - **Phase state machine**: per-source extract/transform/load tracking with
//!   content-hash change detection ([`phase`])
//! - **Source registry**: sources, options, file fingerprints, builds and
//!   warnings ([`registry`])
//! - **Orchestrator**: transactional refresh with one nested checkpoint per
//!   source ([`orchestrator`])
//! - **Liftover**: coordinate mapping between genome builds over scored
//!   alignment chains ([`liftover`])
//! - **Purge planner**: dependency-ordered deletion of a source's rows
//!   ([`purge`])
//!
//! Sources are loaded by [`SourcePlugin`] implementations registered in a
//! [`PluginRegistry`].
//!
//! # Example
//!
//! ```no_run
//! use loki_updater::{PluginRegistry, RefreshRequest, SchemaCatalog, Store, Updater, UpdaterConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = UpdaterConfig::load()?;
//! let store = Store::open(&config, SchemaCatalog::core()).await?;
//! let updater = Updater::new(store, config, PluginRegistry::new());
//! let report = updater.refresh(RefreshRequest::default()).await?;
//! println!("success: {}", report.success);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod error;
pub mod liftover;
pub mod orchestrator;
pub mod phase;
pub mod plugin;
pub mod purge;
pub mod registry;

pub use config::UpdaterConfig;
pub use db::{PositionColumns, SchemaCatalog, Store, TableSpec};
pub use error::{Result, UpdateError};
pub use liftover::{LiftOverEngine, Lifted, Region};
pub use orchestrator::{FixUp, RefreshReport, RefreshRequest, SourceOutcome, Updater, ZoneFixUp};
pub use phase::{Phase, PhaseRun, PhaseStatus, RunStatus};
pub use plugin::{LoadContext, PluginRegistry, SourcePlugin};
pub use purge::PurgePlanner;
pub use registry::{SourceOptions, SourceRecord, SourceWarning};
