//! Updater error taxonomy
//!
//! Variants map onto how the orchestrator reacts:
//!
//! - `Validation`: the request or one source's options are unusable; nothing is written for it
//! - `TransientIo`: a download kept failing after its retries; the source is dropped from the run
//! - `Processing`: a plugin failed during transform or load; only that source is rolled back
//! - `Consistency`: liftover or a fix-up failed; the whole run is rolled back
//! - `StoreState`: the store is read-only or finalized; the run never starts

use crate::phase::{Phase, PhaseStatus};
use loki_common::LokiError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UpdateError>;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Download failed for {source_name} after {attempts} attempts: {message}")]
    TransientIo {
        source_name: String,
        attempts: u32,
        message: String,
    },

    #[error("Processing error in {phase} phase: {message}")]
    Processing { phase: Phase, message: String },

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Store state error: {0}")]
    StoreState(String),

    #[error("Cannot move {phase} phase from {from} to {to}")]
    InvalidTransition {
        phase: Phase,
        from: PhaseStatus,
        to: PhaseStatus,
    },

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] LokiError),
}

impl UpdateError {
    pub fn processing(phase: Phase, err: impl std::fmt::Display) -> Self {
        Self::Processing {
            phase,
            message: err.to_string(),
        }
    }

    /// Errors that abort the whole refresh rather than a single source
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Consistency(_) | Self::StoreState(_))
    }
}
