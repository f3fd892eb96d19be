//! LOKI Common Library
//!
//! Shared types, hashing utilities, and logging setup for the LOKI updater
//! workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`LokiError`] and the crate [`Result`] alias
//! - **Checksums**: streaming file digests and source file fingerprints
//! - **Types**: genome builds, fingerprints, digest algorithms
//! - **Logging**: `tracing` subscriber configuration shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use loki_common::checksum::fingerprint_file;
//!
//! fn describe(path: &str) -> loki_common::Result<()> {
//!     let fp = fingerprint_file(path, "genes.txt")?;
//!     tracing::info!(file = %fp.filename, md5 = %fp.md5, "fingerprinted");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{LokiError, Result};
pub use types::{Build, ChecksumAlgorithm, FileFingerprint};
