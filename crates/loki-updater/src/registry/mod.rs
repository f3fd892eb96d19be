//! Source registry: sources, their options, file fingerprints, builds and warnings

pub mod storage;
pub mod types;

pub use storage::*;
pub use types::{DeclaredBuild, SourceOptions, SourceRecord, SourceWarning};
