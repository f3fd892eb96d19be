//! Coordinate liftover between genome builds using scored alignment chains

pub mod chain;
pub mod engine;
pub mod index;
pub mod rewrite;
pub mod storage;

pub use chain::{Chain, ChainSegment, NewChain};
pub use engine::{LiftOver, LiftOverEngine, LiftTally, Lifted, Region};
pub use index::{ChainIndex, MappedInterval};
