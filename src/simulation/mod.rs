//! Reading simulation for the data-collection job, the `simulate` command
//! and history backfill.

pub mod generator;

pub use generator::{GeneratorError, ReadingGenerator, SeededHistory, NORMAL_REGIME};
