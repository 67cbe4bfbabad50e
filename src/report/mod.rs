//! Batch run reports.

pub mod generator;

pub use generator::*;
