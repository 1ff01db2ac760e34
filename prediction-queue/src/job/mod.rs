//! Batch job records and their lifecycle transitions.

pub mod transitions;
pub mod types;

pub use types::*;
