//! Statistics module - aggregation of instance results.

mod bootstrap;

pub use bootstrap::*;
