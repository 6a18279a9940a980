//! Pipeline module - model orchestration and the evaluation harness.

mod evaluation;
mod model;

pub use evaluation::*;
pub use model::*;
