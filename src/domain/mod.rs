//! Domain module - the grammar-constrained task domain.
//!
//! Provides:
//! - `GrammarPotentialFactory`: grammar and verifier descriptors per instance
//! - `ExactMatchEvaluator`: reference comparison
//! - prompt formatting and cache key policies

mod evaluator;
mod grammar;
mod prompt;

pub use evaluator::*;
pub use grammar::*;
pub use prompt::*;
