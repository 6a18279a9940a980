//! ctrleval - Orchestration of controlled-generation experiments.
//!
//! ## Architecture
//!
//! A symbolic model type ("base", "lcd", "full-smc", ...) selects a sampling
//! strategy: how the token sampler weights particles, and whether a
//! sequence-level critic runs. The orchestration layer binds that strategy to
//! a language model and a task domain's potentials, then hands one fully
//! resolved request per instance to an opaque SMC decoding engine.
//!
//! - **Strategy registry**: model type → strategy + run-parameter normalization
//! - **Sampler cache**: bounded LRU, at most one sampler build per key
//! - **Model**: prompt → sampler → critic → single async decode
//! - **Evaluation**: instances × replicates → weighted accuracy, persisted
//! - **Aggregation**: mean with a seeded bootstrap confidence interval

pub mod checkpoint;
pub mod client;
pub mod domain;
pub mod models;
pub mod pipeline;
pub mod sampler;
pub mod stats;
pub mod strategy;

// Re-exports for convenience
pub use checkpoint::RecordStore;
pub use client::{DecodingEngine, EngineOptions, HttpEngine};
pub use domain::{ExactMatchEvaluator, GrammarPotentialFactory};
pub use models::{Config, CtrlError, Instance, ModelOutput, Result, RunConfig};
pub use pipeline::{Evaluation, EvaluationSettings, Model};
pub use sampler::{PotentialFactory, SamplerCache, SamplerFactory};
pub use stats::ResultAggregator;
pub use strategy::{Normalized, StrategyRegistry};
