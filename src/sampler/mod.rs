//! Sampler module - potentials, sampler construction and the sampler cache.

mod cache;
mod factory;
mod potential;

pub use cache::*;
pub use factory::*;
pub use potential::*;
