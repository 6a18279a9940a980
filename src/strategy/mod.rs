//! Strategy module - model types, sampling policies and parameter normalization.

mod policy;
mod registry;

pub use policy::*;
pub use registry::*;
