//! Core data models for ctrleval.
//!
//! - Configuration: file-backed knobs and the derived run configuration
//! - Errors: one enum covering configuration, domain, cache and engine failures
//! - Instances: dataset records, model outputs and evaluated results

mod config;
mod error;
mod instance;

pub use config::*;
pub use error::*;
pub use instance::*;
