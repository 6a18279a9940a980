//! Decoding engine module - the engine contract and its HTTP client.

mod engine;
mod remote;

pub use engine::*;
pub use remote::*;
