//! Checkpoint module for resumable evaluation runs.
//!
//! Provides:
//! - `RecordStore`: atomic persistence of per-instance outputs and results
//! - `record_path`: where the engine writes its record for a run

mod store;

pub use store::*;
