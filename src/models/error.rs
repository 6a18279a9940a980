//! Error types for ctrleval.
//!
//! Taxonomy:
//! - Configuration: rejected before any instance is processed
//! - Domain artifacts: abort a single (instance, replicate) pair
//! - Cache consistency: sampler construction failed, cache left untouched
//! - Statistical: aggregation has nothing meaningful to report
//! - Infrastructure: engine transport and filesystem failures

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for ctrleval.
#[derive(Debug, Error)]
pub enum CtrlError {
    // ═══════════════════════════════════════════════════════════════════
    // CONFIGURATION — fatal, reported before the first instance
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Unknown model type '{name}' (known: {known})")]
    UnknownStrategy { name: String, known: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ═══════════════════════════════════════════════════════════════════
    // DOMAIN ARTIFACTS — scoped to one instance
    // ═══════════════════════════════════════════════════════════════════

    #[error("Grammar not found for instance '{instance_id}'{}", looked_in(.path))]
    MissingGrammar {
        instance_id: String,
        path: Option<PathBuf>,
    },

    #[error("Missing {artifact} for instance '{instance_id}'")]
    MissingDomainArtifact {
        instance_id: String,
        artifact: String,
    },

    #[error("Instance '{instance_id}' (replicate {replicate}) failed: {source}")]
    Instance {
        instance_id: String,
        replicate: usize,
        #[source]
        source: Box<CtrlError>,
    },

    // ═══════════════════════════════════════════════════════════════════
    // CACHE CONSISTENCY — builder failed, nothing was stored
    // ═══════════════════════════════════════════════════════════════════

    #[error("Failed to build sampler: {0}")]
    SamplerBuildFailure(String),

    // ═══════════════════════════════════════════════════════════════════
    // STATISTICAL — nothing to aggregate
    // ═══════════════════════════════════════════════════════════════════

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE — decoding engine and filesystem
    // ═══════════════════════════════════════════════════════════════════

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Engine API error (status {status}): {message}")]
    EngineApi { status: u16, message: String },

    #[error("Engine returned an invalid response: {0}")]
    EngineProtocol(String),

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn looked_in(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" (looked in {})", p.display()))
        .unwrap_or_default()
}

impl CtrlError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Tie an error to the (instance, replicate) pair it aborted.
    pub fn for_instance(self, instance_id: impl Into<String>, replicate: usize) -> Self {
        match self {
            already @ Self::Instance { .. } => already,
            other => Self::Instance {
                instance_id: instance_id.into(),
                replicate,
                source: Box::new(other),
            },
        }
    }

    /// Check if this error is retryable by the engine client.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::EngineApi { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether the error only concerns a single instance and the batch may continue.
    pub fn is_instance_scoped(&self) -> bool {
        match self {
            Self::Instance { source, .. } => source.is_instance_scoped(),
            Self::Config(_) | Self::UnknownStrategy { .. } | Self::InsufficientData(_) => false,
            _ => true,
        }
    }
}

/// Result type alias for ctrleval.
pub type Result<T> = std::result::Result<T, CtrlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_instance_wraps_once() {
        let err = CtrlError::SamplerBuildFailure("empty grammar".to_string())
            .for_instance("q1", 0)
            .for_instance("q2", 3);

        match err {
            CtrlError::Instance {
                instance_id,
                replicate,
                source,
            } => {
                assert_eq!(instance_id, "q1");
                assert_eq!(replicate, 0);
                assert!(matches!(*source, CtrlError::SamplerBuildFailure(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_grammar_message() {
        let err = CtrlError::MissingGrammar {
            instance_id: "q7".to_string(),
            path: Some(PathBuf::from("grammars/concert_singer.lark")),
        };
        let message = err.to_string();
        assert!(message.contains("q7"));
        assert!(message.contains("grammars/concert_singer.lark"));
    }

    #[test]
    fn test_retryable_statuses() {
        let busy = CtrlError::EngineApi {
            status: 503,
            message: "busy".to_string(),
        };
        let bad = CtrlError::EngineApi {
            status: 400,
            message: "bad".to_string(),
        };
        assert!(busy.is_retryable());
        assert!(!bad.is_retryable());
    }

    #[test]
    fn test_instance_scope_looks_through_wrapper() {
        let grammar = CtrlError::MissingGrammar {
            instance_id: "q1".to_string(),
            path: None,
        }
        .for_instance("q1", 0);
        assert!(grammar.is_instance_scoped());

        let config = CtrlError::Config(crate::models::ConfigError::Invalid("bad".to_string()))
            .for_instance("q1", 0);
        assert!(!config.is_instance_scoped());
        assert!(!CtrlError::InsufficientData("empty".to_string()).is_instance_scoped());
    }
}
