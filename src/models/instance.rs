//! Instance, output and result types.
//!
//! These are the records that flow from the dataset through the model and
//! evaluator into the aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One task instance from the dataset.
///
/// Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier for this instance
    pub instance_id: String,

    /// The task text handed to the prompt formatter
    pub prompt: String,

    /// Schema / database / domain name shared by related instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Inline grammar text for the fast potential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,

    /// Grammar file for the fast potential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar_path: Option<PathBuf>,

    /// Expected answer used by the evaluator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    /// Domain-specific payload (tables, problem text, code context)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Instance {
    /// Minimal instance with only an id and prompt.
    pub fn new(instance_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            prompt: prompt.into(),
            schema: None,
            grammar: None,
            grammar_path: None,
            reference: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_grammar(mut self, grammar: impl Into<String>) -> Self {
        self.grammar = Some(grammar.into());
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// A decoded sequence and its posterior weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub response: String,
    pub weight: f64,
}

/// Output of one `Model::run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOutput {
    /// Weighted posterior over decoded sequences
    pub responses: Vec<ModelResponse>,

    /// Wall-clock decode time in seconds
    pub runtime_secs: f64,
}

impl ModelOutput {
    /// Total posterior mass (weights are relative, not necessarily normalized).
    pub fn total_weight(&self) -> f64 {
        self.responses.iter().map(|r| r.weight).sum()
    }

    /// Response carrying the most mass, if any.
    pub fn map_response(&self) -> Option<&ModelResponse> {
        self.responses
            .iter()
            .max_by(|a, b| a.weight.total_cmp(&b.weight))
    }
}

/// Evaluated outcome for one (instance, replicate) pair.
///
/// Terminal once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceResult {
    pub instance_id: String,
    pub replicate: usize,

    /// Evaluator score weighted by posterior mass (0.0 - 1.0)
    pub weighted_accuracy: f64,

    /// Wall-clock decode time in seconds
    pub runtime_secs: f64,

    /// Record file written by the decoding engine
    pub record_path: PathBuf,

    /// Model type the result was produced with
    pub model_type: String,

    /// Harness run that produced the result
    pub run_id: String,

    pub evaluated_at: DateTime<Utc>,
}

/// Point estimate and bootstrap interval over many results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
    pub confidence: f64,
    pub n_values: usize,
    pub n_bootstrap: usize,
    pub seed: u64,
}

impl AggregateResult {
    /// The two-line report printed at the end of a run.
    pub fn report(&self) -> String {
        format!(
            "Mean weighted accuracy: {}\n{}% CI: ({}, {})",
            self.mean,
            format_percent(self.confidence),
            self.lower,
            self.upper
        )
    }
}

fn format_percent(confidence: f64) -> String {
    let percent = confidence * 100.0;
    if (percent - percent.round()).abs() < 1e-9 {
        format!("{}", percent.round() as i64)
    } else {
        format!("{percent}")
    }
}

/// (instance, replicate) pair that did not produce a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceFailure {
    pub instance_id: String,
    pub replicate: usize,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_parses_minimal_jsonl_line() {
        let line = r#"{"instance_id": "spider-12", "prompt": "How many singers?", "schema": "concert_singer"}"#;
        let instance: Instance = serde_json::from_str(line).unwrap();
        assert_eq!(instance.instance_id, "spider-12");
        assert_eq!(instance.schema.as_deref(), Some("concert_singer"));
        assert!(instance.grammar.is_none());
        assert!(instance.metadata.is_null());
    }

    #[test]
    fn test_map_response_and_total_weight() {
        let output = ModelOutput {
            responses: vec![
                ModelResponse {
                    response: "SELECT 1".to_string(),
                    weight: 0.25,
                },
                ModelResponse {
                    response: "SELECT 2".to_string(),
                    weight: 0.5,
                },
            ],
            runtime_secs: 1.5,
        };
        assert!((output.total_weight() - 0.75).abs() < 1e-12);
        assert_eq!(output.map_response().unwrap().response, "SELECT 2");
    }

    #[test]
    fn test_report_format() {
        let aggregate = AggregateResult {
            mean: 0.5,
            lower: 0.25,
            upper: 0.75,
            confidence: 0.95,
            n_values: 4,
            n_bootstrap: 100,
            seed: 0,
        };
        assert_eq!(
            aggregate.report(),
            "Mean weighted accuracy: 0.5\n95% CI: (0.25, 0.75)"
        );
    }
}
