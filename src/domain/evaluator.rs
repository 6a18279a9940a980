use crate::models::{CtrlError, Instance, Result};
use crate::pipeline::Evaluator;

/// Scores 1.0 when the response equals the instance reference, ignoring
/// differences in whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatchEvaluator;

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl Evaluator for ExactMatchEvaluator {
    fn evaluate(&self, instance: &Instance, response: &str) -> Result<f64> {
        let reference = instance
            .reference
            .as_deref()
            .ok_or_else(|| CtrlError::MissingDomainArtifact {
                instance_id: instance.instance_id.clone(),
                artifact: "reference".to_string(),
            })?;
        Ok(f64::from(normalize(reference) == normalize(response)))
    }
}
