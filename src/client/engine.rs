//! Decoding engine contract.
//!
//! The particle-filter engine is opaque: the orchestration layer hands it a
//! fully resolved request and awaits a weighted posterior. This is the single
//! suspension point of a model run.

use crate::models::{CtrlError, ModelResponse, Result, RunConfig};
use crate::sampler::{Critic, TokenSampler};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

/// Message in a chat-formatted prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Prompt bound to the target model; the engine tokenizes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", content = "content", rename_all = "lowercase")]
pub enum Prompt {
    /// Raw text, tokenized as-is
    Text(String),
    /// Messages rendered through the model's chat template
    Chat(Vec<Message>),
}

/// The underlying language model as the engine should construct it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageModel {
    pub name: String,

    #[serde(default)]
    pub args: Map<String, Value>,

    /// Replacement end-of-sequence tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_tokens: Option<Vec<String>>,
}

impl LanguageModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Map::new(),
            eos_tokens: None,
        }
    }

    pub fn from_run_config(config: &RunConfig) -> Self {
        Self {
            name: config.lm_name.clone(),
            args: config.lm_args.clone(),
            eos_tokens: config.eos_tokens.clone(),
        }
    }

    /// Whether the model expects chat-formatted prompts.
    pub fn is_chat_tuned(&self) -> bool {
        let name = self.name.to_ascii_lowercase();
        name.contains("instruct") || name.contains("-chat")
    }
}

/// Process-level engine settings, fixed at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    pub tokenizer_parallelism: bool,
}

/// Particle-filter parameters after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeParams {
    pub n_particles: usize,
    pub ess_threshold: f64,
    pub max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resampling_method: Option<String>,
}

impl DecodeParams {
    pub fn from_run_config(config: &RunConfig) -> Self {
        Self {
            n_particles: config.n_particles,
            ess_threshold: config.ess_threshold,
            max_tokens: config.max_tokens,
            resampling_method: config.resampling_method.clone(),
        }
    }
}

/// Everything one decode needs.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub lm: Arc<LanguageModel>,
    pub prompt: Prompt,
    pub sampler: Arc<TokenSampler>,
    pub critic: Option<Critic>,
    pub params: DecodeParams,
    /// Where the engine writes its record for this (instance, replicate)
    pub record_path: PathBuf,
    pub options: EngineOptions,
}

/// Posterior mass over decoded output sequences.
///
/// Masses are non-negative and finite but need not sum to one; downstream
/// consumers treat them as relative weights.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct DecodedPosterior {
    masses: BTreeMap<String, f64>,
}

impl DecodedPosterior {
    /// Build from (sequence, mass) pairs; repeated sequences accumulate.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut masses = BTreeMap::new();
        for (sequence, mass) in pairs {
            let sequence = sequence.into();
            if !mass.is_finite() || mass < 0.0 {
                return Err(CtrlError::EngineProtocol(format!(
                    "posterior mass {mass} for {sequence:?} is not a non-negative number"
                )));
            }
            *masses.entry(sequence).or_insert(0.0) += mass;
        }
        Ok(Self { masses })
    }

    pub fn len(&self) -> usize {
        self.masses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masses.is_empty()
    }

    pub fn total_mass(&self) -> f64 {
        self.masses.values().sum()
    }

    pub fn get(&self, sequence: &str) -> Option<f64> {
        self.masses.get(sequence).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.masses.iter().map(|(s, m)| (s.as_str(), *m))
    }

    /// Convert into (response, weight) pairs.
    pub fn into_responses(self) -> Vec<ModelResponse> {
        self.masses
            .into_iter()
            .map(|(response, weight)| ModelResponse { response, weight })
            .collect()
    }
}

impl TryFrom<BTreeMap<String, f64>> for DecodedPosterior {
    type Error = CtrlError;

    fn try_from(masses: BTreeMap<String, f64>) -> Result<Self> {
        Self::from_pairs(masses)
    }
}

impl From<DecodedPosterior> for BTreeMap<String, f64> {
    fn from(posterior: DecodedPosterior) -> Self {
        posterior.masses
    }
}

/// Asynchronous particle-filter engine.
///
/// Implementations own cancellation and any timeouts; the caller only awaits.
pub trait DecodingEngine: Send + Sync {
    fn decode(
        &self,
        request: DecodeRequest,
    ) -> impl Future<Output = Result<DecodedPosterior>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posterior_accumulates_duplicates() {
        let posterior =
            DecodedPosterior::from_pairs([("SELECT 1", 0.2), ("SELECT 2", 0.3), ("SELECT 1", 0.1)])
                .unwrap();
        assert_eq!(posterior.len(), 2);
        assert!((posterior.get("SELECT 1").unwrap() - 0.3).abs() < 1e-12);
        assert!((posterior.total_mass() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_posterior_rejects_negative_and_nan() {
        assert!(DecodedPosterior::from_pairs([("a", -0.1)]).is_err());
        assert!(DecodedPosterior::from_pairs([("a", f64::NAN)]).is_err());
        assert!(serde_json::from_str::<DecodedPosterior>(r#"{"a": -1.0}"#).is_err());
    }

    #[test]
    fn test_posterior_deserializes_from_object() {
        let posterior: DecodedPosterior =
            serde_json::from_str(r#"{"CCO": 0.75, "C=O": 0.5}"#).unwrap();
        let responses = posterior.into_responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].response, "C=O");
        assert_eq!(responses[1].weight, 0.75);
    }

    #[test]
    fn test_chat_detection() {
        assert!(LanguageModel::new("meta-llama/Meta-Llama-3.1-8B-Instruct").is_chat_tuned());
        assert!(!LanguageModel::new("meta-llama/Meta-Llama-3.1-8B").is_chat_tuned());
    }

    #[test]
    fn test_prompt_wire_format() {
        let prompt = Prompt::Chat(vec![Message::user("hi")]);
        let json = serde_json::to_value(&prompt).unwrap();
        assert_eq!(json["format"], "chat");
        assert_eq!(json["content"][0]["role"], "user");
    }
}
