//! Configuration models for ctrleval.
//!
//! Every experiment knob lives here. The config file is TOML; the CLI may
//! override individual fields before the run configuration is derived.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Top-level configuration for ctrleval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote decoding engine
    #[serde(default)]
    pub engine: EngineConfig,

    /// Language model and strategy selection
    #[serde(default)]
    pub model: ModelConfig,

    /// Particle-filter parameters
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Sampler cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Domain artifacts (grammars, verifier)
    #[serde(default)]
    pub domain: DomainConfig,

    /// Evaluation harness
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

/// Decoding engine endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the inference service hosting the SMC engine
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key (optional, may contain ${ENV_VAR})
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable consulted when `api_key` is unset
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum attempts per decode request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Whether the engine's tokenizer may parallelize internally
    #[serde(default)]
    pub tokenizer_parallelism: bool,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_api_key_env() -> String {
    "CTRLEVAL_ENGINE_API_KEY".to_string()
}

fn default_timeout() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            tokenizer_parallelism: false,
        }
    }
}

/// Language model and strategy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Symbolic model type (base, lcd, grammar-only-is, ...)
    #[serde(default = "default_model_type")]
    pub model_type: String,

    /// Language model identifier
    #[serde(default = "default_lm_name")]
    pub lm_name: String,

    /// Language model construction arguments
    #[serde(default)]
    pub lm_args: Map<String, Value>,

    /// End-of-sequence tokens replacing the model's own
    #[serde(default)]
    pub eos_tokens: Option<Vec<String>>,

    /// Optional system prompt file for chat-tuned models
    #[serde(default)]
    pub system_prompt: Option<PathBuf>,
}

fn default_model_type() -> String {
    "base".to_string()
}

fn default_lm_name() -> String {
    "meta-llama/Meta-Llama-3.1-8B-Instruct".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: default_model_type(),
            lm_name: default_lm_name(),
            lm_args: Map::new(),
            eos_tokens: None,
            system_prompt: None,
        }
    }
}

/// Particle-filter parameters as supplied by the caller (pre-normalization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_n_particles")]
    pub n_particles: usize,

    #[serde(default)]
    pub ess_threshold: f64,

    #[serde(default)]
    pub resampling_method: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

fn default_n_particles() -> usize {
    1
}

fn default_max_tokens() -> usize {
    100
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            n_particles: default_n_particles(),
            ess_threshold: 0.0,
            resampling_method: None,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Which instance field keys the sampler cache.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheKeyPolicy {
    /// Caching disabled
    None,
    /// One sampler per schema (instances without a schema are not cached)
    #[default]
    Schema,
    /// One sampler shared by every instance
    Constant,
    /// One sampler per instance id
    Instance,
}

/// Sampler cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached samplers
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Cache key derivation
    #[serde(default)]
    pub key: CacheKeyPolicy,
}

fn default_cache_capacity() -> usize {
    1
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            key: CacheKeyPolicy::default(),
        }
    }
}

/// Domain artifact configuration for the grammar domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Directory holding `<schema>.lark` grammars
    #[serde(default)]
    pub grammar_dir: Option<PathBuf>,

    /// Grammar shared by every instance
    #[serde(default)]
    pub grammar_path: Option<PathBuf>,

    /// Sequence-level verifier run by the engine as critic
    #[serde(default)]
    pub verifier: Option<String>,

    /// Extra verifier parameters
    #[serde(default)]
    pub verifier_args: Map<String, Value>,

    /// Time budget forwarded to the verifier
    #[serde(default)]
    pub verifier_timeout_secs: Option<f64>,
}

/// Evaluation harness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Base directory for records and results
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Repetitions per instance
    #[serde(default = "default_n_replicates")]
    pub n_replicates: usize,

    /// Cap on the number of instances evaluated
    #[serde(default)]
    pub max_instances: Option<usize>,

    #[serde(default)]
    pub overwrite_results: bool,

    #[serde(default)]
    pub overwrite_outputs: bool,

    /// Concurrent (instance, replicate) runs
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Bootstrap seed
    #[serde(default)]
    pub seed: u64,

    #[serde(default = "default_n_bootstrap")]
    pub n_bootstrap: usize,

    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_n_replicates() -> usize {
    1
}

fn default_concurrency() -> usize {
    1
}

fn default_n_bootstrap() -> usize {
    10_000
}

fn default_confidence() -> f64 {
    0.95
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            n_replicates: default_n_replicates(),
            max_instances: None,
            overwrite_results: false,
            overwrite_outputs: false,
            concurrency: default_concurrency(),
            seed: 0,
            n_bootstrap: default_n_bootstrap(),
            confidence: default_confidence(),
        }
    }
}

/// Run configuration handed to the orchestration layer.
///
/// Constructed once per invocation and read-only afterwards. Fields the
/// selected strategy does not use are neutralized by
/// [`StrategyRegistry::normalize`](crate::strategy::StrategyRegistry::normalize).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub lm_name: String,
    pub lm_args: Map<String, Value>,
    pub n_particles: usize,
    pub ess_threshold: f64,
    pub resampling_method: Option<String>,
    pub max_tokens: usize,
    pub cache_capacity: usize,
    pub eos_tokens: Option<Vec<String>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lm_name: default_lm_name(),
            lm_args: Map::new(),
            n_particles: default_n_particles(),
            ess_threshold: 0.0,
            resampling_method: None,
            max_tokens: default_max_tokens(),
            cache_capacity: default_cache_capacity(),
            eos_tokens: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Resolve the engine API key from config or environment.
    ///
    /// Local engines commonly run without auth, so absence is not an error.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.engine.api_key {
            return Some(expand_env_vars(key));
        }
        std::env::var(&self.engine.api_key_env).ok()
    }

    /// Derive the caller-supplied run configuration.
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            lm_name: self.model.lm_name.clone(),
            lm_args: self.model.lm_args.clone(),
            n_particles: self.sampling.n_particles,
            ess_threshold: self.sampling.ess_threshold,
            resampling_method: self.sampling.resampling_method.clone(),
            max_tokens: self.sampling.max_tokens,
            cache_capacity: self.cache.capacity,
            eos_tokens: self.model.eos_tokens.clone(),
        }
    }

    /// Check ranges that serde cannot express.
    ///
    /// Particle-filter parameters are checked by `StrategyRegistry::normalize`,
    /// since their validity depends on the model type.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.sampling.max_tokens == 0 {
            return invalid("sampling.max_tokens must be at least 1");
        }
        if self.cache.capacity == 0 {
            return invalid("cache.capacity must be at least 1 (use key = \"none\" to disable caching)");
        }
        if self.evaluation.n_replicates == 0 {
            return invalid("evaluation.n_replicates must be at least 1");
        }
        if self.evaluation.concurrency == 0 {
            return invalid("evaluation.concurrency must be at least 1");
        }
        if self.evaluation.n_bootstrap == 0 {
            return invalid("evaluation.n_bootstrap must be at least 1");
        }
        if !(self.evaluation.confidence > 0.0 && self.evaluation.confidence < 1.0) {
            return invalid("evaluation.confidence must lie strictly between 0 and 1");
        }
        if self.engine.max_retries == 0 {
            return invalid("engine.max_retries must be at least 1");
        }
        Ok(())
    }
}

/// Parse language-model arguments given as a JSON object on the command line.
pub fn parse_lm_args(raw: &str) -> Result<Map<String, Value>, ConfigError> {
    serde_json::from_str(raw).map_err(ConfigError::LmArgs)
}

static ENV_VAR: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_VAR.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Malformed language model arguments (expected a JSON object): {0}")]
    LmArgs(#[source] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
