//! Model orchestration: one instance in, one weighted posterior out.
//!
//! Run flow:
//! Instance → Prompt → Sampler (cached) → Critic (optional) → Engine → ModelOutput

use crate::checkpoint::record_path;
use crate::client::{DecodeParams, DecodeRequest, DecodingEngine, EngineOptions, LanguageModel, Prompt};
use crate::models::{Instance, ModelOutput, Result, RunConfig};
use crate::sampler::{PotentialFactory, SamplerCache, SamplerFactory, StrategyComponents};
use crate::strategy::Normalized;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Binds an instance to a prompt for the target model.
pub type PromptFormatter = Arc<dyn Fn(&LanguageModel, &Instance) -> Prompt + Send + Sync>;

/// Derives the sampler cache key for an instance; `None` disables caching
/// for that instance.
pub type CacheKeyFn = Arc<dyn Fn(&Instance) -> Option<String> + Send + Sync>;

/// Progress of a single run, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    PromptBound,
    SamplerResolved,
    CriticBound,
    Decoding,
    Completed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::PromptBound => "prompt_bound",
            Self::SamplerResolved => "sampler_resolved",
            Self::CriticBound => "critic_bound",
            Self::Decoding => "decoding",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// A configured model variant ready to run instances.
///
/// Shared read-only across concurrent runs; the sampler cache is the only
/// interior state.
pub struct Model<E> {
    model_type: String,
    config: RunConfig,
    lm: Arc<LanguageModel>,
    components: Arc<dyn SamplerFactory>,
    prompt_formatter: PromptFormatter,
    cache_key_fn: Option<CacheKeyFn>,
    cache: SamplerCache,
    engine: E,
    options: EngineOptions,
}

/// Prompt formatter used when the caller supplies none: the raw instance prompt.
fn plain_prompt() -> PromptFormatter {
    Arc::new(|_lm: &LanguageModel, instance: &Instance| Prompt::Text(instance.prompt.clone()))
}

impl<E: DecodingEngine> Model<E> {
    /// Assemble a model from already-normalized parts.
    pub fn new(
        model_type: impl Into<String>,
        config: RunConfig,
        components: Arc<dyn SamplerFactory>,
        engine: E,
    ) -> Self {
        let lm = Arc::new(LanguageModel::from_run_config(&config));
        let cache = SamplerCache::new(config.cache_capacity);
        Self {
            model_type: model_type.into(),
            config,
            lm,
            components,
            prompt_formatter: plain_prompt(),
            cache_key_fn: None,
            cache,
            engine,
            options: EngineOptions::default(),
        }
    }

    /// Build from a registry normalization and a domain's potentials.
    pub fn from_normalized(
        normalized: Normalized,
        potentials: Arc<dyn PotentialFactory>,
        engine: E,
    ) -> Self {
        let lm = Arc::new(LanguageModel::from_run_config(&normalized.config));
        let components = Arc::new(StrategyComponents::new(
            normalized.entry.strategy,
            Arc::clone(&lm),
            potentials,
        ));
        let mut model = Self::new(normalized.entry.name, normalized.config, components, engine);
        model.lm = lm;
        model
    }

    pub fn with_prompt_formatter(mut self, formatter: PromptFormatter) -> Self {
        self.prompt_formatter = formatter;
        self
    }

    pub fn with_cache_key_fn(mut self, cache_key_fn: Option<CacheKeyFn>) -> Self {
        self.cache_key_fn = cache_key_fn;
        self
    }

    pub fn with_engine_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn lm(&self) -> &LanguageModel {
        &self.lm
    }

    pub fn cache(&self) -> &SamplerCache {
        &self.cache
    }

    /// Decode one instance.
    ///
    /// Sampler and critic are resolved before the single await on the engine.
    /// Domain artifact and sampler construction errors propagate unchanged.
    pub async fn run(
        &self,
        instance: &Instance,
        output_dir: &Path,
        replicate: usize,
    ) -> Result<ModelOutput> {
        let id = instance.instance_id.as_str();
        debug!(instance_id = %id, replicate, phase = %RunPhase::Idle, "Run started");

        let prompt = (self.prompt_formatter)(&self.lm, instance);
        debug!(instance_id = %id, phase = %RunPhase::PromptBound);

        let key = self.cache_key_fn.as_ref().and_then(|key_fn| key_fn(instance));
        let sampler = self
            .cache
            .resolve(key.as_deref(), || self.components.build_sampler(instance))?;
        debug!(instance_id = %id, cache_key = ?key, phase = %RunPhase::SamplerResolved);

        let critic = self.components.build_critic(instance)?;
        if critic.is_some() {
            debug!(instance_id = %id, phase = %RunPhase::CriticBound);
        }

        let request = DecodeRequest {
            lm: Arc::clone(&self.lm),
            prompt,
            sampler,
            critic,
            params: DecodeParams::from_run_config(&self.config),
            record_path: record_path(output_dir, id, replicate),
            options: self.options,
        };

        debug!(instance_id = %id, phase = %RunPhase::Decoding);
        let start = Instant::now();
        let posterior = self.engine.decode(request).await?;
        let runtime_secs = start.elapsed().as_secs_f64();

        debug!(
            instance_id = %id,
            replicate,
            sequences = posterior.len(),
            runtime_secs,
            phase = %RunPhase::Completed
        );

        Ok(ModelOutput {
            responses: posterior.into_responses(),
            runtime_secs,
        })
    }
}
