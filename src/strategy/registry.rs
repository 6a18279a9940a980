//! Model-type registry and run-parameter normalization.
//!
//! Maps a symbolic model type ("full-smc", "lcd", ...) to a strategy plus the
//! capability flags that decide which run parameters are meaningful.

use crate::models::{ConfigError, CtrlError, Result, RunConfig};
use crate::strategy::{Capabilities, Strategy, Weighting};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Resampling scheme sent to the engine when a resampling strategy is given none.
pub const DEFAULT_RESAMPLING_METHOD: &str = "multinomial";

/// One row of the strategy table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyEntry {
    pub name: String,
    pub strategy: Strategy,
    pub capabilities: Capabilities,
}

impl StrategyEntry {
    pub fn new(name: impl Into<String>, strategy: Strategy, capabilities: Capabilities) -> Self {
        Self {
            name: name.into(),
            strategy,
            capabilities,
        }
    }
}

/// Run parameter subject to normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    NParticles,
    EssThreshold,
    ResamplingMethod,
}

impl Parameter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NParticles => "n_particles",
            Self::EssThreshold => "ess_threshold",
            Self::ResamplingMethod => "resampling_method",
        }
    }

    fn capability(&self) -> &'static str {
        match self {
            Self::NParticles => "particles",
            Self::EssThreshold => "ESS",
            Self::ResamplingMethod => "resampling",
        }
    }
}

/// A caller-supplied value that was overridden for the selected model type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationDiagnostic {
    pub model_type: String,
    pub parameter: Parameter,
    pub supplied: String,
    pub forced: String,
}

impl fmt::Display for NormalizationDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Model type '{}' doesn't use {}. Setting {}={} (was {})",
            self.model_type,
            self.parameter.capability(),
            self.parameter.as_str(),
            self.forced,
            self.supplied
        )
    }
}

/// Outcome of normalizing a run configuration against a model type.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub entry: StrategyEntry,
    pub config: RunConfig,
    pub diagnostics: Vec<NormalizationDiagnostic>,
}

impl Normalized {
    /// Log every override at warn level.
    pub fn warn_diagnostics(&self) {
        for diagnostic in &self.diagnostics {
            warn!(
                model_type = %diagnostic.model_type,
                parameter = diagnostic.parameter.as_str(),
                supplied = %diagnostic.supplied,
                forced = %diagnostic.forced,
                "{diagnostic}"
            );
        }
    }
}

/// Registry of model types.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    entries: Vec<StrategyEntry>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl StrategyRegistry {
    /// The fixed vocabulary of model types.
    pub fn builtin() -> Self {
        let proper = Strategy::eager(Weighting::Proper);
        let improper = Strategy::eager(Weighting::Improper);

        Self {
            entries: vec![
                StrategyEntry::new("base", Strategy::direct(), Capabilities::NONE),
                StrategyEntry::new("lcd", improper.with_critic(), Capabilities::NONE),
                StrategyEntry::new("grammar-only-is", proper, Capabilities::IMPORTANCE),
                StrategyEntry::new("grammar-only-smc", proper, Capabilities::SMC),
                StrategyEntry::new("sample-rerank", improper.with_critic(), Capabilities::IMPORTANCE),
                StrategyEntry::new("full-is", proper.with_critic(), Capabilities::IMPORTANCE),
                StrategyEntry::new("full-smc", proper.with_critic(), Capabilities::SMC),
                StrategyEntry::new("critic-is", Strategy::direct().with_critic(), Capabilities::IMPORTANCE),
                StrategyEntry::new("critic-smc", Strategy::direct().with_critic(), Capabilities::SMC),
            ],
        }
    }

    /// Add or replace a model type.
    pub fn register(&mut self, entry: StrategyEntry) {
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn entries(&self) -> &[StrategyEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Look up a model type.
    pub fn resolve(&self, name: &str) -> Result<&StrategyEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| CtrlError::UnknownStrategy {
                name: name.to_string(),
                known: self.names().join(", "),
            })
    }

    /// Force parameters the model type does not use to their neutral values.
    ///
    /// Pure: the diagnostics are returned, not logged. A diagnostic is produced
    /// only when the supplied value differed from the neutral one. Parameters
    /// the model type does use are range-checked, and an unset resampling
    /// method falls back to [`DEFAULT_RESAMPLING_METHOD`].
    pub fn normalize(&self, name: &str, mut config: RunConfig) -> Result<Normalized> {
        let entry = self.resolve(name)?.clone();
        let caps = entry.capabilities;
        let mut diagnostics = Vec::new();
        let mut note = |parameter: Parameter, supplied: String, forced: &str| {
            diagnostics.push(NormalizationDiagnostic {
                model_type: entry.name.clone(),
                parameter,
                supplied,
                forced: forced.to_string(),
            });
        };

        if !caps.particles && config.n_particles != 1 {
            note(Parameter::NParticles, config.n_particles.to_string(), "1");
            config.n_particles = 1;
        }

        if !caps.ess && config.ess_threshold != 0.0 {
            note(Parameter::EssThreshold, config.ess_threshold.to_string(), "0");
            config.ess_threshold = 0.0;
        }

        if !caps.resampling {
            if let Some(method) = config.resampling_method.take() {
                note(Parameter::ResamplingMethod, method, "None");
            }
        } else if config.resampling_method.is_none() {
            config.resampling_method = Some(DEFAULT_RESAMPLING_METHOD.to_string());
        }

        let invalid = |msg: String| Err(CtrlError::Config(ConfigError::Invalid(msg)));
        if caps.particles && config.n_particles == 0 {
            return invalid(format!("model type '{name}' needs n_particles >= 1"));
        }
        if caps.ess && !(0.0..=1.0).contains(&config.ess_threshold) {
            return invalid(format!(
                "model type '{name}' needs ess_threshold in [0, 1], got {}",
                config.ess_threshold
            ));
        }

        Ok(Normalized {
            entry,
            config,
            diagnostics,
        })
    }
}
