//! Grammar-constrained domain: a Lark grammar as fast potential, an optional
//! named verifier as critic.

use crate::models::{CtrlError, DomainConfig, Instance, Result};
use crate::sampler::{ExpensivePotential, FastPotential, PotentialFactory};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Potential factory for grammar-constrained generation.
///
/// Grammar resolution order for an instance:
/// 1. inline `grammar`
/// 2. the instance's `grammar_path`
/// 3. `{grammar_dir}/{schema}.lark`
/// 4. the shared grammar loaded from `grammar_path` in config
#[derive(Debug, Clone, Default)]
pub struct GrammarPotentialFactory {
    grammar_dir: Option<PathBuf>,
    shared_grammar: Option<String>,
    verifier: Option<String>,
    verifier_args: Map<String, Value>,
    verifier_timeout_secs: Option<f64>,
}

impl GrammarPotentialFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DomainConfig) -> Result<Self> {
        let shared_grammar = config
            .grammar_path
            .as_deref()
            .map(|path| {
                std::fs::read_to_string(path)
                    .map_err(|e| CtrlError::io(format!("reading grammar {}", path.display()), e))
            })
            .transpose()?;

        Ok(Self {
            grammar_dir: config.grammar_dir.clone(),
            shared_grammar,
            verifier: config.verifier.clone(),
            verifier_args: config.verifier_args.clone(),
            verifier_timeout_secs: config.verifier_timeout_secs,
        })
    }

    pub fn with_grammar_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.grammar_dir = Some(dir.into());
        self
    }

    pub fn with_shared_grammar(mut self, grammar: impl Into<String>) -> Self {
        self.shared_grammar = Some(grammar.into());
        self
    }

    pub fn with_verifier(mut self, verifier: impl Into<String>) -> Self {
        self.verifier = Some(verifier.into());
        self
    }

    /// Grammar text for `instance`.
    pub fn resolve_grammar(&self, instance: &Instance) -> Result<String> {
        if let Some(grammar) = &instance.grammar {
            return Ok(grammar.clone());
        }

        if let Some(path) = &instance.grammar_path {
            return read_grammar(instance, path);
        }

        let schema_path = match (&self.grammar_dir, &instance.schema) {
            (Some(dir), Some(schema)) => Some(dir.join(format!("{schema}.lark"))),
            _ => None,
        };
        if let Some(path) = schema_path.as_deref().filter(|p| p.is_file()) {
            return read_grammar(instance, path);
        }

        if let Some(grammar) = &self.shared_grammar {
            return Ok(grammar.clone());
        }

        Err(CtrlError::MissingGrammar {
            instance_id: instance.instance_id.clone(),
            path: schema_path,
        })
    }
}

fn read_grammar(instance: &Instance, path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(grammar) => {
            debug!(instance_id = %instance.instance_id, path = %path.display(), "Loaded grammar");
            Ok(grammar)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CtrlError::MissingGrammar {
            instance_id: instance.instance_id.clone(),
            path: Some(path.to_owned()),
        }),
        Err(e) => Err(CtrlError::io(format!("reading grammar {}", path.display()), e)),
    }
}

impl PotentialFactory for GrammarPotentialFactory {
    fn fast_potential(&self, instance: &Instance) -> Result<FastPotential> {
        self.resolve_grammar(instance).map(FastPotential::bool_cfg)
    }

    fn expensive_potential(&self, instance: &Instance) -> Result<Option<ExpensivePotential>> {
        let Some(verifier) = &self.verifier else {
            return Ok(None);
        };

        let mut potential = ExpensivePotential::new(verifier.clone());
        for (key, value) in &self.verifier_args {
            potential = potential.with_param(key.clone(), value.clone());
        }
        if let Some(schema) = &instance.schema {
            potential = potential.with_param("schema", schema.clone());
        }
        if !instance.metadata.is_null() {
            potential = potential.with_param("metadata", instance.metadata.clone());
        }
        if let Some(timeout) = self.verifier_timeout_secs {
            potential = potential.with_timeout(timeout);
        }
        Ok(Some(potential))
    }
}
