//! Potentials and the factory that produces them per instance.
//!
//! Potentials are descriptors: the engine instantiates the actual grammar
//! parser or verifier. A fast potential scores every token extension; an
//! expensive potential (the critic) scores complete sequences.

use crate::client::LanguageModel;
use crate::models::{Instance, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Token-level potential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastPotential {
    pub kind: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl FastPotential {
    pub const BOOL_CFG: &'static str = "bool_cfg";
    pub const TRIVIAL: &'static str = "trivial";

    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
        }
    }

    /// Boolean context-free grammar potential from Lark grammar text.
    pub fn bool_cfg(grammar: impl Into<String>) -> Self {
        Self::new(Self::BOOL_CFG).with_param("grammar", grammar.into())
    }

    /// Accepts every token.
    pub fn trivial() -> Self {
        Self::new(Self::TRIVIAL)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn grammar(&self) -> Option<&str> {
        self.params.get("grammar").and_then(Value::as_str)
    }
}

/// Sequence-level potential, before it is bound to a model's vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpensivePotential {
    pub kind: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Budget the verifier enforces on itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
}

impl ExpensivePotential {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
            timeout_secs: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: f64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Lift the potential from byte sequences onto `lm`'s token sequences.
    ///
    /// Consumes the descriptor and yields a fresh critic; nothing shared is
    /// touched, so coercing once per run is safe under concurrency.
    pub fn coerce(self, lm: &LanguageModel) -> Critic {
        Critic {
            potential: self,
            target_lm: lm.name.clone(),
            coercion: Coercion::ByteJoin,
        }
    }
}

/// How token sequences are mapped onto the potential's alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coercion {
    /// Concatenate token byte strings
    ByteJoin,
}

/// An expensive potential bound to the target language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critic {
    pub potential: ExpensivePotential,
    pub target_lm: String,
    pub coercion: Coercion,
}

/// Per-domain producer of potentials.
///
/// Failures for missing artifacts (grammar, schema, domain files) propagate
/// to the caller of `Model::run` and abort only that instance.
pub trait PotentialFactory: Send + Sync {
    fn fast_potential(&self, instance: &Instance) -> Result<FastPotential>;

    /// `None` when the domain has no sequence-level check for `instance`.
    fn expensive_potential(&self, instance: &Instance) -> Result<Option<ExpensivePotential>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_binds_model() {
        let lm = LanguageModel::new("meta-llama/Meta-Llama-3.1-8B");
        let critic = ExpensivePotential::new("partial_smiles")
            .with_timeout(5.0)
            .coerce(&lm);

        assert_eq!(critic.target_lm, "meta-llama/Meta-Llama-3.1-8B");
        assert_eq!(critic.coercion, Coercion::ByteJoin);
        assert_eq!(critic.potential.timeout_secs, Some(5.0));
    }

    #[test]
    fn test_bool_cfg_grammar_accessor() {
        let potential = FastPotential::bool_cfg("start: \"a\"");
        assert_eq!(potential.kind, FastPotential::BOOL_CFG);
        assert_eq!(potential.grammar(), Some("start: \"a\""));
        assert_eq!(FastPotential::trivial().grammar(), None);
    }
}
