//! Sampling strategy as a composition of two independent policies.
//!
//! A strategy is {how the token sampler weights particles, whether a
//! sequence-level critic runs}. Combining the two replaces a class
//! hierarchy of model variants.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Weighting scheme of a potential-guided token sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weighting {
    /// Reported weights are unbiased estimates of the target posterior
    Proper,
    /// Incremental weights are dropped; biases toward acceptable outputs
    Improper,
}

/// How the token-level sampler is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SamplerPolicy {
    /// Sample straight from the language model, no fast potential
    Direct,
    /// Eagerly intersect the LM's next-token distribution with the fast potential
    Eager { weighting: Weighting },
}

impl SamplerPolicy {
    /// Whether building the sampler consults the fast potential.
    pub fn uses_fast_potential(&self) -> bool {
        matches!(self, Self::Eager { .. })
    }
}

/// A complete sampling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Strategy {
    pub sampler: SamplerPolicy,
    pub uses_critic: bool,
}

impl Strategy {
    pub const fn new(sampler: SamplerPolicy, uses_critic: bool) -> Self {
        Self {
            sampler,
            uses_critic,
        }
    }

    pub const fn direct() -> Self {
        Self::new(SamplerPolicy::Direct, false)
    }

    pub const fn eager(weighting: Weighting) -> Self {
        Self::new(SamplerPolicy::Eager { weighting }, false)
    }

    /// Same sampler, with a sequence-level critic.
    pub const fn with_critic(self) -> Self {
        Self::new(self.sampler, true)
    }

    /// Whether the reported posterior is a properly weighted estimate.
    pub fn is_properly_weighted(&self) -> bool {
        !matches!(
            self.sampler,
            SamplerPolicy::Eager {
                weighting: Weighting::Improper
            }
        )
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sampler = match self.sampler {
            SamplerPolicy::Direct => "direct",
            SamplerPolicy::Eager {
                weighting: Weighting::Proper,
            } => "eager/proper",
            SamplerPolicy::Eager {
                weighting: Weighting::Improper,
            } => "eager/improper",
        };
        if self.uses_critic {
            write!(f, "{sampler}+critic")
        } else {
            write!(f, "{sampler}")
        }
    }
}

/// Which run parameters a strategy actually consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub particles: bool,
    pub ess: bool,
    pub resampling: bool,
}

impl Capabilities {
    /// Single hypothesis, no resampling.
    pub const NONE: Self = Self {
        particles: false,
        ess: false,
        resampling: false,
    };

    /// Importance sampling: many particles, never resampled.
    pub const IMPORTANCE: Self = Self {
        particles: true,
        ess: false,
        resampling: false,
    };

    /// Sequential Monte Carlo: particles resampled when ESS drops.
    pub const SMC: Self = Self {
        particles: true,
        ess: true,
        resampling: true,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composition_is_orthogonal() {
        let grammar_only = Strategy::eager(Weighting::Proper);
        let full = grammar_only.with_critic();

        assert_eq!(grammar_only.sampler, full.sampler);
        assert!(!grammar_only.uses_critic);
        assert!(full.uses_critic);
        assert!(full.is_properly_weighted());
        assert!(!Strategy::eager(Weighting::Improper).is_properly_weighted());
        assert!(Strategy::direct().is_properly_weighted());
    }

    #[test]
    fn test_display() {
        assert_eq!(Strategy::direct().to_string(), "direct");
        assert_eq!(
            Strategy::eager(Weighting::Improper).with_critic().to_string(),
            "eager/improper+critic"
        );
    }

    #[test]
    fn test_sampler_policy_serializes_tagged() {
        let json = serde_json::to_value(SamplerPolicy::Eager {
            weighting: Weighting::Improper,
        })
        .unwrap();
        assert_eq!(json["kind"], "eager");
        assert_eq!(json["weighting"], "improper");
    }
}
