//! Token samplers and the capability that builds samplers and critics.

use crate::client::LanguageModel;
use crate::models::{CtrlError, Instance, Result};
use crate::sampler::{Critic, FastPotential, PotentialFactory};
use crate::strategy::{SamplerPolicy, Strategy, Weighting};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Reusable token-level sampling strategy.
///
/// Construction may be expensive on the engine side (grammar compilation),
/// which is why instances sharing a cache key share one sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TokenSampler {
    Direct,
    Eager {
        weighting: Weighting,
        potential: FastPotential,
    },
}

impl TokenSampler {
    pub fn direct() -> Self {
        Self::Direct
    }

    /// Sampler guided by `potential`.
    pub fn eager(potential: FastPotential, weighting: Weighting) -> Result<Self> {
        if potential.kind.trim().is_empty() {
            return Err(CtrlError::SamplerBuildFailure(
                "fast potential has no kind".to_string(),
            ));
        }
        if potential.kind == FastPotential::BOOL_CFG
            && potential.grammar().is_none_or(|g| g.trim().is_empty())
        {
            return Err(CtrlError::SamplerBuildFailure(
                "bool_cfg potential needs a non-empty grammar".to_string(),
            ));
        }
        Ok(Self::Eager {
            weighting,
            potential,
        })
    }
}

/// Builds samplers and critics for instances.
///
/// `Model` depends only on this capability; domains plug in through a
/// [`PotentialFactory`] wrapped by [`StrategyComponents`], or implement it
/// directly.
pub trait SamplerFactory: Send + Sync {
    fn build_sampler(&self, instance: &Instance) -> Result<TokenSampler>;

    /// `None` when the strategy has no critic or the domain supplies none.
    fn build_critic(&self, instance: &Instance) -> Result<Option<Critic>>;
}

/// A strategy bound to a language model and a domain's potentials.
pub struct StrategyComponents {
    strategy: Strategy,
    lm: Arc<LanguageModel>,
    potentials: Arc<dyn PotentialFactory>,
}

impl StrategyComponents {
    pub fn new(
        strategy: Strategy,
        lm: Arc<LanguageModel>,
        potentials: Arc<dyn PotentialFactory>,
    ) -> Self {
        Self {
            strategy,
            lm,
            potentials,
        }
    }
}

impl SamplerFactory for StrategyComponents {
    fn build_sampler(&self, instance: &Instance) -> Result<TokenSampler> {
        match self.strategy.sampler {
            SamplerPolicy::Direct => Ok(TokenSampler::direct()),
            SamplerPolicy::Eager { weighting } => {
                let potential = self.potentials.fast_potential(instance)?;
                TokenSampler::eager(potential, weighting)
            }
        }
    }

    fn build_critic(&self, instance: &Instance) -> Result<Option<Critic>> {
        if !self.strategy.uses_critic {
            return Ok(None);
        }
        Ok(self
            .potentials
            .expensive_potential(instance)?
            .map(|potential| potential.coerce(&self.lm)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::ExpensivePotential;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPotentials {
        fast: AtomicUsize,
        expensive: AtomicUsize,
    }

    impl PotentialFactory for CountingPotentials {
        fn fast_potential(&self, _instance: &Instance) -> Result<FastPotential> {
            self.fast.fetch_add(1, Ordering::SeqCst);
            Ok(FastPotential::bool_cfg("start: /.+/"))
        }

        fn expensive_potential(&self, _instance: &Instance) -> Result<Option<ExpensivePotential>> {
            self.expensive.fetch_add(1, Ordering::SeqCst);
            Ok(Some(ExpensivePotential::new("verifier")))
        }
    }

    fn components(strategy: Strategy) -> (StrategyComponents, Arc<CountingPotentials>) {
        let potentials = Arc::new(CountingPotentials::default());
        let components = StrategyComponents::new(
            strategy,
            Arc::new(LanguageModel::new("gpt2")),
            potentials.clone(),
        );
        (components, potentials)
    }

    #[test]
    fn test_direct_without_critic_touches_no_potential() {
        let (components, potentials) = components(Strategy::direct());
        let instance = Instance::new("q1", "prompt");

        assert_eq!(components.build_sampler(&instance).unwrap(), TokenSampler::Direct);
        assert!(components.build_critic(&instance).unwrap().is_none());
        assert_eq!(potentials.fast.load(Ordering::SeqCst), 0);
        assert_eq!(potentials.expensive.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_direct_with_critic_skips_fast_potential() {
        let (components, potentials) = components(Strategy::direct().with_critic());
        let instance = Instance::new("q1", "prompt");

        components.build_sampler(&instance).unwrap();
        let critic = components.build_critic(&instance).unwrap().unwrap();
        assert_eq!(critic.target_lm, "gpt2");
        assert_eq!(potentials.fast.load(Ordering::SeqCst), 0);
        assert_eq!(potentials.expensive.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_eager_carries_weighting() {
        let (components, _) = components(Strategy::eager(Weighting::Improper));
        let sampler = components
            .build_sampler(&Instance::new("q1", "prompt"))
            .unwrap();
        match sampler {
            TokenSampler::Eager { weighting, .. } => assert_eq!(weighting, Weighting::Improper),
            other => panic!("unexpected sampler: {other:?}"),
        }
    }

    #[test]
    fn test_empty_grammar_is_a_build_failure() {
        let err = TokenSampler::eager(FastPotential::bool_cfg("  "), Weighting::Proper).unwrap_err();
        assert!(matches!(err, CtrlError::SamplerBuildFailure(_)));
    }
}
