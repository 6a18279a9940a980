//! Bootstrap confidence interval over per-instance accuracies.

use crate::models::{AggregateResult, CtrlError, EvaluationConfig, InstanceResult, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Summarizes many instance results into a point estimate and interval.
///
/// Pure function of its inputs: the resampling RNG is seeded explicitly, so
/// the same values and seed always produce the same bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultAggregator {
    pub n_bootstrap: usize,
    pub confidence: f64,
    pub seed: u64,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self {
            n_bootstrap: 10_000,
            confidence: 0.95,
            seed: 0,
        }
    }
}

impl ResultAggregator {
    pub fn new(n_bootstrap: usize, confidence: f64, seed: u64) -> Self {
        Self {
            n_bootstrap,
            confidence,
            seed,
        }
    }

    pub fn from_config(config: &EvaluationConfig) -> Self {
        Self::new(config.n_bootstrap, config.confidence, config.seed)
    }

    pub fn aggregate_results(&self, results: &[InstanceResult]) -> Result<AggregateResult> {
        let values: Vec<f64> = results.iter().map(|r| r.weighted_accuracy).collect();
        self.aggregate(&values)
    }

    /// Mean and percentile bootstrap interval of `values`.
    pub fn aggregate(&self, values: &[f64]) -> Result<AggregateResult> {
        if values.is_empty() {
            return Err(CtrlError::InsufficientData(
                "no instance results to aggregate".to_string(),
            ));
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(CtrlError::InvalidInput(format!(
                "confidence must lie strictly between 0 and 1, got {}",
                self.confidence
            )));
        }
        if self.n_bootstrap == 0 {
            return Err(CtrlError::InvalidInput(
                "n_bootstrap must be at least 1".to_string(),
            ));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(CtrlError::InvalidInput(format!(
                "cannot aggregate non-finite value {bad}"
            )));
        }

        let point = mean(values);

        let mut rng = StdRng::seed_from_u64(self.seed);
        let n = values.len();
        let mut means: Vec<f64> = (0..self.n_bootstrap)
            .map(|_| {
                let sum: f64 = (0..n).map(|_| values[rng.gen_range(0..n)]).sum();
                sum / n as f64
            })
            .collect();
        means.sort_by(f64::total_cmp);

        let alpha = (1.0 - self.confidence) / 2.0;
        let lower = quantile(&means, alpha).min(point);
        let upper = quantile(&means, 1.0 - alpha).max(point);

        Ok(AggregateResult {
            mean: point,
            lower,
            upper,
            confidence: self.confidence,
            n_values: n,
            n_bootstrap: self.n_bootstrap,
            seed: self.seed,
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Linearly interpolated quantile of sorted, non-empty data.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let below = position.floor() as usize;
    let above = position.ceil() as usize;
    let fraction = position - below as f64;
    sorted[below] + (sorted[above] - sorted[below]) * fraction
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_within_bounds() {
        let values = [0.0, 0.25, 1.0, 1.0, 0.5, 0.0, 0.75];
        let aggregate = ResultAggregator::default().aggregate(&values).unwrap();

        assert!((aggregate.mean - 3.5 / 7.0).abs() < 1e-12);
        assert!(aggregate.lower <= aggregate.mean);
        assert!(aggregate.mean <= aggregate.upper);
        assert!(aggregate.lower >= 0.0 && aggregate.upper <= 1.0);
        assert_eq!(aggregate.n_values, 7);
    }

    #[test]
    fn test_same_seed_same_bounds() {
        let values: Vec<f64> = (0..50).map(|i| (i % 7) as f64 / 6.0).collect();
        let aggregator = ResultAggregator::new(2_000, 0.9, 42);
        let a = aggregator.aggregate(&values).unwrap();
        let b = aggregator.aggregate(&values).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_constant_values_degenerate_interval() {
        let aggregate = ResultAggregator::default().aggregate(&[0.4; 5]).unwrap();
        assert!((aggregate.lower - 0.4).abs() < 1e-12);
        assert!((aggregate.upper - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_single_value() {
        let aggregate = ResultAggregator::new(100, 0.95, 1).aggregate(&[1.0]).unwrap();
        assert_eq!(aggregate.mean, 1.0);
        assert_eq!(aggregate.lower, 1.0);
        assert_eq!(aggregate.upper, 1.0);
    }

    #[test]
    fn test_empty_input_is_insufficient_data() {
        let err = ResultAggregator::default().aggregate(&[]).unwrap_err();
        assert!(matches!(err, CtrlError::InsufficientData(_)));
    }

    #[test]
    fn test_rejects_bad_confidence_and_nan() {
        assert!(matches!(
            ResultAggregator::new(10, 1.0, 0).aggregate(&[0.5]),
            Err(CtrlError::InvalidInput(_))
        ));
        assert!(matches!(
            ResultAggregator::default().aggregate(&[0.5, f64::NAN]),
            Err(CtrlError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_quantile_interpolates() {
        let sorted = [0.0, 1.0, 2.0, 3.0];
        assert_eq!(quantile(&sorted, 0.0), 0.0);
        assert_eq!(quantile(&sorted, 1.0), 3.0);
        assert!((quantile(&sorted, 0.5) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_wider_confidence_wider_interval() {
        let values: Vec<f64> = (0..40).map(|i| if i % 3 == 0 { 1.0 } else { 0.0 }).collect();
        let narrow = ResultAggregator::new(5_000, 0.5, 7).aggregate(&values).unwrap();
        let wide = ResultAggregator::new(5_000, 0.99, 7).aggregate(&values).unwrap();
        assert!(wide.upper - wide.lower >= narrow.upper - narrow.lower);
    }
}
