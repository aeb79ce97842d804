//! Exponential learning-rate decay.

use serde::{Deserialize, Serialize};

use crate::error::{SpectraError, SpectraResult};
use crate::optimizer::TrainOptimizer;

/// `rate(step) = base_rate * decay_rate ^ (step / decay_step)`, with real
/// division, so the rate shrinks smoothly rather than once every `decay_step`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExponentialDecay {
    pub base_rate: f64,
    pub decay_step: u64,
    pub decay_rate: f64,
}

impl ExponentialDecay {
    /// Create a schedule.
    ///
    /// # Errors
    ///
    /// Rejects a non-positive base rate or decay rate and a zero decay step.
    pub fn new(base_rate: f64, decay_step: u64, decay_rate: f64) -> SpectraResult<Self> {
        if !(base_rate > 0.0) {
            return Err(SpectraError::configuration("learn_rate must be positive"));
        }
        if decay_step == 0 {
            return Err(SpectraError::configuration("decay_step must be positive"));
        }
        if !(decay_rate > 0.0) {
            return Err(SpectraError::configuration("decay_rate must be positive"));
        }
        Ok(Self {
            base_rate,
            decay_step,
            decay_rate,
        })
    }

    /// Learning rate after `step` completed updates.
    #[must_use]
    pub fn rate(&self, step: u64) -> f64 {
        let exponent = step as f64 / self.decay_step as f64;
        self.base_rate * self.decay_rate.powf(exponent)
    }

    /// Set the optimizer's rate for the update following `step` completed ones.
    pub fn apply(&self, step: u64, optimizer: &mut TrainOptimizer) -> f64 {
        let lr = self.rate(step);
        optimizer.set_learning_rate(lr);
        lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_at_zero_is_base() {
        let decay = ExponentialDecay::new(1e-3, 10_000, 0.96).unwrap();
        assert_eq!(decay.rate(0), 1e-3);
    }

    #[test]
    fn test_rate_at_decay_step_multiples() {
        let decay = ExponentialDecay::new(1e-3, 100, 0.5).unwrap();
        assert!((decay.rate(100) - 5e-4).abs() < 1e-12);
        assert!((decay.rate(200) - 2.5e-4).abs() < 1e-12);
    }

    #[test]
    fn test_rate_is_continuous_between_boundaries() {
        let decay = ExponentialDecay::new(1.0, 100, 0.25).unwrap();
        // halfway through the first period: 0.25^0.5
        assert!((decay.rate(50) - 0.5).abs() < 1e-12);
        assert!(decay.rate(1) < decay.rate(0));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(ExponentialDecay::new(0.0, 10, 0.9).is_err());
        assert!(ExponentialDecay::new(1e-3, 0, 0.9).is_err());
        assert!(ExponentialDecay::new(1e-3, 10, -1.0).is_err());
        assert!(ExponentialDecay::new(f64::NAN, 10, 0.9).is_err());
    }
}
