#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::metrics::DEFAULT_TRANSIENT_STEPS;
use crate::optim::{AdamConfig, OneCycleConfig};

/// Knobs for one `train` run.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainConfig {
    /// Peak learning rate of the model-parameter group.
    pub learning_rate: f32,
    /// Peak learning rate of the hyperparameter (noise) group.
    pub lr_hyper: f32,

    /// Early stopping is only considered once this many epochs have elapsed.
    pub epoch_min: usize,
    /// Stop as soon as a recording's FC correlation exceeds this bound.
    pub r_lb: f32,

    /// Drive both groups with a cosine one-cycle schedule.
    pub lr_scheduler: bool,

    /// Simulated steps dropped before the FC diagnostic.
    pub transient_steps: usize,

    pub adam: AdamConfig,
    pub one_cycle: OneCycleConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            lr_hyper: 0.05 / 40.0,
            epoch_min: 10,
            r_lb: 0.85,
            lr_scheduler: true,
            transient_steps: DEFAULT_TRANSIENT_STEPS,
            adam: AdamConfig::default(),
            one_cycle: OneCycleConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Validate the configuration, returning an error message if invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err("learning_rate must be finite and > 0");
        }
        if !self.lr_hyper.is_finite() || self.lr_hyper <= 0.0 {
            return Err("lr_hyper must be finite and > 0");
        }
        if !self.r_lb.is_finite() {
            return Err("r_lb must be finite");
        }
        if !(0.0..1.0).contains(&self.adam.beta1) || !(0.0..1.0).contains(&self.adam.beta2) {
            return Err("adam betas must be in [0, 1)");
        }
        if !self.adam.eps.is_finite() || self.adam.eps <= 0.0 {
            return Err("adam eps must be finite and > 0");
        }
        let oc = &self.one_cycle;
        if !(oc.pct_start > 0.0 && oc.pct_start < 1.0) {
            return Err("one_cycle pct_start must be in (0, 1)");
        }
        if oc.div_factor <= 0.0 || oc.final_div_factor <= 0.0 {
            return Err("one_cycle div factors must be > 0");
        }
        if oc.base_momentum > oc.max_momentum {
            return Err("one_cycle base_momentum must be <= max_momentum");
        }
        Ok(())
    }

    pub fn with_learning_rates(mut self, model: f32, hyper: f32) -> Self {
        self.learning_rate = model;
        self.lr_hyper = hyper;
        self
    }

    pub fn with_early_stop(mut self, epoch_min: usize, r_lb: f32) -> Self {
        self.epoch_min = epoch_min;
        self.r_lb = r_lb;
        self
    }

    pub fn with_scheduler(mut self, enabled: bool) -> Self {
        self.lr_scheduler = enabled;
        self
    }

    pub fn with_transient(mut self, steps: usize) -> Self {
        self.transient_steps = steps;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = TrainConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.epoch_min, 10);
        assert_eq!(cfg.transient_steps, 10);
        assert!((cfg.lr_hyper - 0.00125).abs() < 1e-9);
    }

    #[test]
    fn rejects_bad_learning_rates() {
        let cfg = TrainConfig::default().with_learning_rates(0.0, 0.1);
        assert!(cfg.validate().is_err());
        let cfg = TrainConfig::default().with_learning_rates(0.1, f32::NAN);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_finite_bound() {
        let cfg = TrainConfig::default().with_early_stop(0, f32::INFINITY);
        assert_eq!(cfg.validate(), Err("r_lb must be finite"));
    }
}
