#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::params::{ParamGrads, ParameterSet};

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
        }
    }
}

#[derive(Debug, Clone)]
struct MomentBuf {
    m: Vec<f32>,
    v: Vec<f32>,
    /// Steps this slot actually received a gradient.
    step: u32,
}

/// Adam over a fixed list of parameter slots.
///
/// Slots without a gradient in a given step are skipped entirely, moments and
/// step counter included.
#[derive(Debug, Clone)]
pub struct Adam {
    pub config: AdamConfig,
    slots: Vec<usize>,
    moments: Vec<MomentBuf>,
}

impl Adam {
    pub fn new(params: &ParameterSet, slots: Vec<usize>, config: AdamConfig) -> Self {
        let moments = slots
            .iter()
            .map(|&s| {
                let n = params.by_slot(s).value.numel();
                MomentBuf {
                    m: vec![0.0; n],
                    v: vec![0.0; n],
                    step: 0,
                }
            })
            .collect();
        Self {
            config,
            slots,
            moments,
        }
    }

    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    /// One update with learning rate `lr` and first-moment decay `beta1`.
    pub fn step(&mut self, params: &mut ParameterSet, grads: &ParamGrads, lr: f32, beta1: f32) {
        let beta2 = self.config.beta2;
        let eps = self.config.eps;
        for (&slot, buf) in self.slots.iter().zip(self.moments.iter_mut()) {
            let Some(g) = grads.get(slot) else {
                continue;
            };
            buf.step = buf.step.saturating_add(1);
            let bc1 = 1.0 - beta1.powi(buf.step as i32);
            let bc2 = 1.0 - beta2.powi(buf.step as i32);
            let p = params.data_mut(slot);
            for i in 0..p.len() {
                buf.m[i] = beta1 * buf.m[i] + (1.0 - beta1) * g[i];
                buf.v[i] = beta2 * buf.v[i] + (1.0 - beta2) * g[i] * g[i];
                let m_hat = buf.m[i] / bc1;
                let v_hat = buf.v[i] / bc2;
                p[i] -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OneCycleConfig {
    /// Fraction of the cycle spent increasing the learning rate.
    pub pct_start: f32,
    /// initial_lr = max_lr / div_factor
    pub div_factor: f32,
    /// min_lr = initial_lr / final_div_factor
    pub final_div_factor: f32,
    pub base_momentum: f32,
    pub max_momentum: f32,
}

impl Default for OneCycleConfig {
    fn default() -> Self {
        Self {
            pct_start: 0.3,
            div_factor: 25.0,
            final_div_factor: 1e4,
            base_momentum: 0.85,
            max_momentum: 0.95,
        }
    }
}

fn cos_anneal(start: f32, end: f32, pct: f32) -> f32 {
    end + (start - end) / 2.0 * ((core::f32::consts::PI * pct).cos() + 1.0)
}

/// Two-phase cosine one-cycle schedule.
///
/// The learning rate rises from `max_lr / div_factor` to `max_lr` over the
/// first `pct_start` of the cycle and then anneals to the minimum; Adam's
/// `beta1` moves the opposite way between `max_momentum` and `base_momentum`.
#[derive(Debug, Clone)]
pub struct OneCycleLr {
    cfg: OneCycleConfig,
    initial_lr: f32,
    max_lr: f32,
    min_lr: f32,
    total_steps: usize,
    step: usize,
    warned_past_end: bool,
}

impl OneCycleLr {
    pub fn new(max_lr: f32, total_steps: usize, cfg: OneCycleConfig) -> Self {
        let initial_lr = max_lr / cfg.div_factor;
        Self {
            cfg,
            initial_lr,
            max_lr,
            min_lr: initial_lr / cfg.final_div_factor,
            total_steps: total_steps.max(1),
            step: 0,
            warned_past_end: false,
        }
    }

    /// (phase start value, phase end value, fraction through the phase) for
    /// the current step, given the per-phase endpoints.
    fn phase(&self, rise: (f32, f32), fall: (f32, f32)) -> (f32, f32, f32) {
        let up_end = self.cfg.pct_start * self.total_steps as f32 - 1.0;
        let down_end = self.total_steps as f32 - 1.0;
        let step = (self.step as f32).min(down_end);
        if step <= up_end {
            let pct = if up_end > 0.0 { step / up_end } else { 1.0 };
            (rise.0, rise.1, pct)
        } else {
            let span = down_end - up_end;
            let pct = if span > 0.0 {
                (step - up_end) / span
            } else {
                1.0
            };
            (fall.0, fall.1, pct)
        }
    }

    pub fn lr(&self) -> f32 {
        let (a, b, pct) = self.phase(
            (self.initial_lr, self.max_lr),
            (self.max_lr, self.min_lr),
        );
        cos_anneal(a, b, pct)
    }

    pub fn beta1(&self) -> f32 {
        let (hi, lo) = (self.cfg.max_momentum, self.cfg.base_momentum);
        let (a, b, pct) = self.phase((hi, lo), (lo, hi));
        cos_anneal(a, b, pct)
    }

    pub fn current_step(&self) -> usize {
        self.step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Advance one step. Past the end of the cycle the final values hold.
    pub fn step(&mut self) {
        self.step = self.step.saturating_add(1);
        // Stepping exactly `total_steps` times is the normal end of a run.
        if self.step > self.total_steps && !self.warned_past_end {
            self.warned_past_end = true;
            warn!(
                total_steps = self.total_steps,
                "one-cycle schedule stepped past its span; holding final learning rate"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamGroup;
    use crate::tape::Tape;
    use crate::tensor::Tensor;

    #[test]
    fn one_cycle_starts_low_peaks_then_anneals() {
        let mut s = OneCycleLr::new(0.05, 100, OneCycleConfig::default());
        assert!((s.lr() - 0.05 / 25.0).abs() < 1e-8);
        assert!((s.beta1() - 0.95).abs() < 1e-6);

        let mut peak = 0.0f32;
        let mut peak_at = 0;
        let mut last = 0.0;
        for i in 0..100 {
            if s.lr() > peak {
                peak = s.lr();
                peak_at = i;
            }
            last = s.lr();
            s.step();
        }
        assert!((peak - 0.05).abs() < 1e-6);
        assert!((28..=30).contains(&peak_at), "peak at {}", peak_at);
        let min_lr = 0.05 / 25.0 / 1e4;
        assert!((last - min_lr).abs() < 1e-9);
    }

    #[test]
    fn one_cycle_holds_after_span() {
        let mut s = OneCycleLr::new(0.1, 4, OneCycleConfig::default());
        for _ in 0..10 {
            s.step();
        }
        let min_lr = 0.1 / 25.0 / 1e4;
        assert!((s.lr() - min_lr).abs() < 1e-9);
        assert!((s.beta1() - 0.95).abs() < 1e-6);
    }

    #[test]
    fn adam_moves_against_gradient_by_lr_on_first_step() {
        let mut params = ParameterSet::new();
        params
            .insert("w", Tensor::from_vec(&[2], vec![1.0, -1.0]).unwrap(), Some(ParamGroup::Model))
            .unwrap();
        params
            .insert("frozen", Tensor::scalar(5.0), Some(ParamGroup::Model))
            .unwrap();

        let mut tape = Tape::new();
        let b = params.bind(&mut tape);
        let w = b.get("w").unwrap();
        let sq = tape.square(w);
        let l = tape.sum(sq);
        tape.backward(l);
        let grads = b.grads(&tape);

        let mut adam = Adam::new(&params, vec![0, 1], AdamConfig::default());
        adam.step(&mut params, &grads, 0.1, 0.9);

        // Bias-corrected first step is lr * sign(g).
        let w = params.value("w").unwrap();
        assert!((w.data[0] - 0.9).abs() < 1e-5);
        assert!((w.data[1] + 0.9).abs() < 1e-5);
        // No gradient: untouched.
        assert_eq!(params.value("frozen").unwrap().data[0], 5.0);
    }
}
