//! Delay-coupled linear neural mass model.
//!
//! Each node integrates
//!
//! ```text
//! x <- x + dt * (-decay * x + g * (W . x_delayed) + u) + sqrt(dt) * std_in * xi
//! ```
//!
//! where `W` is the structural connectivity (scaled element-wise by
//! `exp(gains_con)` when gains are fitted) and `x_delayed` is the state
//! `delay_steps` integration steps ago. One observation `y = lm . x` is taken
//! at the end of every TR.
//!
//! Small enough to differentiate step by step on a [`Tape`], rich enough to
//! exercise every part of the fitting loop: delay history, both parameter
//! groups, gain and lead-field fitting.

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::model::{IcMode, ModelDims, NeuralMassModel, WindowInput, WindowOutputs};
use crate::params::{ParamBindings, ParamGroup, ParameterSet, GAINS_PARAM, LEADFIELD_PARAM};
use crate::prng::Prng;
use crate::tape::Tape;
use crate::tensor::Tensor;

pub const STATE_NAME: &str = "x";
pub const OUTPUT_NAME: &str = "signal";

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DelayedLinearConfig {
    pub node_size: usize,
    pub output_size: usize,
    pub steps_per_tr: usize,
    pub trs_per_window: usize,
    pub step_size: f32,

    /// Integration steps between a node's state and its effect on neighbours.
    pub delay_steps: usize,

    /// Training initial conditions are drawn uniformly from `[0, ic_scale)`.
    pub ic_scale: f32,

    pub seed: u64,

    pub fit_gains: bool,
    pub fit_lfm: bool,

    /// Restrict parameter history to these names.
    pub track_params: Option<Vec<String>>,
}

impl Default for DelayedLinearConfig {
    fn default() -> Self {
        Self {
            node_size: 4,
            output_size: 4,
            steps_per_tr: 10,
            trs_per_window: 20,
            step_size: 0.05,
            delay_steps: 5,
            ic_scale: 0.5,
            seed: 1,
            fit_gains: false,
            fit_lfm: false,
            track_params: None,
        }
    }
}

impl DelayedLinearConfig {
    /// Validate the configuration, returning an error message if invalid.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.node_size == 0 || self.output_size == 0 {
            return Err("node_size and output_size must be > 0");
        }
        if self.steps_per_tr == 0 || self.trs_per_window == 0 {
            return Err("steps_per_tr and trs_per_window must be > 0");
        }
        if !self.step_size.is_finite() || self.step_size <= 0.0 {
            return Err("step_size must be finite and > 0");
        }
        if self.delay_steps == 0 {
            return Err("delay_steps must be >= 1");
        }
        if !self.ic_scale.is_finite() || self.ic_scale < 0.0 {
            return Err("ic_scale must be finite and >= 0");
        }
        Ok(())
    }

    pub fn with_nodes(mut self, node_size: usize, output_size: usize) -> Self {
        self.node_size = node_size;
        self.output_size = output_size;
        self
    }

    pub fn with_grid(mut self, steps_per_tr: usize, trs_per_window: usize) -> Self {
        self.steps_per_tr = steps_per_tr;
        self.trs_per_window = trs_per_window;
        self
    }

    pub fn with_step_size(mut self, step_size: f32) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn with_delay(mut self, delay_steps: usize) -> Self {
        self.delay_steps = delay_steps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_fit_gains(mut self, on: bool) -> Self {
        self.fit_gains = on;
        self
    }

    pub fn with_fit_lfm(mut self, on: bool) -> Self {
        self.fit_lfm = on;
        self
    }

    pub fn with_tracked(mut self, names: &[&str]) -> Self {
        self.track_params = Some(names.iter().map(|s| s.to_string()).collect());
        self
    }
}

/// Ring of `n` nodes, each coupled to both neighbours with weight 0.5.
pub fn ring_connectivity(n: usize) -> Tensor {
    let mut sc = Tensor::zeros(&[n, n]);
    if n > 1 {
        for i in 0..n {
            sc.data[i * n + (i + 1) % n] += 0.5;
            sc.data[i * n + (i + n - 1) % n] += 0.5;
        }
    }
    sc
}

/// `[outputs, nodes]` lead field reading node `r % nodes` into channel `r`.
pub fn identity_leadfield(outputs: usize, nodes: usize) -> Tensor {
    let mut lm = Tensor::zeros(&[outputs, nodes]);
    if nodes > 0 {
        for r in 0..outputs {
            lm.data[r * nodes + r % nodes] = 1.0;
        }
    }
    lm
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DelayedLinear {
    config: DelayedLinearConfig,
    /// Row-major `[node, node]`.
    sc: Vec<f32>,
    params: ParameterSet,
    rng: Prng,
    state_names: Vec<String>,
    output_names: Vec<String>,
}

impl DelayedLinear {
    pub fn new(config: DelayedLinearConfig, sc: Tensor, lm: Tensor) -> Result<Self> {
        config.validate().map_err(FitError::Config)?;
        let (n, m) = (config.node_size, config.output_size);
        sc.ensure_shape("structural connectivity", &[n, n])?;
        lm.ensure_shape("lead field", &[m, n])?;

        let mut params = ParameterSet::new();
        params.insert("decay", Tensor::scalar(1.0), Some(ParamGroup::Model))?;
        params.insert("g", Tensor::scalar(0.5), Some(ParamGroup::Model))?;
        params.insert("std_in", Tensor::scalar(0.05), Some(ParamGroup::Hyper))?;
        if config.fit_gains {
            params.insert(GAINS_PARAM, Tensor::zeros(&[n, n]), Some(ParamGroup::Model))?;
        }
        let lm_group = config.fit_lfm.then_some(ParamGroup::Model);
        params.insert(LEADFIELD_PARAM, lm, lm_group)?;

        Ok(Self {
            rng: Prng::new(config.seed),
            config,
            sc: sc.data,
            params,
            state_names: vec![STATE_NAME.to_string()],
            output_names: vec![OUTPUT_NAME.to_string()],
        })
    }

    /// Ring connectivity with an identity-like lead field.
    pub fn ring(config: DelayedLinearConfig) -> Result<Self> {
        let sc = ring_connectivity(config.node_size);
        let lm = identity_leadfield(config.output_size, config.node_size);
        Self::new(config, sc, lm)
    }

    pub fn config(&self) -> &DelayedLinearConfig {
        &self.config
    }

    /// Restart the noise stream.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = Prng::new(seed);
    }

    /// Set a scalar parameter.
    pub fn set_scalar(&mut self, name: &str, v: f32) -> Result<()> {
        self.params.set_value(name, Tensor::scalar(v))
    }

    pub fn scalar(&self, name: &str) -> Result<f32> {
        self.params.value(name).map(|t| t.data[0])
    }

    fn uniform(&mut self, len: usize) -> Vec<f32> {
        let hi = self.config.ic_scale;
        (0..len).map(|_| self.rng.gen_range_f32(0.0, hi)).collect()
    }
}

impl NeuralMassModel for DelayedLinear {
    fn dims(&self) -> ModelDims {
        ModelDims {
            node_size: self.config.node_size,
            output_size: self.config.output_size,
            steps_per_tr: self.config.steps_per_tr,
            trs_per_window: self.config.trs_per_window,
            step_size: self.config.step_size,
        }
    }

    fn state_names(&self) -> &[String] {
        &self.state_names
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn params(&self) -> &ParameterSet {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn create_ic(&mut self, mode: IcMode) -> Tensor {
        let n = self.config.node_size;
        match mode {
            IcMode::Training => Tensor {
                data: self.uniform(n),
                shape: vec![n],
            },
            IcMode::Evaluation => Tensor::zeros(&[n]),
        }
    }

    fn create_delay_ic(&mut self, mode: IcMode) -> Tensor {
        let shape = [self.config.delay_steps, self.config.node_size];
        match mode {
            IcMode::Training => Tensor {
                data: self.uniform(shape[0] * shape[1]),
                shape: shape.to_vec(),
            },
            IcMode::Evaluation => Tensor::zeros(&shape),
        }
    }

    fn forward(
        &mut self,
        tape: &mut Tape,
        p: &ParamBindings,
        input: WindowInput,
    ) -> Result<WindowOutputs> {
        let dims = self.dims();
        let (n, m) = (dims.node_size, dims.output_size);
        let (spt, tpw) = (dims.steps_per_tr, dims.trs_per_window);
        let d = self.config.delay_steps;
        let dt = dims.step_size;

        tape.value(input.external)
            .ensure_shape("external input", &dims.input_shape())?;
        if tape.numel(input.state) != n {
            return Err(FitError::shape("state", &[n], &tape.value(input.state).shape));
        }
        if tape.numel(input.delay_history) != d * n {
            return Err(FitError::shape(
                "delay history",
                &[d, n],
                &tape.value(input.delay_history).shape,
            ));
        }
        let external = tape.data(input.external).to_vec();

        let decay = p.get("decay")?;
        let g = p.get("g")?;
        let std_in = p.get("std_in")?;
        let lm = p.get(LEADFIELD_PARAM)?;

        let decay_v = tape.expand(decay, n);
        let g_v = tape.expand(g, n);
        let std_v = tape.expand(std_in, n);
        let noise_amp = tape.scale(std_v, dt.sqrt());

        let sc = tape.input(Tensor {
            data: self.sc.clone(),
            shape: vec![n, n],
        });
        let w = if self.config.fit_gains {
            let gains = p.get(GAINS_PARAM)?;
            let scale = tape.exp(gains);
            tape.mul(sc, scale)
        } else {
            sc
        };

        let mut x = input.state;
        let mut hist = input.delay_history;
        let mut xs = Vec::with_capacity(tpw);
        let mut ys = Vec::with_capacity(tpw);

        for t in 0..tpw {
            for s in 0..spt {
                let delayed = tape.slice(hist, (d - 1) * n, n);
                let coupling = tape.matvec(w, delayed, n, n);
                let coupled = tape.mul(g_v, coupling);
                let u = tape.input(Tensor {
                    data: (0..n).map(|i| external[(i * spt + s) * tpw + t]).collect(),
                    shape: vec![n],
                });
                let drive = tape.add(coupled, u);
                let leak = tape.mul(decay_v, x);
                let drift = tape.sub(drive, leak);
                let dx = tape.scale(drift, dt);
                let xi = tape.input(Tensor {
                    data: self.rng.gaussian_vec(n),
                    shape: vec![n],
                });
                let noise = tape.mul(noise_amp, xi);
                let stepped = tape.add(x, dx);
                x = tape.add(stepped, noise);

                // Newest first; the oldest row falls off the end.
                hist = if d == 1 {
                    x
                } else {
                    let kept = tape.slice(hist, 0, (d - 1) * n);
                    tape.concat(&[x, kept])
                };
            }
            xs.push(x);
            ys.push(tape.matvec(lm, x, m, n));
        }

        let x_time_major = tape.concat(&xs);
        let y_time_major = tape.concat(&ys);
        let mut vars = BTreeMap::new();
        vars.insert(STATE_NAME.to_string(), tape.transpose(x_time_major, tpw, n));
        vars.insert(OUTPUT_NAME.to_string(), tape.transpose(y_time_major, tpw, m));

        Ok(WindowOutputs {
            vars,
            current_state: x,
            delay_history: hist,
        })
    }

    fn track_params(&self) -> Option<&[String]> {
        self.config.track_params.as_deref()
    }

    fn use_fit_gains(&self) -> bool {
        self.config.fit_gains
    }

    fn use_fit_lfm(&self) -> bool {
        self.config.fit_lfm
    }

    fn connectivity(&self) -> Option<&[f32]> {
        Some(&self.sc)
    }

    fn fitted_connectivity(&self) -> Option<Vec<f32>> {
        match self.params.value(GAINS_PARAM) {
            Ok(gains) if self.config.fit_gains => Some(
                self.sc
                    .iter()
                    .zip(&gains.data)
                    .map(|(w, k)| w * k.exp())
                    .collect(),
            ),
            _ => Some(self.sc.clone()),
        }
    }

    fn leadfield(&self) -> Option<&[f32]> {
        self.params
            .value(LEADFIELD_PARAM)
            .ok()
            .map(|t| t.data.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StateSnapshot;

    fn small() -> DelayedLinearConfig {
        DelayedLinearConfig::default()
            .with_nodes(3, 2)
            .with_grid(2, 3)
            .with_delay(2)
    }

    fn run_window(model: &mut DelayedLinear, snap: &StateSnapshot) -> (Tape, ParamBindings, WindowOutputs) {
        let mut tape = Tape::new();
        let b = model.params().bind(&mut tape);
        let ext = tape.input(Tensor::zeros(&model.dims().input_shape()));
        let state = tape.input(snap.state.clone());
        let delay_history = tape.input(snap.delay_history.clone());
        let out = model
            .forward(
                &mut tape,
                &b,
                WindowInput {
                    external: ext,
                    state,
                    delay_history,
                },
            )
            .unwrap();
        (tape, b, out)
    }

    fn signal_sum(model: &DelayedLinear, snap: &StateSnapshot) -> f32 {
        let mut m = model.clone();
        let (mut tape, _, out) = run_window(&mut m, snap);
        let sig = out.var(OUTPUT_NAME).unwrap();
        let s = tape.sum(sig);
        tape.data(s)[0]
    }

    #[test]
    fn outputs_are_channels_by_trs() {
        let mut model = DelayedLinear::ring(small()).unwrap();
        let snap = StateSnapshot::initial(&mut model, IcMode::Training);
        assert_eq!(snap.delay_history.shape, vec![2, 3]);
        let (tape, _, out) = run_window(&mut model, &snap);
        assert_eq!(tape.value(out.var("x").unwrap()).shape, vec![3, 3]);
        assert_eq!(tape.value(out.var("signal").unwrap()).shape, vec![2, 3]);
        assert_eq!(tape.numel(out.current_state), 3);
        assert_eq!(tape.numel(out.delay_history), 6);
    }

    #[test]
    fn evaluation_ic_is_zero_and_training_ic_is_bounded() {
        let mut model = DelayedLinear::ring(small()).unwrap();
        let eval = StateSnapshot::initial(&mut model, IcMode::Evaluation);
        assert!(eval.state.data.iter().all(|&v| v == 0.0));
        let train = StateSnapshot::initial(&mut model, IcMode::Training);
        assert!(train.state.data.iter().all(|&v| (0.0..0.5).contains(&v)));
    }

    #[test]
    fn coupling_gradient_matches_finite_difference() {
        let cfg = small().with_fit_gains(true);
        let mut model = DelayedLinear::ring(cfg).unwrap();
        let snap = StateSnapshot::initial(&mut model, IcMode::Training);

        let mut m = model.clone();
        let (mut tape, b, out) = run_window(&mut m, &snap);
        let sig = out.var(OUTPUT_NAME).unwrap();
        let l = tape.sum(sig);
        tape.backward(l);
        let grads = b.grads(&tape);

        let eps = 1e-2;
        for name in ["g", "decay", "std_in"] {
            let slot = model.params().slot(name).unwrap();
            let analytic = grads.get(slot).unwrap()[0];
            let v = model.scalar(name).unwrap();
            let mut plus = model.clone();
            plus.set_scalar(name, v + eps).unwrap();
            let mut minus = model.clone();
            minus.set_scalar(name, v - eps).unwrap();
            let numeric = (signal_sum(&plus, &snap) - signal_sum(&minus, &snap)) / (2.0 * eps);
            assert!(
                (analytic - numeric).abs() < 1e-2 * (1.0 + numeric.abs()),
                "{}: analytic {} numeric {}",
                name,
                analytic,
                numeric
            );
        }
        // Gains receive gradient only where connectivity is non-zero.
        let gains = grads.get(model.params().slot(GAINS_PARAM).unwrap()).unwrap();
        assert_eq!(gains[0], 0.0);
        assert!(gains[1] != 0.0);
    }

    #[test]
    fn fixed_leadfield_is_not_in_a_group() {
        let model = DelayedLinear::ring(small()).unwrap();
        assert_eq!(model.params().get(LEADFIELD_PARAM).unwrap().group, None);
        let fitted = DelayedLinear::ring(small().with_fit_lfm(true)).unwrap();
        assert_eq!(
            fitted.params().get(LEADFIELD_PARAM).unwrap().group,
            Some(ParamGroup::Model)
        );
    }

    #[test]
    fn bad_external_input_shape_is_fatal() {
        let mut model = DelayedLinear::ring(small()).unwrap();
        let snap = StateSnapshot::initial(&mut model, IcMode::Evaluation);
        let mut tape = Tape::new();
        let b = model.params().bind(&mut tape);
        let ext = tape.input(Tensor::zeros(&[3, 2, 4]));
        let state = tape.input(snap.state);
        let delay_history = tape.input(snap.delay_history);
        let res = model.forward(
            &mut tape,
            &b,
            WindowInput {
                external: ext,
                state,
                delay_history,
            },
        );
        assert!(matches!(res, Err(FitError::Shape { .. })));
    }

    #[test]
    fn config_validation() {
        assert!(DelayedLinearConfig::default().validate().is_ok());
        let bad = DelayedLinearConfig::default().with_delay(0);
        assert!(matches!(
            DelayedLinear::ring(bad),
            Err(FitError::Config(_))
        ));
        assert!(DelayedLinear::new(small(), Tensor::zeros(&[2, 2]), identity_leadfield(2, 3)).is_err());
    }
}
