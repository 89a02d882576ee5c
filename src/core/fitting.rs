//! Training and evaluation orchestration.
//!
//! `train` runs epochs → recordings → windows strictly in sequence. Every
//! window gets a fresh [`Tape`]: parameters and the previous window's
//! detached state go on as leaves, the model and the cost record onto it,
//! one backward pass produces the gradients, and the tape is dropped before
//! the next window starts. Backpropagation therefore never reaches further
//! than one window.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TrainConfig;
use crate::cost::{Cost, CostInputs};
use crate::error::{FitError, Result};
use crate::metrics::{Diagnostics, DEFAULT_TRANSIENT_STEPS};
use crate::model::{IcMode, ModelDims, NeuralMassModel, StateSnapshot, WindowInput, WindowOutputs};
use crate::params::ParamBindings;
use crate::recording::{OutputBundle, WindowAccumulator};
use crate::stats::{RecordingStat, TrainingStats};
use crate::tape::Tape;
use crate::tensor::Tensor;
use crate::update::{ParameterHistory, UpdateEngine};
use crate::window::{Stimulus, TrainingSet};

/// How a `train` run ended.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FitOutcome {
    /// A recording's FC correlation beat `r_lb` once `epoch_min` epochs had
    /// elapsed. Nothing after that recording was processed.
    Converged {
        epoch: usize,
        recording: usize,
        fc_cor: f32,
    },
    /// Every epoch ran to completion.
    Exhausted,
}

/// A fitting session: the model being fitted, the data it is fitted to,
/// and everything accumulated while fitting.
pub struct ModelFitting<M, C> {
    pub(crate) model: M,
    pub(crate) train_data: TrainingSet,
    pub(crate) num_epochs: usize,
    pub(crate) cost: C,
    pub(crate) stats: TrainingStats,
    pub(crate) last_recording: Option<OutputBundle>,
}

/// Sampling step of simulated trajectories: one sample per TR.
pub(crate) fn sample_step(dims: &ModelDims) -> f32 {
    dims.step_size * dims.steps_per_tr as f32
}

fn window_external(stimulus: Option<&Stimulus>, dims: &ModelDims, win: usize) -> Result<Tensor> {
    match stimulus {
        Some(s) => s.window(win, dims.trs_per_window),
        None => Ok(Tensor::zeros(&dims.input_shape())),
    }
}

/// Put one window's inputs on `tape` and run the model forward.
fn step_window<M: NeuralMassModel + ?Sized>(
    model: &mut M,
    tape: &mut Tape,
    bindings: &ParamBindings,
    external: Tensor,
    snap: &StateSnapshot,
) -> Result<WindowOutputs> {
    let input = WindowInput {
        external: tape.input(external),
        state: tape.input(snap.state.clone()),
        delay_history: tape.input(snap.delay_history.clone()),
    };
    model.forward(tape, bindings, input)
}

/// Free-running forward pass: `base_window_num` burn-in windows on zero
/// input, then `num_windows` windows on `stimulus` (zero if `None`).
///
/// Only the windows after the burn-in are returned. Parameters are read,
/// never updated.
pub fn simulate<M: NeuralMassModel + ?Sized>(
    model: &mut M,
    num_windows: usize,
    base_window_num: usize,
    stimulus: Option<&Stimulus>,
    mode: IcMode,
) -> Result<OutputBundle> {
    let dims = model.dims();
    let padded = match stimulus {
        Some(s) => {
            s.check_against(&dims, num_windows)?;
            Some(s.with_burn_in(base_window_num, dims.trs_per_window))
        }
        None => None,
    };

    let mut acc = WindowAccumulator::new(&model.variable_names());
    let mut snap = StateSnapshot::initial(model, mode);
    for win in 0..base_window_num + num_windows {
        let mut tape = Tape::new();
        let bindings = model.params().bind(&mut tape);
        let external = window_external(padded.as_ref(), &dims, win)?;
        let outputs = step_window(model, &mut tape, &bindings, external, &snap)?;
        if win >= base_window_num {
            acc.push(|name| outputs.var(name).map(|id| tape.value(id)))?;
        }
        snap = StateSnapshot::detach(&tape, &outputs);
    }
    acc.finish(sample_step(&dims))
}

impl<M: NeuralMassModel, C: Cost> ModelFitting<M, C> {
    pub fn new(model: M, train_data: TrainingSet, num_epochs: usize, cost: C) -> Result<Self> {
        train_data.check_against(&model.dims())?;
        model.primary_output()?;
        Ok(Self {
            model,
            train_data,
            num_epochs,
            cost,
            stats: TrainingStats::default(),
            last_recording: None,
        })
    }

    /// Windows per recording.
    pub fn num_windows(&self) -> usize {
        self.train_data.num_windows()
    }

    /// Fit the model's parameters.
    ///
    /// Statistics from any previous run are replaced. The first error aborts
    /// the run; parameters keep whatever updates were already applied.
    pub fn train(&mut self, cfg: &TrainConfig, stimulus: Option<&Stimulus>) -> Result<FitOutcome> {
        cfg.validate().map_err(FitError::Config)?;
        let dims = self.model.dims();
        let num_windows = self.num_windows();
        if let Some(s) = stimulus {
            s.check_against(&dims, num_windows)?;
        }
        let primary = self.model.primary_output()?.to_string();
        let names = self.model.variable_names();

        self.stats = TrainingStats {
            history: ParameterHistory::start(&self.model)?,
            ..TrainingStats::default()
        };
        let mut engine = UpdateEngine::new(
            self.model.params(),
            cfg,
            self.num_epochs.saturating_mul(num_windows),
        );

        info!(
            epochs = self.num_epochs,
            recordings = self.train_data.len(),
            windows = num_windows,
            "training started"
        );

        for epoch in 0..self.num_epochs {
            info!(epoch, "epoch");

            for rec_idx in 0..self.train_data.len() {
                let recording = &self.train_data.recordings()[rec_idx];
                let mut acc = WindowAccumulator::new(&names);
                let mut snap = StateSnapshot::initial(&mut self.model, IcMode::Training);
                let mut last_loss = f32::NAN;

                for win in 0..num_windows {
                    let mut tape = Tape::new();
                    let bindings = self.model.params().bind(&mut tape);
                    let external = window_external(stimulus, &dims, win)?;
                    let outputs = step_window(&mut self.model, &mut tape, &bindings, external, &snap)?;

                    let sim = outputs.var(&primary)?;
                    let emp = tape.input(recording.window(win)?);
                    let loss = self.cost.loss(
                        &mut tape,
                        &CostInputs {
                            sim,
                            emp,
                            outputs: &outputs,
                            params: self.model.params(),
                            bindings: &bindings,
                        },
                    )?;
                    if tape.numel(loss) != 1 {
                        return Err(FitError::shape("cost output", &[1], &tape.value(loss).shape));
                    }
                    acc.push(|name| outputs.var(name).map(|id| tape.value(id)))?;
                    last_loss = tape.data(loss)[0];

                    tape.backward(loss);
                    let grads = bindings.grads(&tape);
                    snap = StateSnapshot::detach(&tape, &outputs);
                    drop(tape);

                    let lrs = engine.apply(self.model.params_mut(), &grads);
                    self.stats.loss.push(last_loss);
                    self.stats.lr_model.push(lrs.model);
                    self.stats.lr_hyper.push(lrs.hyper);
                    self.stats.history.record(&self.model)?;

                    debug!(epoch, recording = rec_idx, window = win, loss = last_loss, "window");
                }

                let bundle = acc.finish(sample_step(&dims))?;
                let emp = recording.concatenated()?;
                let diagnostics =
                    Diagnostics::compute(&bundle.get(&primary)?.data, &emp, cfg.transient_steps)?;
                self.stats.diagnostics.push(RecordingStat {
                    epoch,
                    recording: rec_idx,
                    last_loss,
                    diagnostics,
                });
                self.last_recording = Some(bundle);

                let next = cfg.lr_scheduler.then(|| engine.current_lrs());
                info!(
                    epoch,
                    recording = rec_idx,
                    loss = last_loss,
                    fc_cor = diagnostics.fc_cor,
                    cos_sim = diagnostics.cos_sim,
                    lr_model = ?next.map(|l| l.model),
                    lr_hyper = ?next.map(|l| l.hyper),
                    "recording done"
                );

                if epoch >= cfg.epoch_min && diagnostics.fc_cor > cfg.r_lb {
                    info!(
                        epoch,
                        recording = rec_idx,
                        fc_cor = diagnostics.fc_cor,
                        r_lb = cfg.r_lb,
                        "converged"
                    );
                    return Ok(FitOutcome::Converged {
                        epoch,
                        recording: rec_idx,
                        fc_cor: diagnostics.fc_cor,
                    });
                }
            }
        }

        Ok(FitOutcome::Exhausted)
    }

    /// Run the fitted model forward with evaluation initial conditions and
    /// compare it with the first training recording.
    ///
    /// `base_window_num` burn-in windows on zero input run first and are
    /// discarded. No parameter is updated.
    pub fn evaluate(
        &mut self,
        base_window_num: usize,
        stimulus: Option<&Stimulus>,
    ) -> Result<Diagnostics> {
        let num_windows = self.num_windows();
        let bundle = simulate(
            &mut self.model,
            num_windows,
            base_window_num,
            stimulus,
            IcMode::Evaluation,
        )?;
        let primary = self.model.primary_output()?;
        let emp = self.train_data.first().concatenated()?;
        let diagnostics =
            Diagnostics::compute(&bundle.get(primary)?.data, &emp, DEFAULT_TRANSIENT_STEPS)?;
        info!(
            base_window_num,
            fc_cor = diagnostics.fc_cor,
            cos_sim = diagnostics.cos_sim,
            "evaluation"
        );
        self.last_recording = Some(bundle);
        Ok(diagnostics)
    }
}

impl<M, C> ModelFitting<M, C> {
    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn training_data(&self) -> &TrainingSet {
        &self.train_data
    }

    pub fn stats(&self) -> &TrainingStats {
        &self.stats
    }

    /// Output of the last simulated recording, from training or evaluation.
    pub fn last_recording(&self) -> Option<&OutputBundle> {
        self.last_recording.as_ref()
    }

    pub fn num_epochs(&self) -> usize {
        self.num_epochs
    }

    pub fn cost(&self) -> &C {
        &self.cost
    }
}
