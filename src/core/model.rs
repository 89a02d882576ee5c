//! The contract a neural mass model fulfils to be fitted.
//!
//! The fitting loop treats the model as an opaque differentiable simulator:
//! it hands over one window of external input plus a detached state, and gets
//! back tape buffers for every state/output trajectory.

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::params::{ParamBindings, ParameterSet};
use crate::tape::{BufId, Tape};
use crate::tensor::Tensor;

/// Which initial conditions to draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IcMode {
    Training = 0,
    Evaluation = 1,
}

/// Fixed simulation grid of a model.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelDims {
    pub node_size: usize,
    pub output_size: usize,
    /// Integration steps per repetition time (TR).
    pub steps_per_tr: usize,
    /// TRs per fitting window.
    pub trs_per_window: usize,
    /// Integration step in model time units.
    pub step_size: f32,
}

impl ModelDims {
    /// Shape of one window of external input: `[node, steps_per_tr, trs_per_window]`.
    pub fn input_shape(&self) -> [usize; 3] {
        [self.node_size, self.steps_per_tr, self.trs_per_window]
    }

    /// Integration steps covered by one window.
    pub fn steps_per_window(&self) -> usize {
        self.steps_per_tr * self.trs_per_window
    }
}

/// Buffers a model receives for one window.
#[derive(Debug, Clone, Copy)]
pub struct WindowInput {
    /// `[node, steps_per_tr, trs_per_window]`
    pub external: BufId,
    pub state: BufId,
    pub delay_history: BufId,
}

/// Buffers a model produces for one window.
#[derive(Debug, Clone)]
pub struct WindowOutputs {
    /// One `[channels, samples]` buffer per state and output name.
    pub vars: BTreeMap<String, BufId>,
    /// Final state of the window; seeds the next window once detached.
    pub current_state: BufId,
    pub delay_history: BufId,
}

impl WindowOutputs {
    pub fn var(&self, name: &str) -> Result<BufId> {
        self.vars
            .get(name)
            .copied()
            .ok_or_else(|| FitError::UnknownVariable(name.to_string()))
    }
}

/// Plain-value simulation state carried across a window boundary.
///
/// Holds copies, never tape handles, so the next window's tape starts with no
/// path back into the previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub state: Tensor,
    pub delay_history: Tensor,
}

impl StateSnapshot {
    /// Fresh initial conditions from the model.
    pub fn initial<M: NeuralMassModel + ?Sized>(model: &mut M, mode: IcMode) -> Self {
        Self {
            state: model.create_ic(mode),
            delay_history: model.create_delay_ic(mode),
        }
    }

    /// Copy the window's final state and delay history off the tape.
    pub fn detach(tape: &Tape, outputs: &WindowOutputs) -> Self {
        Self {
            state: tape.value(outputs.current_state).clone(),
            delay_history: tape.value(outputs.delay_history).clone(),
        }
    }
}

/// A differentiable neural mass model.
///
/// `forward` records one window on `tape` using the parameter leaves in
/// `params`; it must produce a buffer for every name in `state_names` and
/// `output_names`. The first output name is the signal compared against the
/// empirical recording.
pub trait NeuralMassModel {
    fn dims(&self) -> ModelDims;

    fn state_names(&self) -> &[String];

    fn output_names(&self) -> &[String];

    fn params(&self) -> &ParameterSet;

    fn params_mut(&mut self) -> &mut ParameterSet;

    fn create_ic(&mut self, mode: IcMode) -> Tensor;

    fn create_delay_ic(&mut self, mode: IcMode) -> Tensor;

    fn forward(
        &mut self,
        tape: &mut Tape,
        params: &ParamBindings,
        input: WindowInput,
    ) -> Result<WindowOutputs>;

    /// Restrict parameter history to these names. `None` records every
    /// parameter except connectivity gains and the lead field.
    fn track_params(&self) -> Option<&[String]> {
        None
    }

    fn use_fit_gains(&self) -> bool {
        false
    }

    fn use_fit_lfm(&self) -> bool {
        false
    }

    /// Structural connectivity, row-major `[node, node]`.
    fn connectivity(&self) -> Option<&[f32]> {
        None
    }

    /// Connectivity after applying fitted gains.
    fn fitted_connectivity(&self) -> Option<Vec<f32>> {
        self.connectivity().map(|sc| sc.to_vec())
    }

    /// Lead field, row-major `[output, node]`.
    fn leadfield(&self) -> Option<&[f32]> {
        None
    }

    /// State and output names in bundle order.
    fn variable_names(&self) -> Vec<String> {
        self.state_names()
            .iter()
            .chain(self.output_names())
            .cloned()
            .collect()
    }

    /// Name of the variable fitted against empirical data.
    fn primary_output(&self) -> Result<&str> {
        self.output_names()
            .first()
            .map(String::as_str)
            .ok_or_else(|| FitError::UnknownVariable("<primary output>".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_copies_values_off_the_tape() {
        let mut tape = Tape::new();
        let s = tape.param(&Tensor::from_vec(&[2], vec![1.0, 2.0]).unwrap());
        let h = tape.param(&Tensor::from_vec(&[1, 2], vec![3.0, 4.0]).unwrap());
        let s2 = tape.scale(s, 2.0);
        let outputs = WindowOutputs {
            vars: BTreeMap::new(),
            current_state: s2,
            delay_history: h,
        };
        let snap = StateSnapshot::detach(&tape, &outputs);
        drop(tape);
        assert_eq!(snap.state.data, vec![2.0, 4.0]);
        assert_eq!(snap.delay_history.shape, vec![1, 2]);
    }

    #[test]
    fn missing_var_is_named() {
        let outputs = WindowOutputs {
            vars: BTreeMap::new(),
            current_state: 0,
            delay_history: 0,
        };
        match outputs.var("bold") {
            Err(FitError::UnknownVariable(n)) => assert_eq!(n, "bold"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
