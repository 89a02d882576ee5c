#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::model::WindowOutputs;
use crate::params::{ParamBindings, ParameterSet};
use crate::tape::{BufId, Tape};

/// What a cost sees for one window.
pub struct CostInputs<'a> {
    /// Simulated primary output, `[channels, samples]`.
    pub sim: BufId,
    /// Empirical window, same shape as `sim`.
    pub emp: BufId,
    /// Every variable the model produced this window.
    pub outputs: &'a WindowOutputs,
    pub params: &'a ParameterSet,
    pub bindings: &'a ParamBindings,
}

/// A differentiable scalar objective recorded on the window's tape.
pub trait Cost {
    fn loss(&self, tape: &mut Tape, inputs: &CostInputs<'_>) -> Result<BufId>;
}

fn check_same_shape(tape: &Tape, sim: BufId, emp: BufId) -> Result<()> {
    let (s, e) = (&tape.value(sim).shape, &tape.value(emp).shape);
    if s != e {
        return Err(FitError::shape("simulated vs empirical window", e, s));
    }
    Ok(())
}

/// Root-mean-square error between simulated and empirical time series.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TimeSeriesCost;

impl Cost for TimeSeriesCost {
    fn loss(&self, tape: &mut Tape, inputs: &CostInputs<'_>) -> Result<BufId> {
        check_same_shape(tape, inputs.sim, inputs.emp)?;
        let diff = tape.sub(inputs.sim, inputs.emp);
        let sq = tape.square(diff);
        let mse = tape.mean(sq);
        Ok(tape.sqrt(mse))
    }
}

/// Gaussian prior on one parameter: adds `0.5 * precision * sum((theta - mean)^2)`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Prior {
    pub param: String,
    pub mean: f32,
    pub precision: f32,
}

impl Prior {
    pub fn new(param: &str, mean: f32, precision: f32) -> Self {
        Self {
            param: param.to_string(),
            mean,
            precision,
        }
    }
}

/// A data-fit cost regularized by priors on model parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PriorCost<C> {
    pub data: C,
    pub priors: Vec<Prior>,
}

impl<C: Cost> PriorCost<C> {
    pub fn new(data: C) -> Self {
        Self {
            data,
            priors: Vec::new(),
        }
    }

    pub fn with_prior(mut self, prior: Prior) -> Self {
        self.priors.push(prior);
        self
    }
}

impl<C: Cost> Cost for PriorCost<C> {
    fn loss(&self, tape: &mut Tape, inputs: &CostInputs<'_>) -> Result<BufId> {
        let mut total = self.data.loss(tape, inputs)?;
        for prior in &self.priors {
            // Validates the name against the model, not just the tape.
            inputs.params.get(&prior.param)?;
            let theta = inputs.bindings.get(&prior.param)?;
            let centered = tape.add_scalar(theta, -prior.mean);
            let sq = tape.square(centered);
            let s = tape.sum(sq);
            let term = tape.scale(s, 0.5 * prior.precision);
            total = tape.add(total, term);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamGroup;
    use crate::tensor::Tensor;
    use std::collections::BTreeMap;

    fn setup(sim: Vec<f32>, emp: Vec<f32>) -> (Tape, ParameterSet, ParamBindings, BufId, BufId) {
        let mut params = ParameterSet::new();
        params
            .insert("g", Tensor::scalar(2.0), Some(ParamGroup::Model))
            .unwrap();
        let mut tape = Tape::new();
        let bindings = params.bind(&mut tape);
        let n = sim.len();
        let s = tape.param(&Tensor::from_vec(&[1, n], sim).unwrap());
        let e = tape.input(Tensor::from_vec(&[1, emp.len()], emp).unwrap());
        (tape, params, bindings, s, e)
    }

    fn outputs() -> WindowOutputs {
        WindowOutputs {
            vars: BTreeMap::new(),
            current_state: 0,
            delay_history: 0,
        }
    }

    #[test]
    fn rmse_of_known_difference() {
        let (mut tape, params, bindings, s, e) = setup(vec![1.0, 2.0, 3.0, 4.0], vec![0.0; 4]);
        let out = outputs();
        let inputs = CostInputs {
            sim: s,
            emp: e,
            outputs: &out,
            params: &params,
            bindings: &bindings,
        };
        let l = TimeSeriesCost.loss(&mut tape, &inputs).unwrap();
        let expected = ((1.0 + 4.0 + 9.0 + 16.0) / 4.0f32).sqrt();
        assert!((tape.data(l)[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let (mut tape, params, bindings, s, e) = setup(vec![1.0, 2.0], vec![0.0; 3]);
        let out = outputs();
        let inputs = CostInputs {
            sim: s,
            emp: e,
            outputs: &out,
            params: &params,
            bindings: &bindings,
        };
        assert!(matches!(
            TimeSeriesCost.loss(&mut tape, &inputs),
            Err(FitError::Shape { .. })
        ));
    }

    #[test]
    fn prior_term_pulls_parameter_toward_mean() {
        let (mut tape, params, bindings, s, e) = setup(vec![1.0, 1.0], vec![1.0, 1.0]);
        let out = outputs();
        let inputs = CostInputs {
            sim: s,
            emp: e,
            outputs: &out,
            params: &params,
            bindings: &bindings,
        };
        // Identical windows: the data term is zero and only the prior contributes.
        let cost = PriorCost::new(TimeSeriesCost).with_prior(Prior::new("g", 0.5, 4.0));
        let l = cost.loss(&mut tape, &inputs).unwrap();
        // 0.5 * 4 * (2 - 0.5)^2 = 4.5 on top of a zero data term.
        assert!((tape.data(l)[0] - 4.5).abs() < 1e-6);

        tape.backward(l);
        let g = bindings.get("g").unwrap();
        // d/dg = 4 * (2 - 0.5) = 6
        assert!((tape.grad(g).unwrap()[0] - 6.0).abs() < 1e-5);
    }

    #[test]
    fn unknown_prior_parameter_is_reported() {
        let (mut tape, params, bindings, s, e) = setup(vec![1.0], vec![0.0]);
        let out = outputs();
        let inputs = CostInputs {
            sim: s,
            emp: e,
            outputs: &out,
            params: &params,
            bindings: &bindings,
        };
        let cost = PriorCost::new(TimeSeriesCost).with_prior(Prior::new("tau", 0.0, 1.0));
        assert!(matches!(
            cost.loss(&mut tape, &inputs),
            Err(FitError::UnknownParameter(_))
        ));
    }
}
