use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::tensor::Tensor;

/// A simulated `[channels, time]` trajectory with its sampling step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Recording {
    pub data: Tensor,
    /// Time between consecutive samples, in model time units.
    pub step_size: f32,
}

impl Recording {
    pub fn new(data: Tensor, step_size: f32) -> Self {
        Self { data, step_size }
    }

    pub fn channels(&self) -> usize {
        self.data.rows()
    }

    pub fn num_samples(&self) -> usize {
        self.data.cols()
    }

    /// Sample times starting at zero.
    pub fn times(&self) -> Vec<f32> {
        (0..self.num_samples())
            .map(|i| i as f32 * self.step_size)
            .collect()
    }
}

/// Every state and output variable of one simulated recording, by name.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OutputBundle {
    vars: BTreeMap<String, Recording>,
}

impl OutputBundle {
    pub fn get(&self, name: &str) -> Result<&Recording> {
        self.vars
            .get(name)
            .ok_or_else(|| FitError::UnknownVariable(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Recording)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub(crate) fn insert(&mut self, name: String, rec: Recording) {
        self.vars.insert(name, rec);
    }
}

/// Collects per-window trajectories of one recording, keyed by variable.
#[derive(Debug, Clone, Default)]
pub struct WindowAccumulator {
    windows: BTreeMap<String, Vec<Tensor>>,
    pushed: usize,
}

impl WindowAccumulator {
    pub fn new(names: &[String]) -> Self {
        Self {
            windows: names.iter().map(|n| (n.clone(), Vec::new())).collect(),
            pushed: 0,
        }
    }

    /// Buffer one window; `vars` must cover every declared name.
    pub fn push<'a>(&mut self, mut vars: impl FnMut(&str) -> Result<&'a Tensor>) -> Result<()> {
        for (name, buf) in self.windows.iter_mut() {
            buf.push(vars(name)?.clone());
        }
        self.pushed += 1;
        Ok(())
    }

    pub fn windows(&self) -> usize {
        self.pushed
    }

    /// Join each variable's windows along time.
    pub fn finish(self, step_size: f32) -> Result<OutputBundle> {
        let mut out = OutputBundle::default();
        for (name, blocks) in self.windows {
            let data = Tensor::concat_cols(&blocks)?;
            out.insert(name, Recording::new(data, step_size));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_concatenates_in_window_order() {
        let names = vec!["x".to_string(), "y".to_string()];
        let mut acc = WindowAccumulator::new(&names);
        let w0 = Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 5.0, 6.0]).unwrap();
        let w1 = Tensor::from_vec(&[2, 2], vec![3.0, 4.0, 7.0, 8.0]).unwrap();
        acc.push(|_| Ok(&w0)).unwrap();
        acc.push(|_| Ok(&w1)).unwrap();
        assert_eq!(acc.windows(), 2);

        let bundle = acc.finish(0.5).unwrap();
        let x = bundle.get("x").unwrap();
        assert_eq!(x.data.row(0), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(x.data.row(1), &[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(x.times(), vec![0.0, 0.5, 1.0, 1.5]);
        assert_eq!(bundle.names().collect::<Vec<_>>(), vec!["x", "y"]);
    }

    #[test]
    fn missing_variable_aborts_push() {
        let mut acc = WindowAccumulator::new(&["x".to_string()]);
        let err = acc
            .push(|name| Err(FitError::UnknownVariable(name.to_string())))
            .unwrap_err();
        assert!(matches!(err, FitError::UnknownVariable(n) if n == "x"));
        assert_eq!(acc.windows(), 0);
    }
}
