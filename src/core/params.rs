use std::collections::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::tape::{BufId, Tape};
use crate::tensor::Tensor;

/// Name of the structural-connectivity gain parameter. Tracked through
/// `ParameterHistory::weights`, never through the per-parameter series.
pub const GAINS_PARAM: &str = "gains_con";

/// Name of the lead-field parameter. Tracked through
/// `ParameterHistory::leadfield`, never through the per-parameter series.
pub const LEADFIELD_PARAM: &str = "lm";

/// Which optimizer a fitted parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ParamGroup {
    /// Biophysical / structural parameters.
    Model,
    /// Noise and covariance parameters.
    Hyper,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Parameter {
    pub name: String,
    pub value: Tensor,
    /// `None` keeps the parameter fixed during fitting.
    pub group: Option<ParamGroup>,
}

/// Named model parameters with an explicit name → slot index.
///
/// Models populate the set at construction time; the update engine and the
/// history tracker address parameters through it instead of reflecting over
/// model fields.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParameterSet {
    params: Vec<Parameter>,
    #[cfg_attr(feature = "serde", serde(skip))]
    index: HashMap<String, usize>,
}

impl PartialEq for ParameterSet {
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params
    }
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: &str,
        value: Tensor,
        group: Option<ParamGroup>,
    ) -> Result<usize> {
        if self.slot(name).is_some() {
            return Err(FitError::DuplicateParameter(name.to_string()));
        }
        let slot = self.params.len();
        self.params.push(Parameter {
            name: name.to_string(),
            value,
            group,
        });
        self.index.insert(name.to_string(), slot);
        Ok(slot)
    }

    /// Slot of `name`. Falls back to a linear scan when the index has not been
    /// rebuilt (e.g. right after deserialization).
    pub fn slot(&self, name: &str) -> Option<usize> {
        if self.index.len() == self.params.len() {
            return self.index.get(name).copied();
        }
        self.params.iter().position(|p| p.name == name)
    }

    pub fn rebuild_index(&mut self) {
        self.index = self
            .params
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
    }

    pub fn get(&self, name: &str) -> Result<&Parameter> {
        self.slot(name)
            .map(|i| &self.params[i])
            .ok_or_else(|| FitError::UnknownParameter(name.to_string()))
    }

    pub fn value(&self, name: &str) -> Result<&Tensor> {
        self.get(name).map(|p| &p.value)
    }

    /// Replace a parameter value, keeping its shape.
    pub fn set_value(&mut self, name: &str, value: Tensor) -> Result<()> {
        let slot = self
            .slot(name)
            .ok_or_else(|| FitError::UnknownParameter(name.to_string()))?;
        let current = &mut self.params[slot];
        value.ensure_shape("parameter value", &current.value.shape)?;
        current.value = value;
        Ok(())
    }

    pub fn set_group(&mut self, name: &str, group: Option<ParamGroup>) -> Result<()> {
        let slot = self
            .slot(name)
            .ok_or_else(|| FitError::UnknownParameter(name.to_string()))?;
        self.params[slot].group = group;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    pub(crate) fn by_slot(&self, slot: usize) -> &Parameter {
        &self.params[slot]
    }

    pub(crate) fn data_mut(&mut self, slot: usize) -> &mut [f32] {
        &mut self.params[slot].value.data
    }

    /// Slots belonging to `group`, in insertion order.
    pub fn indices(&self, group: ParamGroup) -> Vec<usize> {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.group == Some(group))
            .map(|(i, _)| i)
            .collect()
    }

    /// Copy every parameter onto `tape` as a trainable leaf.
    pub fn bind(&self, tape: &mut Tape) -> ParamBindings {
        let ids = self.params.iter().map(|p| tape.param(&p.value)).collect();
        let names = self.params.iter().map(|p| p.name.clone()).collect();
        ParamBindings { ids, names }
    }
}

/// Buffer ids of a [`ParameterSet`] on one window's tape, slot-aligned.
#[derive(Debug, Clone)]
pub struct ParamBindings {
    ids: Vec<BufId>,
    names: Vec<String>,
}

impl ParamBindings {
    pub fn get(&self, name: &str) -> Result<BufId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.ids[i])
            .ok_or_else(|| FitError::UnknownParameter(name.to_string()))
    }

    pub fn id(&self, slot: usize) -> BufId {
        self.ids[slot]
    }

    /// Copy gradients off the tape. A fresh `ParamGrads` per window plays the
    /// role of zeroing the accumulated gradients.
    pub fn grads(&self, tape: &Tape) -> ParamGrads {
        ParamGrads {
            grads: self
                .ids
                .iter()
                .map(|&id| tape.grad(id).map(|g| g.to_vec()))
                .collect(),
        }
    }
}

/// Per-slot gradients from one backward pass. `None` where no gradient flowed.
#[derive(Debug, Clone, Default)]
pub struct ParamGrads {
    grads: Vec<Option<Vec<f32>>>,
}

impl ParamGrads {
    pub fn get(&self, slot: usize) -> Option<&[f32]> {
        self.grads.get(slot).and_then(|g| g.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_set() -> ParameterSet {
        let mut set = ParameterSet::new();
        set.insert("a", Tensor::scalar(1.0), Some(ParamGroup::Model))
            .unwrap();
        set.insert("b", Tensor::zeros(&[2, 2]), Some(ParamGroup::Hyper))
            .unwrap();
        set.insert("c", Tensor::scalar(3.0), None).unwrap();
        set
    }

    #[test]
    fn groups_partition_fitted_params() {
        let set = make_set();
        assert_eq!(set.indices(ParamGroup::Model), vec![0]);
        assert_eq!(set.indices(ParamGroup::Hyper), vec![1]);
    }

    #[test]
    fn duplicate_and_unknown_names_are_errors() {
        let mut set = make_set();
        assert!(matches!(
            set.insert("a", Tensor::scalar(0.0), None),
            Err(FitError::DuplicateParameter(_))
        ));
        assert!(matches!(set.get("zz"), Err(FitError::UnknownParameter(_))));
    }

    #[test]
    fn set_value_checks_shape() {
        let mut set = make_set();
        assert!(set.set_value("b", Tensor::zeros(&[4])).is_err());
        set.set_value("b", Tensor::zeros(&[2, 2])).unwrap();
    }

    #[test]
    fn slot_lookup_survives_missing_index() {
        let mut set = make_set();
        set.index.clear();
        assert_eq!(set.slot("c"), Some(2));
        set.rebuild_index();
        assert_eq!(set.slot("b"), Some(1));
    }

    #[test]
    fn bindings_collect_gradients_by_slot() {
        let set = make_set();
        let mut tape = Tape::new();
        let b = set.bind(&mut tape);
        let a = b.get("a").unwrap();
        let l = tape.square(a);
        tape.backward(l);
        let grads = b.grads(&tape);
        assert_eq!(grads.get(0), Some(&[2.0][..]));
        assert!(grads.get(1).is_none());
    }
}
