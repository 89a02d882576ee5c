//! Parameter update engine and parameter history.
//!
//! Two optimizer groups are owned here explicitly: one for model parameters,
//! one for hyper (noise) parameters. Each has its own learning rate and its
//! own optional one-cycle schedule, and nothing outside this module steps
//! them.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::error::{FitError, Result};
use crate::metrics::lower_triangle;
use crate::model::NeuralMassModel;
use crate::optim::{Adam, OneCycleLr};
use crate::params::{ParamGrads, ParamGroup, ParameterSet, GAINS_PARAM, LEADFIELD_PARAM};

/// Adam plus an optional schedule over one parameter group.
#[derive(Debug, Clone)]
pub struct GroupOptimizer {
    pub group: ParamGroup,
    adam: Adam,
    schedule: Option<OneCycleLr>,
    /// Fixed learning rate (also the schedule's peak).
    lr: f32,
}

impl GroupOptimizer {
    pub fn new(
        params: &ParameterSet,
        group: ParamGroup,
        lr: f32,
        cfg: &TrainConfig,
        total_steps: usize,
    ) -> Self {
        let adam = Adam::new(params, params.indices(group), cfg.adam);
        let schedule = cfg
            .lr_scheduler
            .then(|| OneCycleLr::new(lr, total_steps, cfg.one_cycle));
        Self {
            group,
            adam,
            schedule,
            lr,
        }
    }

    /// Learning rate the next step will use.
    pub fn lr(&self) -> f32 {
        self.schedule.as_ref().map_or(self.lr, OneCycleLr::lr)
    }

    pub fn beta1(&self) -> f32 {
        self.schedule
            .as_ref()
            .map_or(self.adam.config.beta1, OneCycleLr::beta1)
    }

    pub fn slots(&self) -> &[usize] {
        self.adam.slots()
    }

    pub fn schedule(&self) -> Option<&OneCycleLr> {
        self.schedule.as_ref()
    }

    fn step(&mut self, params: &mut ParameterSet, grads: &ParamGrads) {
        let (lr, beta1) = (self.lr(), self.beta1());
        self.adam.step(params, grads, lr, beta1);
    }

    fn advance(&mut self) {
        if let Some(s) = self.schedule.as_mut() {
            s.step();
        }
    }
}

/// Learning rates in force for one update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrStep {
    pub model: f32,
    pub hyper: f32,
}

#[derive(Debug, Clone)]
pub struct UpdateEngine {
    model: GroupOptimizer,
    hyper: GroupOptimizer,
}

impl UpdateEngine {
    /// `total_steps` is the schedule span, `epochs * windows_per_recording`.
    pub fn new(params: &ParameterSet, cfg: &TrainConfig, total_steps: usize) -> Self {
        Self {
            model: GroupOptimizer::new(params, ParamGroup::Model, cfg.learning_rate, cfg, total_steps),
            hyper: GroupOptimizer::new(params, ParamGroup::Hyper, cfg.lr_hyper, cfg, total_steps),
        }
    }

    pub fn model_group(&self) -> &GroupOptimizer {
        &self.model
    }

    pub fn hyper_group(&self) -> &GroupOptimizer {
        &self.hyper
    }

    /// Learning rates the next `apply` will use.
    pub fn current_lrs(&self) -> LrStep {
        LrStep {
            model: self.model.lr(),
            hyper: self.hyper.lr(),
        }
    }

    /// One optimizer step per group (hyper first, then model), then one
    /// schedule step per group.
    pub fn apply(&mut self, params: &mut ParameterSet, grads: &ParamGrads) -> LrStep {
        let used = self.current_lrs();
        self.hyper.step(params, grads);
        self.model.step(params, grads);
        self.hyper.advance();
        self.model.advance();
        used
    }
}

/// Append-only record of tracked parameter values, one snapshot at the start
/// of training and one after every update.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParameterHistory {
    /// `(name, snapshots)`; every snapshot is the flattened value.
    series: Vec<(String, Vec<Vec<f32>>)>,
    /// Strict lower triangle of the connectivity, when gains are fitted.
    weights: Option<Vec<Vec<f32>>>,
    /// Flattened lead field, when it is fitted.
    leadfield: Option<Vec<Vec<f32>>>,
    snapshots: usize,
}

fn tracked_names<M: NeuralMassModel + ?Sized>(model: &M) -> Vec<String> {
    match model.track_params() {
        Some(names) => names.to_vec(),
        None => model
            .params()
            .names()
            .filter(|n| *n != GAINS_PARAM && *n != LEADFIELD_PARAM)
            .map(str::to_string)
            .collect(),
    }
}

impl ParameterHistory {
    /// Start a history with the model's current (initial) values.
    pub fn start<M: NeuralMassModel + ?Sized>(model: &M) -> Result<Self> {
        let names = tracked_names(model);
        let mut series = Vec::with_capacity(names.len());
        for name in names {
            let v = model.params().value(&name)?.data.clone();
            series.push((name, vec![v]));
        }

        let weights = if model.use_fit_gains() {
            let sc = model
                .connectivity()
                .ok_or_else(|| FitError::UnknownParameter("sc".to_string()))?;
            Some(vec![lower_triangle(sc, model.dims().node_size)])
        } else {
            None
        };
        let leadfield = if model.use_fit_lfm() {
            Some(vec![leadfield_of(model)?])
        } else {
            None
        };

        Ok(Self {
            series,
            weights,
            leadfield,
            snapshots: 1,
        })
    }

    /// Append the model's current values.
    pub fn record<M: NeuralMassModel + ?Sized>(&mut self, model: &M) -> Result<()> {
        for (name, snaps) in &mut self.series {
            snaps.push(model.params().value(name)?.data.clone());
        }
        if let Some(w) = self.weights.as_mut() {
            let sc = model
                .fitted_connectivity()
                .ok_or_else(|| FitError::UnknownParameter("sc_fitted".to_string()))?;
            w.push(lower_triangle(&sc, model.dims().node_size));
        }
        if let Some(l) = self.leadfield.as_mut() {
            l.push(leadfield_of(model)?);
        }
        self.snapshots += 1;
        Ok(())
    }

    /// Snapshots taken so far, initial one included.
    pub fn len(&self) -> usize {
        self.snapshots
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots == 0
    }

    /// Snapshots recorded after an update; equals the windows processed.
    pub fn steps(&self) -> usize {
        self.snapshots.saturating_sub(1)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.series.iter().map(|(n, _)| n.as_str())
    }

    pub fn series(&self, name: &str) -> Option<&[Vec<f32>]> {
        self.series
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.as_slice())
    }

    pub fn weights(&self) -> Option<&[Vec<f32>]> {
        self.weights.as_deref()
    }

    pub fn leadfield(&self) -> Option<&[Vec<f32>]> {
        self.leadfield.as_deref()
    }

    pub(crate) fn from_parts(
        series: Vec<(String, Vec<Vec<f32>>)>,
        weights: Option<Vec<Vec<f32>>>,
        leadfield: Option<Vec<Vec<f32>>>,
        snapshots: usize,
    ) -> Self {
        Self {
            series,
            weights,
            leadfield,
            snapshots,
        }
    }

    pub(crate) fn raw_series(&self) -> &[(String, Vec<Vec<f32>>)] {
        &self.series
    }
}

fn leadfield_of<M: NeuralMassModel + ?Sized>(model: &M) -> Result<Vec<f32>> {
    model
        .leadfield()
        .map(<[f32]>::to_vec)
        .ok_or_else(|| FitError::UnknownParameter(LEADFIELD_PARAM.to_string()))
}
