//! # nmfit
//!
//! Fit the parameters of a neural mass model to empirical neuroimaging time
//! series by gradient descent through a differentiable simulator.
//!
//! The model is simulated one window at a time. Each window is recorded on
//! its own reverse-mode [`tape`], compared with the matching window of the
//! recording by a [`cost`], and the gradients update two independent
//! parameter groups (model and hyper/noise parameters), each with its own
//! Adam optimizer and one-cycle learning-rate schedule. State crosses window
//! boundaries as plain values, so gradients never reach further back than one
//! window.
//!
//! ## Quick Start
//!
//! ```
//! use nmfit::prelude::*;
//!
//! let cfg = DelayedLinearConfig::default().with_grid(2, 5);
//!
//! // Synthesise a recording from a ground-truth model.
//! let mut truth = DelayedLinear::ring(cfg.clone().with_seed(7)).unwrap();
//! truth.set_scalar("g", 0.8).unwrap();
//! let sim = simulate(&mut truth, 4, 1, None, IcMode::Training).unwrap();
//! let rec = EmpiricalRecording::from_series(&sim.get("signal").unwrap().data, 5).unwrap();
//!
//! // Fit a fresh model to it.
//! let model = DelayedLinear::ring(cfg).unwrap();
//! let mut fit = ModelFitting::new(model, TrainingSet::single(rec), 2, TimeSeriesCost).unwrap();
//! fit.train(&TrainConfig::default().with_transient(0), None).unwrap();
//! assert_eq!(fit.stats().windows_processed(), 2 * 4);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): serialization derives and session save/load
//! - `parallel`: compute functional-connectivity matrices across channels with rayon
//!
//! ## Modules
//!
//! - [`fitting`]: the training / evaluation loop
//! - [`model`]: the contract a fitted model implements
//! - [`update`]: optimizer groups and parameter history
//! - [`metrics`]: FC correlation and cosine similarity diagnostics
//! - [`storage`]: binary session images
//! - [`observer`]: read-only observation adapters
//! - [`models`]: bundled reference models

#[path = "core/error.rs"]
pub mod error;

#[path = "core/tensor.rs"]
pub mod tensor;

#[path = "core/tape.rs"]
pub mod tape;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/params.rs"]
pub mod params;

#[path = "core/model.rs"]
pub mod model;

#[path = "core/window.rs"]
pub mod window;

#[path = "core/cost.rs"]
pub mod cost;

#[path = "core/metrics.rs"]
pub mod metrics;

#[path = "core/optim.rs"]
pub mod optim;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/update.rs"]
pub mod update;

#[path = "core/recording.rs"]
pub mod recording;

#[path = "core/stats.rs"]
pub mod stats;

#[path = "core/fitting.rs"]
pub mod fitting;

#[path = "core/storage.rs"]
pub mod storage;

pub mod observer;

pub mod models;

/// Prelude module for convenient imports.
///
/// ```
/// use nmfit::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::TrainConfig;
    pub use crate::cost::{Cost, CostInputs, Prior, PriorCost, TimeSeriesCost};
    pub use crate::error::{FitError, Result};
    pub use crate::fitting::{simulate, FitOutcome, ModelFitting};
    pub use crate::metrics::Diagnostics;
    pub use crate::model::{IcMode, ModelDims, NeuralMassModel, StateSnapshot, WindowInput, WindowOutputs};
    pub use crate::models::delayed_linear::{DelayedLinear, DelayedLinearConfig};
    pub use crate::observer::{FittingAdapter, FittingSnapshot};
    pub use crate::optim::{AdamConfig, OneCycleConfig};
    pub use crate::params::{ParamBindings, ParamGroup, ParameterSet};
    pub use crate::recording::{OutputBundle, Recording};
    pub use crate::stats::TrainingStats;
    pub use crate::tape::{BufId, Tape};
    pub use crate::tensor::Tensor;
    pub use crate::window::{EmpiricalRecording, Stimulus, TrainingSet};
}
