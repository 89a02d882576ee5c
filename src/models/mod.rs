//! Reference models implementing [`NeuralMassModel`](crate::model::NeuralMassModel).

pub mod delayed_linear;

pub use delayed_linear::{DelayedLinear, DelayedLinearConfig};
