use std::io;

use thiserror::Error;

/// Errors surfaced by fitting, evaluation and session persistence.
///
/// Every variant is fatal for the operation that produced it: nothing in the
/// fitting loop retries or rolls back.
#[derive(Debug, Error)]
pub enum FitError {
    /// Caller-supplied data does not match the grid the model expects.
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    Shape {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    #[error("duplicate parameter `{0}`")]
    DuplicateParameter(String),

    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("invalid configuration: {0}")]
    Config(&'static str),

    #[error("training set is empty")]
    EmptyTrainingSet,

    #[error("bad session image: {0}")]
    Image(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[cfg(feature = "serde")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FitError {
    pub(crate) fn shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        FitError::Shape {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FitError>;
