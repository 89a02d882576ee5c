#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::metrics::Diagnostics;
use crate::update::ParameterHistory;

/// Diagnostics of one finished recording pass.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RecordingStat {
    pub epoch: usize,
    pub recording: usize,
    /// Loss of the recording's last window.
    pub last_loss: f32,
    pub diagnostics: Diagnostics,
}

/// Everything a `train` run appends to. Owned by the fitting session and
/// written only by it.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainingStats {
    /// One loss per processed window, across all epochs.
    pub loss: Vec<f32>,
    /// Learning rate of each group for every processed window.
    pub lr_model: Vec<f32>,
    pub lr_hyper: Vec<f32>,
    pub diagnostics: Vec<RecordingStat>,
    pub history: ParameterHistory,
}

impl TrainingStats {
    pub fn windows_processed(&self) -> usize {
        self.loss.len()
    }

    pub fn last_loss(&self) -> Option<f32> {
        self.loss.last().copied()
    }

    pub fn last_diagnostics(&self) -> Option<&RecordingStat> {
        self.diagnostics.last()
    }

    /// Recording pass with the highest FC correlation. NaN scores never win.
    pub fn best_diagnostics(&self) -> Option<&RecordingStat> {
        self.diagnostics
            .iter()
            .filter(|s| !s.diagnostics.fc_cor.is_nan())
            .max_by(|a, b| a.diagnostics.fc_cor.total_cmp(&b.diagnostics.fc_cor))
    }
}
