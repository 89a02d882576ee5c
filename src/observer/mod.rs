use crate::fitting::ModelFitting;
use crate::model::NeuralMassModel;
use crate::params::ParamGroup;
use crate::stats::RecordingStat;

/// A read-only snapshot of a fitting session.
///
/// Design intent:
/// - Observers cannot mutate or steer the fit.
/// - Snapshotting is on-demand and can allocate; the training loop stays unchanged.
#[derive(Debug, Clone)]
pub struct FittingSnapshot {
    pub windows_processed: usize,
    pub last_loss: Option<f32>,
    pub last: Option<RecordingStat>,
    pub best: Option<RecordingStat>,
    /// Learning rates used by the most recent update (model, hyper).
    pub last_lrs: Option<(f32, f32)>,
    pub fitted: Vec<FittedParam>,
}

#[derive(Debug, Clone)]
pub struct FittedParam {
    pub name: String,
    pub group: ParamGroup,
    pub value: Vec<f32>,
}

pub struct FittingAdapter<'a, M, C> {
    fit: &'a ModelFitting<M, C>,
}

impl<'a, M: NeuralMassModel, C> FittingAdapter<'a, M, C> {
    pub fn new(fit: &'a ModelFitting<M, C>) -> Self {
        Self { fit }
    }

    pub fn snapshot(&self) -> FittingSnapshot {
        let stats = self.fit.stats();
        let last_lrs = stats
            .lr_model
            .last()
            .copied()
            .zip(stats.lr_hyper.last().copied());

        FittingSnapshot {
            windows_processed: stats.windows_processed(),
            last_loss: stats.last_loss(),
            last: stats.last_diagnostics().copied(),
            best: stats.best_diagnostics().copied(),
            last_lrs,
            fitted: self
                .fit
                .model()
                .params()
                .iter()
                .filter_map(|p| {
                    Some(FittedParam {
                        name: p.name.clone(),
                        group: p.group?,
                        value: p.value.data.clone(),
                    })
                })
                .collect(),
        }
    }
}
