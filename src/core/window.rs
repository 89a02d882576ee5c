#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::model::ModelDims;
use crate::tensor::Tensor;

/// Rank 3, no empty axis, and a flat buffer that fills the shape exactly.
fn check_layout(what: &'static str, data: &Tensor) -> Result<()> {
    if data.shape.len() != 3 {
        return Err(FitError::shape(what, &[3], &[data.shape.len()]));
    }
    if data.shape.iter().any(|&d| d == 0) {
        return Err(FitError::shape(what, &[1, 1, 1], &data.shape));
    }
    let expected: usize = data.shape.iter().product();
    if data.numel() != expected {
        return Err(FitError::shape(what, &[expected], &[data.numel()]));
    }
    Ok(())
}

/// One empirical recording laid out as `[window_count, channels, window_len]`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EmpiricalRecording {
    data: Tensor,
}

impl EmpiricalRecording {
    pub fn new(data: Tensor) -> Result<Self> {
        check_layout("empirical recording", &data)?;
        Ok(Self { data })
    }

    /// Split a continuous `[channels, time]` series into windows of
    /// `window_len` samples. `time` must be an exact multiple.
    pub fn from_series(series: &Tensor, window_len: usize) -> Result<Self> {
        let channels = series.rows();
        let time = series.cols();
        if series.shape.len() != 2 || window_len == 0 || time % window_len != 0 {
            return Err(FitError::shape(
                "continuous series",
                &[channels, (time / window_len.max(1)) * window_len.max(1)],
                &series.shape,
            ));
        }
        let window_count = time / window_len;
        let mut data = Vec::with_capacity(series.numel());
        for w in 0..window_count {
            for c in 0..channels {
                data.extend_from_slice(&series.row(c)[w * window_len..(w + 1) * window_len]);
            }
        }
        Self::new(Tensor::from_vec(&[window_count, channels, window_len], data)?)
    }

    pub fn window_count(&self) -> usize {
        self.data.shape[0]
    }

    pub fn channels(&self) -> usize {
        self.data.shape[1]
    }

    pub fn window_len(&self) -> usize {
        self.data.shape[2]
    }

    pub fn tensor(&self) -> &Tensor {
        &self.data
    }

    /// Window `idx` as `[channels, window_len]`.
    pub fn window(&self, idx: usize) -> Result<Tensor> {
        if idx >= self.window_count() {
            return Err(FitError::shape(
                "window index",
                &[self.window_count()],
                &[idx],
            ));
        }
        let n = self.channels() * self.window_len();
        Tensor::from_vec(
            &[self.channels(), self.window_len()],
            self.data.data[idx * n..(idx + 1) * n].to_vec(),
        )
    }

    /// All windows joined along time: `[channels, window_count * window_len]`.
    pub fn concatenated(&self) -> Result<Tensor> {
        let windows = (0..self.window_count())
            .map(|i| self.window(i))
            .collect::<Result<Vec<_>>>()?;
        Tensor::concat_cols(&windows)
    }
}

/// Recordings fitted together. All share the same window grid.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainingSet {
    recordings: Vec<EmpiricalRecording>,
}

impl TrainingSet {
    pub fn new(recordings: Vec<EmpiricalRecording>) -> Result<Self> {
        let Some(first) = recordings.first() else {
            return Err(FitError::EmptyTrainingSet);
        };
        let shape = first.tensor().shape.clone();
        for r in &recordings[1..] {
            r.tensor().ensure_shape("training recording", &shape)?;
        }
        Ok(Self { recordings })
    }

    pub fn single(recording: EmpiricalRecording) -> Self {
        Self {
            recordings: vec![recording],
        }
    }

    pub fn len(&self) -> usize {
        self.recordings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recordings.is_empty()
    }

    pub fn recordings(&self) -> &[EmpiricalRecording] {
        &self.recordings
    }

    pub fn first(&self) -> &EmpiricalRecording {
        &self.recordings[0]
    }

    pub fn num_windows(&self) -> usize {
        self.first().window_count()
    }

    /// Recordings must have one channel per model output and one sample per TR.
    pub fn check_against(&self, dims: &ModelDims) -> Result<()> {
        let first = self.first();
        let expected = [first.window_count(), dims.output_size, dims.trs_per_window];
        first
            .tensor()
            .ensure_shape("training recording grid", &expected)
    }
}

/// External input over a whole run: `[node, steps_per_tr, total_trs]`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Stimulus {
    data: Tensor,
}

impl Stimulus {
    pub fn new(data: Tensor) -> Result<Self> {
        check_layout("stimulus", &data)?;
        Ok(Self { data })
    }

    pub fn zeros(dims: &ModelDims, num_windows: usize) -> Self {
        Self {
            data: Tensor::zeros(&[
                dims.node_size,
                dims.steps_per_tr,
                num_windows * dims.trs_per_window,
            ]),
        }
    }

    pub fn tensor(&self) -> &Tensor {
        &self.data
    }

    pub fn total_trs(&self) -> usize {
        self.data.shape[2]
    }

    /// The stimulus must cover exactly `num_windows` windows of the model grid.
    pub fn check_against(&self, dims: &ModelDims, num_windows: usize) -> Result<()> {
        self.data.ensure_shape(
            "stimulus grid",
            &[
                dims.node_size,
                dims.steps_per_tr,
                num_windows * dims.trs_per_window,
            ],
        )
    }

    /// TRs `[idx * trs_per_window, (idx + 1) * trs_per_window)` as
    /// `[node, steps_per_tr, trs_per_window]`.
    pub fn window(&self, idx: usize, trs_per_window: usize) -> Result<Tensor> {
        let (nodes, steps, total) = (self.data.shape[0], self.data.shape[1], self.total_trs());
        let start = idx * trs_per_window;
        let end = start + trs_per_window;
        if end > total {
            return Err(FitError::shape("stimulus window", &[end], &[total]));
        }
        let mut out = Vec::with_capacity(nodes * steps * trs_per_window);
        for row in self.data.data.chunks_exact(total) {
            out.extend_from_slice(&row[start..end]);
        }
        Tensor::from_vec(&[nodes, steps, trs_per_window], out)
    }

    /// Prefix `base_windows` windows of zero input.
    pub fn with_burn_in(&self, base_windows: usize, trs_per_window: usize) -> Self {
        let (nodes, steps, total) = (self.data.shape[0], self.data.shape[1], self.total_trs());
        let pad = base_windows * trs_per_window;
        let mut out = Vec::with_capacity(nodes * steps * (pad + total));
        for row in self.data.data.chunks_exact(total) {
            out.extend(std::iter::repeat(0.0).take(pad));
            out.extend_from_slice(row);
        }
        Self {
            data: Tensor {
                data: out,
                shape: vec![nodes, steps, pad + total],
            },
        }
    }
}
