#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// Dense row-major `f32` array.
///
/// Two-dimensional tensors are laid out as `[channels, time]` throughout the
/// crate, so concatenating windows is a column-wise append.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            data: vec![0.0; shape.iter().product()],
            shape: shape.to_vec(),
        }
    }

    pub fn scalar(v: f32) -> Self {
        Self {
            data: vec![v],
            shape: vec![1],
        }
    }

    /// Wrap `data` with `shape`, failing if the element counts disagree.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let n: usize = shape.iter().product();
        if n != data.len() {
            return Err(FitError::shape("tensor data", &[n], &[data.len()]));
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
        })
    }

    #[inline]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Number of columns of a 2-D tensor (product of trailing dims otherwise).
    #[inline]
    pub fn cols(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn row(&self, i: usize) -> &[f32] {
        let c = self.cols();
        &self.data[i * c..(i + 1) * c]
    }

    /// Keep columns `start..` of a 2-D tensor.
    pub fn slice_cols(&self, start: usize) -> Tensor {
        let rows = self.rows();
        let cols = self.cols();
        let start = start.min(cols);
        let kept = cols - start;
        let mut data = Vec::with_capacity(rows * kept);
        for r in 0..rows {
            data.extend_from_slice(&self.row(r)[start..]);
        }
        Tensor {
            data,
            shape: vec![rows, kept],
        }
    }

    /// Concatenate 2-D blocks along the column (time) axis.
    pub fn concat_cols(blocks: &[Tensor]) -> Result<Tensor> {
        let Some(first) = blocks.first() else {
            return Ok(Tensor::zeros(&[0, 0]));
        };
        let rows = first.rows();
        for b in blocks {
            if b.shape.len() != 2 || b.rows() != rows {
                return Err(FitError::shape("concatenated block", &[rows, b.cols()], &b.shape));
            }
        }
        let total: usize = blocks.iter().map(|b| b.cols()).sum();
        let mut data = Vec::with_capacity(rows * total);
        for r in 0..rows {
            for b in blocks {
                data.extend_from_slice(b.row(r));
            }
        }
        Ok(Tensor {
            data,
            shape: vec![rows, total],
        })
    }

    pub fn ensure_shape(&self, what: &'static str, expected: &[usize]) -> Result<()> {
        if self.shape != expected {
            return Err(FitError::shape(what, expected, &self.shape));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_wrong_len() {
        assert!(Tensor::from_vec(&[2, 3], vec![0.0; 5]).is_err());
        assert!(Tensor::from_vec(&[2, 3], vec![0.0; 6]).is_ok());
    }

    #[test]
    fn concat_cols_appends_time() {
        let a = Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::from_vec(&[2, 1], vec![5.0, 6.0]).unwrap();
        let c = Tensor::concat_cols(&[a, b]).unwrap();
        assert_eq!(c.shape, vec![2, 3]);
        assert_eq!(c.data, vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);
    }

    #[test]
    fn slice_cols_drops_prefix() {
        let a = Tensor::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let s = a.slice_cols(1);
        assert_eq!(s.shape, vec![2, 2]);
        assert_eq!(s.data, vec![2.0, 3.0, 5.0, 6.0]);
    }
}
