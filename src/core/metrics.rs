//! Fit diagnostics: functional-connectivity correlation and cosine similarity.
//!
//! Monitoring only. These never touch a tape and never feed gradients.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::tensor::Tensor;

/// Simulated steps dropped before computing the simulated FC matrix.
pub const DEFAULT_TRANSIENT_STEPS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Diagnostics {
    /// Pearson correlation of the strict lower triangles of simulated and
    /// empirical FC matrices.
    pub fc_cor: f32,
    /// Mean per-channel cosine similarity of simulated and empirical series.
    pub cos_sim: f32,
}

impl Diagnostics {
    /// `sim` and `emp` are `[channels, time]`; only `sim` is trimmed by
    /// `transient` steps for the FC comparison.
    pub fn compute(sim: &Tensor, emp: &Tensor, transient: usize) -> Result<Self> {
        Ok(Self {
            fc_cor: fc_correlation(sim, emp, transient)?,
            cos_sim: mean_cosine_similarity(sim, emp)?,
        })
    }
}

fn centered_row(row: &[f32]) -> (Vec<f64>, f64) {
    let n = row.len().max(1) as f64;
    let mean = row.iter().map(|&x| x as f64).sum::<f64>() / n;
    let centered: Vec<f64> = row.iter().map(|&x| x as f64 - mean).collect();
    let norm = centered.iter().map(|x| x * x).sum::<f64>().sqrt();
    (centered, norm)
}

/// Channel × channel Pearson correlation matrix of a `[channels, time]` series.
///
/// Constant channels produce NaN entries.
pub fn correlation_matrix(x: &Tensor) -> Vec<f32> {
    let n = x.rows();
    let rows: Vec<(Vec<f64>, f64)> = (0..n).map(|i| centered_row(x.row(i))).collect();

    let corr_row = |i: usize| -> Vec<f32> {
        let (ci, ni) = &rows[i];
        rows.iter()
            .map(|(cj, nj)| {
                let dot: f64 = ci.iter().zip(cj).map(|(a, b)| a * b).sum();
                (dot / (ni * nj)) as f32
            })
            .collect()
    };

    #[cfg(feature = "parallel")]
    let out: Vec<Vec<f32>> = (0..n).into_par_iter().map(corr_row).collect();
    #[cfg(not(feature = "parallel"))]
    let out: Vec<Vec<f32>> = (0..n).map(corr_row).collect();

    out.into_iter().flatten().collect()
}

/// Entries strictly below the diagonal of a row-major `[n, n]` matrix, in
/// row-major order.
pub fn lower_triangle(m: &[f32], n: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for i in 1..n {
        for j in 0..i {
            out.push(m[i * n + j]);
        }
    }
    out
}

pub fn pearson(a: &[f32], b: &[f32]) -> f32 {
    let (ca, na) = centered_row(a);
    let (cb, nb) = centered_row(b);
    let dot: f64 = ca.iter().zip(&cb).map(|(x, y)| x * y).sum();
    (dot / (na * nb)) as f32
}

pub fn fc_correlation(sim: &Tensor, emp: &Tensor, transient: usize) -> Result<f32> {
    if sim.rows() != emp.rows() {
        return Err(FitError::shape(
            "FC channels",
            &[emp.rows()],
            &[sim.rows()],
        ));
    }
    let n = sim.rows();
    let fc_sim = correlation_matrix(&sim.slice_cols(transient));
    let fc_emp = correlation_matrix(emp);
    Ok(pearson(
        &lower_triangle(&fc_sim, n),
        &lower_triangle(&fc_emp, n),
    ))
}

/// Mean over channels of cos(sim_c, emp_c). Zero-norm rows score 0.
pub fn mean_cosine_similarity(sim: &Tensor, emp: &Tensor) -> Result<f32> {
    if sim.shape != emp.shape {
        return Err(FitError::shape("cosine similarity", &emp.shape, &sim.shape));
    }
    let n = sim.rows();
    if n == 0 {
        return Ok(0.0);
    }
    let total: f64 = (0..n)
        .map(|i| {
            let (a, b) = (sim.row(i), emp.row(i));
            let dot: f64 = a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum();
            let na = a.iter().map(|&x| (x as f64).powi(2)).sum::<f64>().sqrt();
            let nb = b.iter().map(|&x| (x as f64).powi(2)).sum::<f64>().sqrt();
            if na == 0.0 || nb == 0.0 {
                0.0
            } else {
                dot / (na * nb)
            }
        })
        .sum();
    Ok((total / n as f64) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series() -> Tensor {
        // 4 channels, 40 samples, distinct frequencies and phases.
        let t = 40;
        let mut data = Vec::new();
        for c in 0..4 {
            for k in 0..t {
                let x = k as f32 * 0.3;
                data.push((x * (1.0 + c as f32 * 0.37)).sin() + 0.2 * c as f32 * (x * 0.5).cos());
            }
        }
        Tensor::from_vec(&[4, t], data).unwrap()
    }

    #[test]
    fn correlation_matrix_has_unit_diagonal_and_symmetry() {
        let m = correlation_matrix(&series());
        for i in 0..4 {
            assert!((m[i * 4 + i] - 1.0).abs() < 1e-5);
            for j in 0..4 {
                assert!((m[i * 4 + j] - m[j * 4 + i]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn lower_triangle_is_strict_and_row_major() {
        let m: Vec<f32> = (0..9).map(|i| i as f32).collect();
        assert_eq!(lower_triangle(&m, 3), vec![3.0, 6.0, 7.0]);
    }

    #[test]
    fn fc_correlation_of_identical_signals_is_one() {
        let s = series();
        // Prepend a transient that would otherwise distort the simulated FC.
        let junk = Tensor::from_vec(&[4, 10], (0..40).map(|i| (i * i) as f32).collect()).unwrap();
        let sim = Tensor::concat_cols(&[junk, s.clone()]).unwrap();
        let r = fc_correlation(&sim, &s, 10).unwrap();
        assert!((r - 1.0).abs() < 1e-5, "fc_cor {}", r);
    }

    #[test]
    fn cosine_similarity_of_identical_nonzero_signals_is_one() {
        let s = series();
        let c = mean_cosine_similarity(&s, &s).unwrap();
        assert!((c - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_scores_zero_rows_as_zero() {
        let a = Tensor::from_vec(&[2, 2], vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        let c = mean_cosine_similarity(&a, &a).unwrap();
        assert!((c - 0.5).abs() < 1e-6);
    }

    #[test]
    fn pearson_detects_anticorrelation() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [4.0, 3.0, 2.0, 1.0];
        assert!((pearson(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn diagnostics_reject_mismatched_shapes() {
        let a = series();
        let b = Tensor::zeros(&[3, 40]);
        assert!(Diagnostics::compute(&a, &b, 0).is_err());
    }
}
