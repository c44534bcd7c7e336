//! Rotary Position Embeddings (RoPE) as used in LLaMA/TinyLlama.
//!
//! Reference: https://arxiv.org/abs/2104.09864

use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayViewMut2};

#[derive(Debug, Clone)]
pub struct RoPECache {
    cos: Array2<f32>,
    sin: Array2<f32>,
}

impl RoPECache {
    pub fn new(max_seq_len: usize, head_dim: usize, theta: f32) -> Self {
        let half = head_dim / 2;
        let mut cos = Array2::<f32>::zeros((max_seq_len, half));
        let mut sin = Array2::<f32>::zeros((max_seq_len, half));

        for pos in 0..max_seq_len {
            for i in 0..half {
                let freq = 1.0 / theta.powf((2 * i) as f32 / head_dim as f32);
                let angle = pos as f32 * freq;
                cos[[pos, i]] = angle.cos();
                sin[[pos, i]] = angle.sin();
            }
        }

        Self { cos, sin }
    }

    pub fn max_positions(&self) -> usize {
        self.cos.nrows()
    }

    /// Rotate each row of `qk` (`(rows, head_dim)`) by the absolute position
    /// given for that row.
    pub fn apply(&self, mut qk: ArrayViewMut2<'_, f32>, positions: &[usize]) -> Result<()> {
        let (rows, feat_dim) = qk.dim();
        ensure!(
            rows == positions.len(),
            "{} rows but {} positions",
            rows,
            positions.len()
        );
        ensure!(
            feat_dim == 2 * self.cos.ncols(),
            "head_dim {} does not match rotary table width {}",
            feat_dim,
            2 * self.cos.ncols()
        );

        for (row, &pos) in positions.iter().enumerate() {
            ensure!(
                pos < self.max_positions(),
                "position {} exceeds max_seq_len {}",
                pos,
                self.max_positions()
            );
            for i in 0..self.cos.ncols() {
                let (d0, d1) = (2 * i, 2 * i + 1);
                let x0 = qk[[row, d0]];
                let x1 = qk[[row, d1]];
                let c = self.cos[[pos, i]];
                let s = self.sin[[pos, i]];

                qk[[row, d0]] = x0 * c - x1 * s;
                qk[[row, d1]] = x0 * s + x1 * c;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn position_zero_is_identity() {
        let cache = RoPECache::new(16, 8, 10000.0);
        let mut qk = Array2::from_shape_fn((1, 8), |(_, d)| d as f32 + 1.0);
        let original = qk.clone();
        cache.apply(qk.view_mut(), &[0]).expect("apply");
        for (a, b) in qk.iter().zip(original.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn rotation_depends_only_on_row_position() {
        let cache = RoPECache::new(16, 8, 10000.0);
        let row = Array2::from_shape_fn((1, 8), |(_, d)| (d as f32 * 0.3).sin());

        let mut batch = Array2::from_shape_fn((3, 8), |(_, d)| (d as f32 * 0.3).sin());
        cache.apply(batch.view_mut(), &[2, 5, 9]).expect("batch");

        let mut single = row.clone();
        cache.apply(single.view_mut(), &[5]).expect("single");
        for (a, b) in batch.row(1).iter().zip(single.row(0).iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn rotation_preserves_norm() {
        let cache = RoPECache::new(32, 4, 10000.0);
        let mut qk = Array2::from_shape_vec((1, 4), vec![1.0, 2.0, 3.0, 4.0]).expect("shape");
        let before: f32 = qk.iter().map(|v| v * v).sum();
        cache.apply(qk.view_mut(), &[17]).expect("apply");
        let after: f32 = qk.iter().map(|v| v * v).sum();
        assert_abs_diff_eq!(before, after, epsilon = 1e-4);
    }

    #[test]
    fn out_of_range_position_is_an_error() {
        let cache = RoPECache::new(4, 4, 10000.0);
        let mut qk = Array2::<f32>::ones((1, 4));
        assert!(cache.apply(qk.view_mut(), &[4]).is_err());
    }
}
