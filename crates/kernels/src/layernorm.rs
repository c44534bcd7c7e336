//! Layer normalization.

use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;

/// Affine layer norm over the last axis of a `(rows, features)` matrix.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub epsilon: f32,
}

impl LayerNorm {
    pub fn new(gamma: Array1<f32>, beta: Array1<f32>, epsilon: f32) -> Result<Self> {
        ensure!(
            gamma.len() == beta.len(),
            "gamma length {} differs from beta length {}",
            gamma.len(),
            beta.len()
        );
        Ok(Self {
            gamma,
            beta,
            epsilon,
        })
    }

    /// Unit scale, zero shift.
    pub fn identity(features: usize) -> Self {
        Self {
            gamma: Array1::ones(features),
            beta: Array1::zeros(features),
            epsilon: 1e-5,
        }
    }

    pub fn features(&self) -> usize {
        self.gamma.len()
    }

    pub fn forward(&self, data: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let mut output = data.to_owned();
        self.forward_inplace(output.view_mut())?;
        Ok(output)
    }

    pub fn forward_inplace(&self, mut data: ArrayViewMut2<'_, f32>) -> Result<()> {
        let feature_dim = data.len_of(Axis(1));
        ensure!(
            feature_dim == self.features(),
            "layer norm expects {} features, got {}",
            self.features(),
            feature_dim
        );

        let gamma = &self.gamma;
        let beta = &self.beta;
        let epsilon = self.epsilon;
        data.axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|mut row| {
                let len = row.len() as f32;
                let mean = row.sum() / len;
                let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / len;
                let inv_std = 1.0 / (var + epsilon).sqrt();
                for ((value, g), b) in row.iter_mut().zip(gamma.iter()).zip(beta.iter()) {
                    *value = (*value - mean) * inv_std * g + b;
                }
            });
        Ok(())
    }
}
