//! Shared helpers for kernel implementations.

use ndarray::{ArrayViewMut2, Axis};
use rayon::prelude::*;

/// Row-wise softmax. Entries set to `-inf` receive zero weight; a row that
/// is entirely `-inf` becomes all zeros instead of NaN.
pub fn softmax_inplace(mut scores: ArrayViewMut2<'_, f32>) {
    scores
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            if max == f32::NEG_INFINITY {
                row.fill(0.0);
                return;
            }
            row.mapv_inplace(|x| (x - max).exp());
            let sum = row.sum();
            row /= sum.max(f32::EPSILON);
        });
}

/// Approximate GELU (tanh formulation).
pub fn gelu_inplace(mut data: ArrayViewMut2<'_, f32>) {
    let c = (2.0 / std::f32::consts::PI).sqrt();
    data.par_mapv_inplace(|x| 0.5 * x * (1.0 + (c * (x + 0.044715 * x.powi(3))).tanh()));
}
