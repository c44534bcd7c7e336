//! Attention mechanism kernels.

use crate::utils::softmax_inplace;
use anyhow::{ensure, Result};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

/// `softmax(q k^T * scale + mask) v` for one head. `mask` is additive and
/// shaped `(q_len, kv_len)`.
pub fn scaled_dot_product_attention(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    value: ArrayView2<'_, f32>,
    mask: ArrayView2<'_, f32>,
    scale: f32,
) -> Result<Array2<f32>> {
    ensure!(
        query.ncols() == key.ncols(),
        "query dim {} must match key dim {}",
        query.ncols(),
        key.ncols()
    );
    let mut scores = query.dot(&key.t());
    scores *= scale;

    ensure!(
        mask.dim() == scores.dim(),
        "mask shape {:?} incompatible with attention scores {:?}",
        mask.dim(),
        scores.dim()
    );
    scores += &mask;

    softmax_inplace(scores.view_mut());
    ensure!(
        scores.ncols() == value.nrows(),
        "scores column count {} differs from value rows {}",
        scores.ncols(),
        value.nrows()
    );
    Ok(scores.dot(&value))
}

/// Additive mask of shape `(query_positions.len(), attendable.len())`.
///
/// Key slot `j` holds absolute position `j`. A query at absolute position
/// `p` may see slot `j` when `j <= p` and `attendable[j]` is set; every
/// other entry is `-inf`.
pub fn causal_mask(query_positions: &[usize], attendable: &[bool]) -> Array2<f32> {
    Array2::from_shape_fn(
        (query_positions.len(), attendable.len()),
        |(i, j)| {
            if j <= query_positions[i] && attendable[j] {
                0.0
            } else {
                f32::NEG_INFINITY
            }
        },
    )
}

/// Attention over head-major tensors.
///
/// `query` is `(heads, q_len, head_dim)`; `key`/`value` are
/// `(heads, kv_len, head_dim)`; `mask` is `(q_len, kv_len)` and shared by
/// every head. Returns `(heads, q_len, head_dim)`.
pub fn multi_head_attention(
    query: ArrayView3<'_, f32>,
    key: ArrayView3<'_, f32>,
    value: ArrayView3<'_, f32>,
    mask: ArrayView2<'_, f32>,
    scale: f32,
) -> Result<Array3<f32>> {
    let (heads, q_len, head_dim) = query.dim();
    ensure!(
        key.dim() == value.dim(),
        "key shape {:?} differs from value shape {:?}",
        key.dim(),
        value.dim()
    );
    ensure!(
        key.len_of(Axis(0)) == heads,
        "key has {} heads, query has {}",
        key.len_of(Axis(0)),
        heads
    );

    let mut output = Array3::<f32>::zeros((heads, q_len, head_dim));
    for h in 0..heads {
        let head_out = scaled_dot_product_attention(
            query.index_axis(Axis(0), h),
            key.index_axis(Axis(0), h),
            value.index_axis(Axis(0), h),
            mask,
            scale,
        )?;
        output.index_axis_mut(Axis(0), h).assign(&head_out);
    }
    Ok(output)
}
