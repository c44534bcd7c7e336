//! Contract between the decoding core and a scorer backend.

use crate::config::ModelTopology;
use crate::kv_cache::KvCacheEntry;
use crate::step_input::StepInput;
use anyhow::Result;
use ndarray::{Array3, ArrayView1, Axis};

/// Scorer output for one call.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[batch, input_len, vocab_size]`.
    pub logits: Array3<f32>,
    /// Per layer, the prior cache extended by `input_len` positions.
    pub present: Vec<KvCacheEntry>,
}

impl ModelOutput {
    /// Logits of the final submitted position for batch row 0.
    pub fn last_logits(&self) -> Option<ArrayView1<'_, f32>> {
        let positions = self.logits.len_of(Axis(1));
        if self.logits.len_of(Axis(0)) == 0 || positions == 0 {
            return None;
        }
        Some(
            self.logits
                .index_axis(Axis(0), 0)
                .index_axis_move(Axis(0), positions - 1),
        )
    }
}

/// A stateless forward pass: identical inputs must give identical outputs,
/// and nothing about earlier calls may be retained by the implementation.
///
/// One implementation exists per backend and is chosen when a session is
/// built; the decoding loop never branches on the backend kind.
pub trait ModelExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn topology(&self) -> ModelTopology;

    fn execute(&self, input: &StepInput<'_>) -> Result<ModelOutput>;
}
