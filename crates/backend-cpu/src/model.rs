//! Pre-norm transformer scorer: embeddings, decoder stack, LM head.
//!
//! The forward pass is a pure function of its [`StepInput`]: past keys and
//! values arrive through the cache view and the extended tensors are
//! returned, so one model can serve any number of sessions.

use crate::config::ModelConfig;
use crate::rope::RoPECache;
use crate::weights::{DecoderWeights, ModelWeights};
use anyhow::{ensure, Context, Result};
use kvforge_decode::{KvCacheEntry, ModelExecutor, ModelOutput, ModelTopology, StepInput};
use kvforge_kernels::{causal_mask, gelu_inplace, multi_head_attention};
use ndarray::{concatenate, s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use tracing::debug;

pub struct ReferenceModel {
    config: ModelConfig,
    weights: ModelWeights,
    rope: RoPECache,
}

impl ReferenceModel {
    pub fn new(config: ModelConfig, weights: ModelWeights) -> Result<Self> {
        config.validate()?;
        ensure!(
            weights.layers.len() == config.n_layers,
            "config has {} layers, weights have {}",
            config.n_layers,
            weights.layers.len()
        );
        ensure!(
            weights.token_embeddings.dim() == (config.vocab_size, config.d_model),
            "embedding table is {:?}, expected ({}, {})",
            weights.token_embeddings.dim(),
            config.vocab_size,
            config.d_model
        );
        let rope = RoPECache::new(config.max_seq_len, config.head_dim(), config.rope_theta);
        Ok(Self {
            config,
            weights,
            rope,
        })
    }

    /// Model with seeded random weights.
    pub fn random(config: ModelConfig, seed: u64) -> Result<Self> {
        let weights = ModelWeights::random(&config, seed);
        Self::new(config, weights)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    fn embed(&self, token_ids: &[u32]) -> Result<Array2<f32>> {
        let mut hidden = Array2::<f32>::zeros((token_ids.len(), self.config.d_model));
        for (i, &token_id) in token_ids.iter().enumerate() {
            let token = token_id as usize;
            ensure!(
                token < self.config.vocab_size,
                "token {} outside vocabulary of {}",
                token,
                self.config.vocab_size
            );
            hidden
                .row_mut(i)
                .assign(&self.weights.token_embeddings.row(token));
        }
        Ok(hidden)
    }

    /// One decoder layer. Returns the new hidden states and this layer's
    /// extended key/value entry.
    fn layer_forward(
        &self,
        hidden: &Array2<f32>,
        weights: &DecoderWeights,
        past_key: ArrayView3<'_, f32>,
        past_value: ArrayView3<'_, f32>,
        positions: &[usize],
        mask: ArrayView2<'_, f32>,
    ) -> Result<(Array2<f32>, KvCacheEntry)> {
        let x_norm = weights.ln1.forward(hidden.view())?;

        let mut q = x_norm.dot(&weights.q_proj);
        let mut k = x_norm.dot(&weights.k_proj);
        let v = x_norm.dot(&weights.v_proj);

        let head_dim = self.config.head_dim();
        for h in 0..self.config.n_heads {
            let cols = h * head_dim..(h + 1) * head_dim;
            self.rope.apply(q.slice_mut(s![.., cols.clone()]), positions)?;
            self.rope.apply(k.slice_mut(s![.., cols]), positions)?;
        }

        let q = self.split_heads(q)?;
        let k_new = self.split_heads(k)?;
        let v_new = self.split_heads(v)?;
        let key = concatenate(Axis(1), &[past_key.view(), k_new.view()])?;
        let value = concatenate(Axis(1), &[past_value.view(), v_new.view()])?;

        let scale = 1.0 / (head_dim as f32).sqrt();
        let attn = multi_head_attention(q.view(), key.view(), value.view(), mask, scale)?;
        let attn_out = self.merge_heads(attn)?.dot(&weights.out_proj);
        let hidden = hidden + &attn_out;

        let x_norm = weights.ln2.forward(hidden.view())?;
        let mut up = x_norm.dot(&weights.mlp_up);
        gelu_inplace(up.view_mut());
        let hidden = hidden + &up.dot(&weights.mlp_down);

        let present = KvCacheEntry::new(key.insert_axis(Axis(0)), value.insert_axis(Axis(0)));
        Ok((hidden, present))
    }

    /// `(rows, d_model)` -> `(heads, rows, head_dim)`
    fn split_heads(&self, x: Array2<f32>) -> Result<Array3<f32>> {
        let rows = x.nrows();
        let split = x
            .into_shape((rows, self.config.n_heads, self.config.head_dim()))
            .context("failed to split heads")?;
        Ok(split.permuted_axes([1, 0, 2]).as_standard_layout().to_owned())
    }

    /// `(heads, rows, head_dim)` -> `(rows, d_model)`
    fn merge_heads(&self, x: Array3<f32>) -> Result<Array2<f32>> {
        let rows = x.len_of(Axis(1));
        x.permuted_axes([1, 0, 2])
            .as_standard_layout()
            .to_owned()
            .into_shape((rows, self.config.d_model))
            .context("failed to merge heads")
    }
}

impl ModelExecutor for ReferenceModel {
    fn name(&self) -> &str {
        "reference"
    }

    fn topology(&self) -> ModelTopology {
        self.config.topology()
    }

    fn execute(&self, input: &StepInput<'_>) -> Result<ModelOutput> {
        let n = input.new_tokens();
        let total = input.total_length();
        ensure!(n > 0, "no input tokens");
        ensure!(
            input.cache.layer_count() == self.config.n_layers,
            "expected {} cache layers, got {}",
            self.config.n_layers,
            input.cache.layer_count()
        );
        ensure!(
            input.position_ids.len() == n,
            "{} position ids for {} tokens",
            input.position_ids.len(),
            n
        );
        ensure!(
            input.cache_length() + n == total,
            "attention mask covers {} slots, expected {}",
            total,
            input.cache_length() + n
        );

        let attendable: Vec<bool> = input.attention_mask.iter().map(|&m| m != 0).collect();
        let mask = causal_mask(&input.position_ids, &attendable);

        let mut hidden = self.embed(&input.input_ids)?;
        let mut present = Vec::with_capacity(self.config.n_layers);
        for (layer_idx, (weights, past)) in
            self.weights.layers.iter().zip(input.cache.iter()).enumerate()
        {
            ensure!(
                past.key.len_of(Axis(0)) == 1,
                "reference model runs batch 1, cache has batch {}",
                past.key.len_of(Axis(0))
            );
            let (next, entry) = self
                .layer_forward(
                    &hidden,
                    weights,
                    past.key.index_axis(Axis(0), 0),
                    past.value.index_axis(Axis(0), 0),
                    &input.position_ids,
                    mask.view(),
                )
                .with_context(|| format!("layer {layer_idx}"))?;
            hidden = next;
            present.push(entry);
        }

        let normed = self.weights.final_ln.forward(hidden.view())?;
        // (n, d_model) @ (d_model, vocab_size) -> (n, vocab_size)
        let logits = normed.dot(&self.weights.lm_head).insert_axis(Axis(0));

        debug!(new_tokens = n, total_length = total, "reference forward");
        Ok(ModelOutput { logits, present })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvforge_decode::{CacheStore, StepInputBuilder, TokenSequence};

    fn micro() -> ModelConfig {
        ModelConfig {
            vocab_size: 23,
            d_model: 16,
            n_layers: 2,
            n_heads: 4,
            d_ff: 32,
            max_seq_len: 64,
            rope_theta: 10000.0,
        }
    }

    #[test]
    fn output_shapes_follow_the_step() {
        let model = ReferenceModel::random(micro(), 5).expect("model");
        let sequence = TokenSequence::from_prompt(&[3, 1, 4, 1, 5]).expect("prompt");
        let cache = CacheStore::for_topology(&model.topology(), 1);
        let input = StepInputBuilder::build(&sequence, &cache).expect("input");

        let output = model.execute(&input).expect("forward");
        assert_eq!(output.logits.dim(), (1, 5, 23));
        assert_eq!(output.present.len(), 2);
        assert_eq!(output.present[1].key.dim(), (1, 4, 5, 4));
    }

    #[test]
    fn present_extends_the_past() {
        let model = ReferenceModel::random(micro(), 5).expect("model");
        let mut sequence = TokenSequence::from_prompt(&[3, 1, 4]).expect("prompt");
        let mut cache = CacheStore::for_topology(&model.topology(), 1);
        let prefill = {
            let input = StepInputBuilder::build(&sequence, &cache).expect("prefill input");
            model.execute(&input).expect("prefill")
        };
        let past = prefill.present.clone();
        cache.commit(prefill.present, 3).expect("commit");

        sequence.push(9);
        let input = StepInputBuilder::build(&sequence, &cache).expect("step input");
        assert_eq!(input.input_ids, vec![9]);
        let step = model.execute(&input).expect("step");

        assert_eq!(step.logits.dim(), (1, 1, 23));
        for (before, after) in past.iter().zip(&step.present) {
            assert_eq!(after.key.dim(), (1, 4, 4, 4));
            assert_eq!(after.key.slice(s![.., .., ..3, ..]), before.key);
            assert_eq!(after.value.slice(s![.., .., ..3, ..]), before.value);
        }
    }

    #[test]
    fn execute_is_stateless() {
        let model = ReferenceModel::random(micro(), 5).expect("model");
        let sequence = TokenSequence::from_prompt(&[7, 8]).expect("prompt");
        let cache = CacheStore::for_topology(&model.topology(), 1);
        let input = StepInputBuilder::build(&sequence, &cache).expect("input");

        let first = model.execute(&input).expect("first");
        let second = model.execute(&input).expect("second");
        assert_eq!(first.logits, second.logits);
        assert_eq!(first.present, second.present);
    }

    #[test]
    fn out_of_vocabulary_token_is_an_error() {
        let model = ReferenceModel::random(micro(), 5).expect("model");
        let sequence = TokenSequence::from_prompt(&[99]).expect("prompt");
        let cache = CacheStore::for_topology(&model.topology(), 1);
        let input = StepInputBuilder::build(&sequence, &cache).expect("input");
        assert!(model.execute(&input).is_err());
    }

    #[test]
    fn mismatched_weights_are_rejected() {
        let weights = ModelWeights::random(&micro(), 1);
        let config = ModelConfig {
            n_layers: 3,
            ..micro()
        };
        assert!(ReferenceModel::new(config, weights).is_err());
    }
}
