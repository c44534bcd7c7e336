//! Reference model hyper-parameters.

use kvforge_decode::ModelTopology;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub max_seq_len: usize,
    pub rope_theta: f32,
}

impl ModelConfig {
    /// Tiny config for tests and quick runs
    pub fn tiny() -> Self {
        Self {
            vocab_size: 1000,
            d_model: 128,
            n_layers: 2,
            n_heads: 4,
            d_ff: 512,
            max_seq_len: 256,
            rope_theta: 10000.0,
        }
    }

    /// GPT-2 small shape (124M params)
    pub fn small() -> Self {
        Self {
            vocab_size: 50257,
            d_model: 768,
            n_layers: 12,
            n_heads: 12,
            d_ff: 3072,
            max_seq_len: 1024,
            rope_theta: 10000.0,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    pub fn topology(&self) -> ModelTopology {
        ModelTopology::new(self.n_layers, self.n_heads, self.head_dim(), self.vocab_size)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.n_layers > 0, "model needs at least one layer");
        anyhow::ensure!(
            self.n_heads > 0 && self.d_model % self.n_heads == 0,
            "d_model {} is not divisible into {} heads",
            self.d_model,
            self.n_heads
        );
        anyhow::ensure!(
            self.head_dim() % 2 == 0,
            "rotary embeddings need an even head_dim, got {}",
            self.head_dim()
        );
        anyhow::ensure!(self.vocab_size > 0, "vocabulary is empty");
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::tiny()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        ModelConfig::tiny().validate().expect("tiny");
        ModelConfig::small().validate().expect("small");
        assert_eq!(ModelConfig::small().topology(), ModelTopology::new(12, 12, 64, 50257));
    }

    #[test]
    fn odd_head_dim_is_rejected() {
        let config = ModelConfig {
            d_model: 12,
            n_heads: 4,
            ..ModelConfig::tiny()
        };
        assert!(config.validate().is_err());
    }
}
