//! Weight structures and safetensors I/O.

use crate::config::ModelConfig;
use anyhow::{ensure, Context, Result};
use kvforge_kernels::LayerNorm;
use ndarray::{Array1, Array2};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct DecoderWeights {
    // Attention, each (d_model, d_model)
    pub q_proj: Array2<f32>,
    pub k_proj: Array2<f32>,
    pub v_proj: Array2<f32>,
    pub out_proj: Array2<f32>,
    pub ln1: LayerNorm,

    // MLP
    pub mlp_up: Array2<f32>,   // (d_model, d_ff)
    pub mlp_down: Array2<f32>, // (d_ff, d_model)
    pub ln2: LayerNorm,
}

#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub token_embeddings: Array2<f32>, // (vocab_size, d_model)
    pub layers: Vec<DecoderWeights>,
    pub final_ln: LayerNorm,
    pub lm_head: Array2<f32>, // (d_model, vocab_size)
}

impl ModelWeights {
    /// Small uniform weights from a seeded generator. Identical seeds give
    /// identical models.
    pub fn random(config: &ModelConfig, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut random_array = |shape: (usize, usize)| {
            Array2::from_shape_fn(shape, |_| (rng.f32() - 0.5) * 0.04)
        };
        let d_model = config.d_model;

        let token_embeddings = random_array((config.vocab_size, d_model));
        let lm_head = random_array((d_model, config.vocab_size));

        let mut layers = Vec::with_capacity(config.n_layers);
        for _ in 0..config.n_layers {
            layers.push(DecoderWeights {
                q_proj: random_array((d_model, d_model)),
                k_proj: random_array((d_model, d_model)),
                v_proj: random_array((d_model, d_model)),
                out_proj: random_array((d_model, d_model)),
                ln1: LayerNorm::identity(d_model),
                mlp_up: random_array((d_model, config.d_ff)),
                mlp_down: random_array((config.d_ff, d_model)),
                ln2: LayerNorm::identity(d_model),
            });
        }

        Self {
            token_embeddings,
            layers,
            final_ln: LayerNorm::identity(d_model),
            lm_head,
        }
    }

    /// Load weights from safetensors. Tensors are named
    /// `layers.{i}.{component}`; the layer count comes from `config`.
    pub fn load_safetensors(path: impl AsRef<Path>, config: &ModelConfig) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .with_context(|| format!("failed to read safetensors file {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&data).context("failed to parse safetensors")?;

        let (vocab, d_model, d_ff) = (config.vocab_size, config.d_model, config.d_ff);
        let token_embeddings = load_matrix(&tensors, "token_embeddings", (vocab, d_model))?;
        let lm_head = load_matrix(&tensors, "lm_head", (d_model, vocab))?;
        let final_ln = load_norm(&tensors, "final_ln", d_model)?;

        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            let prefix = format!("layers.{}", i);
            let square = |name: &str| load_matrix(&tensors, &format!("{prefix}.{name}"), (d_model, d_model));
            layers.push(DecoderWeights {
                q_proj: square("q_proj")?,
                k_proj: square("k_proj")?,
                v_proj: square("v_proj")?,
                out_proj: square("out_proj")?,
                ln1: load_norm(&tensors, &format!("{prefix}.ln1"), d_model)?,
                mlp_up: load_matrix(&tensors, &format!("{prefix}.mlp_up"), (d_model, d_ff))?,
                mlp_down: load_matrix(&tensors, &format!("{prefix}.mlp_down"), (d_ff, d_model))?,
                ln2: load_norm(&tensors, &format!("{prefix}.ln2"), d_model)?,
            });
        }

        tracing::info!(path = %path.display(), layers = layers.len(), "loaded weights");
        Ok(Self {
            token_embeddings,
            layers,
            final_ln,
            lm_head,
        })
    }

    /// Write every tensor under the names [`load_safetensors`](Self::load_safetensors) reads.
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut named: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        let mut add = |name: String, shape: Vec<usize>, values: Vec<f32>| {
            let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            named.push((name, shape, bytes));
        };
        let matrix = |m: &Array2<f32>| (m.shape().to_vec(), m.iter().copied().collect::<Vec<f32>>());
        let vector = |v: &Array1<f32>| (vec![v.len()], v.to_vec());

        let (shape, values) = matrix(&self.token_embeddings);
        add("token_embeddings".to_string(), shape, values);
        let (shape, values) = matrix(&self.lm_head);
        add("lm_head".to_string(), shape, values);
        for (suffix, v) in [("weight", &self.final_ln.gamma), ("bias", &self.final_ln.beta)] {
            let (shape, values) = vector(v);
            add(format!("final_ln.{suffix}"), shape, values);
        }

        for (i, layer) in self.layers.iter().enumerate() {
            for (name, m) in [
                ("q_proj", &layer.q_proj),
                ("k_proj", &layer.k_proj),
                ("v_proj", &layer.v_proj),
                ("out_proj", &layer.out_proj),
                ("mlp_up", &layer.mlp_up),
                ("mlp_down", &layer.mlp_down),
            ] {
                let (shape, values) = matrix(m);
                add(format!("layers.{i}.{name}"), shape, values);
            }
            for (norm_name, norm) in [("ln1", &layer.ln1), ("ln2", &layer.ln2)] {
                for (suffix, v) in [("weight", &norm.gamma), ("bias", &norm.beta)] {
                    let (shape, values) = vector(v);
                    add(format!("layers.{i}.{norm_name}.{suffix}"), shape, values);
                }
            }
        }

        let views = named
            .iter()
            .map(|(name, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes)
                    .map(|view| (name.clone(), view))
                    .with_context(|| format!("invalid tensor {name}"))
            })
            .collect::<Result<Vec<_>>>()?;
        safetensors::serialize_to_file(views, &None, path.as_ref())
            .context("failed to write safetensors")?;
        Ok(())
    }
}

fn load_floats(tensors: &SafeTensors<'_>, name: &str, expected: &[usize]) -> Result<Vec<f32>> {
    let view = tensors
        .tensor(name)
        .with_context(|| format!("tensor '{}' not found", name))?;
    ensure!(view.dtype() == Dtype::F32, "tensor '{}' is not f32", name);
    ensure!(
        view.shape() == expected,
        "tensor '{}' has shape {:?}, expected {:?}",
        name,
        view.shape(),
        expected
    );

    Ok(view
        .data()
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn load_matrix(tensors: &SafeTensors<'_>, name: &str, shape: (usize, usize)) -> Result<Array2<f32>> {
    let floats = load_floats(tensors, name, &[shape.0, shape.1])?;
    Array2::from_shape_vec(shape, floats).context("failed to reshape tensor")
}

fn load_norm(tensors: &SafeTensors<'_>, prefix: &str, features: usize) -> Result<LayerNorm> {
    let gamma = load_floats(tensors, &format!("{prefix}.weight"), &[features])?;
    let beta = load_floats(tensors, &format!("{prefix}.bias"), &[features])?;
    LayerNorm::new(Array1::from(gamma), Array1::from(beta), 1e-5)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn micro() -> ModelConfig {
        ModelConfig {
            vocab_size: 11,
            d_model: 8,
            n_layers: 2,
            n_heads: 2,
            d_ff: 16,
            max_seq_len: 32,
            rope_theta: 10000.0,
        }
    }

    #[test]
    fn random_weights_are_seeded() {
        let a = ModelWeights::random(&micro(), 3);
        let b = ModelWeights::random(&micro(), 3);
        let c = ModelWeights::random(&micro(), 4);
        assert_eq!(a.lm_head, b.lm_head);
        assert_ne!(a.lm_head, c.lm_head);
        assert_eq!(a.layers.len(), 2);
        assert_eq!(a.layers[1].mlp_up.dim(), (8, 16));
    }

    #[test]
    fn safetensors_file_reloads() {
        let config = micro();
        let weights = ModelWeights::random(&config, 9);
        let path = std::env::temp_dir().join(format!("kvforge-weights-{}.safetensors", std::process::id()));
        weights.save_safetensors(&path).expect("save");

        let loaded = ModelWeights::load_safetensors(&path, &config).expect("load");
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded.token_embeddings, weights.token_embeddings);
        assert_eq!(loaded.layers[1].v_proj, weights.layers[1].v_proj);
        assert_eq!(loaded.layers[0].ln2.gamma, weights.layers[0].ln2.gamma);
    }

    #[test]
    fn loading_with_wrong_config_fails() {
        let weights = ModelWeights::random(&micro(), 1);
        let path = std::env::temp_dir().join(format!("kvforge-mismatch-{}.safetensors", std::process::id()));
        weights.save_safetensors(&path).expect("save");

        let wider = ModelConfig {
            d_model: 16,
            ..micro()
        };
        let err = ModelWeights::load_safetensors(&path, &wider);
        let _ = std::fs::remove_file(&path);
        assert!(err.is_err());
    }
}
