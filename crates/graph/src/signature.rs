//! Declared inputs and outputs of an exported graph.

use crate::naming::TensorNames;
use crate::tensor::TensorData;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    I64,
    F32,
}

/// One axis of a declared tensor: a fixed extent or a named free axis
/// such as `"batch"` or `"past_sequence_length"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dim {
    Fixed(usize),
    Symbolic(String),
}

impl Dim {
    pub fn symbolic(name: &str) -> Self {
        Dim::Symbolic(name.to_string())
    }

    pub fn fixed(&self) -> Option<usize> {
        match self {
            Dim::Fixed(n) => Some(*n),
            Dim::Symbolic(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub element_type: ElementType,
    pub dims: Vec<Dim>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, element_type: ElementType, dims: Vec<Dim>) -> Self {
        Self {
            name: name.into(),
            element_type,
            dims,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Fixed extent of axis `axis`, if declared.
    pub fn fixed_dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).and_then(Dim::fixed)
    }

    /// Whether `tensor` has this spec's element type, rank and fixed extents.
    pub fn accepts(&self, tensor: &TensorData) -> bool {
        if tensor.element_type() != self.element_type || tensor.shape().len() != self.rank() {
            return false;
        }
        self.dims
            .iter()
            .zip(tensor.shape())
            .all(|(dim, &extent)| dim.fixed().map_or(true, |n| n == extent))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSignature {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl GraphSignature {
    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|spec| spec.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.outputs.iter().find(|spec| spec.name == name)
    }

    /// Standard causal-LM layout: token ids, positions and mask in,
    /// `layer_count` past key/value pairs in, logits and present pairs out.
    pub fn causal_lm(
        names: &TensorNames,
        layer_count: usize,
        heads: usize,
        head_dim: usize,
        vocab_size: usize,
    ) -> Self {
        let batch = || Dim::symbolic("batch");
        let cache_dims = |len: &str| {
            vec![batch(), Dim::Fixed(heads), Dim::symbolic(len), Dim::Fixed(head_dim)]
        };

        let mut inputs = vec![
            TensorSpec::new(
                &names.input_ids,
                ElementType::I64,
                vec![batch(), Dim::symbolic("sequence_length")],
            ),
            TensorSpec::new(
                &names.position_ids,
                ElementType::I64,
                vec![batch(), Dim::symbolic("sequence_length")],
            ),
            TensorSpec::new(
                &names.attention_mask,
                ElementType::I64,
                vec![batch(), Dim::symbolic("total_sequence_length")],
            ),
        ];
        let mut outputs = vec![TensorSpec::new(
            &names.logits,
            ElementType::F32,
            vec![batch(), Dim::symbolic("sequence_length"), Dim::Fixed(vocab_size)],
        )];

        for layer in 0..layer_count {
            for pattern in [&names.past_key, &names.past_value] {
                inputs.push(TensorSpec::new(
                    pattern.name(layer),
                    ElementType::F32,
                    cache_dims("past_sequence_length"),
                ));
            }
            for pattern in [&names.present_key, &names.present_value] {
                outputs.push(TensorSpec::new(
                    pattern.name(layer),
                    ElementType::F32,
                    cache_dims("total_sequence_length"),
                ));
            }
        }

        Self { inputs, outputs }
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open graph signature {}", path.display()))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("failed to parse graph signature {}", path.display()))
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write graph signature {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn causal_lm_layout() {
        let sig = GraphSignature::causal_lm(&TensorNames::default(), 2, 4, 8, 50);
        assert_eq!(sig.inputs.len(), 3 + 4);
        assert_eq!(sig.outputs.len(), 1 + 4);
        assert!(sig.input("past_key_values.1.value").is_some());
        assert!(sig.output("present.0.key").is_some());
        assert_eq!(sig.output("logits").and_then(|s| s.fixed_dim(2)), Some(50));
    }

    #[test]
    fn accepts_checks_type_rank_and_fixed_dims() {
        let spec = TensorSpec::new(
            "present.0.key",
            ElementType::F32,
            vec![Dim::symbolic("batch"), Dim::Fixed(2), Dim::symbolic("t"), Dim::Fixed(4)],
        );
        let good = TensorData::F32(ArrayD::zeros(IxDyn(&[1, 2, 7, 4])));
        let wrong_heads = TensorData::F32(ArrayD::zeros(IxDyn(&[1, 3, 7, 4])));
        let wrong_type = TensorData::I64(ArrayD::zeros(IxDyn(&[1, 2, 7, 4])));
        assert!(spec.accepts(&good));
        assert!(!spec.accepts(&wrong_heads));
        assert!(!spec.accepts(&wrong_type));
    }

    #[test]
    fn json_dims_are_numbers_or_names() {
        let sig = GraphSignature::causal_lm(&TensorNames::default(), 1, 2, 4, 10);
        let json = serde_json::to_string(&sig).expect("serialize");
        assert!(json.contains(r#""dims":["batch",2,"past_sequence_length",4]"#));
        let parsed: GraphSignature = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, sig);
    }

    #[test]
    fn signature_file_reloads() {
        let path = std::env::temp_dir().join(format!("kvforge-graph-sig-{}.json", std::process::id()));
        let sig = GraphSignature::causal_lm(&TensorNames::default(), 2, 2, 4, 10);
        sig.save_json(&path).expect("save");
        let loaded = GraphSignature::load_json(&path);
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded.expect("load"), sig);
    }
}
