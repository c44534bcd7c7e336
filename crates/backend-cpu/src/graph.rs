//! The reference model behind the named-tensor graph interface.

use crate::config::ModelConfig;
use crate::model::ReferenceModel;
use anyhow::{anyhow, Context, Result};
use kvforge_decode::{CacheStore, ModelExecutor, StepInputBuilder, TokenId};
use kvforge_graph::{GraphBackend, GraphSignature, NamedTensors, TensorData, TensorNames};
use ndarray::{ArrayD, Ix4};

/// Serves [`ReferenceModel`] as a graph with the standard causal-LM
/// signature, so the graph adapter can be exercised without an external
/// runtime.
pub struct ReferenceGraph {
    model: ReferenceModel,
    names: TensorNames,
    signature: GraphSignature,
}

impl ReferenceGraph {
    pub fn new(model: ReferenceModel) -> Self {
        let names = TensorNames::default();
        let signature = Self::signature_for(model.config(), &names);
        Self {
            model,
            names,
            signature,
        }
    }

    /// The signature a graph built from `config` declares.
    pub fn signature_for(config: &ModelConfig, names: &TensorNames) -> GraphSignature {
        let topology = config.topology();
        GraphSignature::causal_lm(
            names,
            topology.layer_count,
            topology.heads,
            topology.head_dim,
            topology.vocab_size,
        )
    }

    pub fn model(&self) -> &ReferenceModel {
        &self.model
    }
}

impl GraphBackend for ReferenceGraph {
    fn name(&self) -> &str {
        "reference-graph"
    }

    fn signature(&self) -> &GraphSignature {
        &self.signature
    }

    fn run(&self, mut inputs: NamedTensors) -> Result<NamedTensors> {
        let names = &self.names;
        let topology = self.model.topology();

        let ids = take_row(&mut inputs, &names.input_ids)?
            .into_iter()
            .map(|id| TokenId::try_from(id).with_context(|| format!("invalid token id {id}")))
            .collect::<Result<Vec<_>>>()?;

        let mut cache = CacheStore::for_topology(&topology, 1);
        for layer in 0..topology.layer_count {
            let key = take_f32(&mut inputs, &names.past_key.name(layer))?;
            let value = take_f32(&mut inputs, &names.past_value.name(layer))?;
            cache.merge(
                layer,
                key.into_dimensionality::<Ix4>()?,
                value.into_dimensionality::<Ix4>()?,
            )?;
        }

        let mut step = StepInputBuilder::assemble(&ids, cache.view())?;
        if inputs.contains_key(&names.position_ids) {
            step.position_ids = take_row(&mut inputs, &names.position_ids)?
                .into_iter()
                .map(|p| usize::try_from(p).with_context(|| format!("invalid position {p}")))
                .collect::<Result<Vec<_>>>()?;
        }
        if inputs.contains_key(&names.attention_mask) {
            step.attention_mask = take_row(&mut inputs, &names.attention_mask)?
                .into_iter()
                .map(|m| u8::from(m != 0))
                .collect();
        }

        let output = self.model.execute(&step)?;

        let mut outputs = NamedTensors::new();
        outputs.insert(names.logits.clone(), TensorData::F32(output.logits.into_dyn()));
        for (layer, entry) in output.present.into_iter().enumerate() {
            outputs.insert(names.present_key.name(layer), TensorData::F32(entry.key.into_dyn()));
            outputs.insert(
                names.present_value.name(layer),
                TensorData::F32(entry.value.into_dyn()),
            );
        }
        Ok(outputs)
    }
}

/// Batch row 0 of an i64 `[1, n]` input.
fn take_row(inputs: &mut NamedTensors, name: &str) -> Result<Vec<i64>> {
    let tensor = inputs
        .remove(name)
        .ok_or_else(|| anyhow!("missing input `{name}`"))?;
    let array = tensor
        .as_i64()
        .ok_or_else(|| anyhow!("input `{name}` must be i64"))?;
    anyhow::ensure!(
        array.ndim() == 2 && array.shape()[0] == 1,
        "input `{name}` must be [1, n], got {:?}",
        array.shape()
    );
    Ok(array.iter().copied().collect())
}

fn take_f32(inputs: &mut NamedTensors, name: &str) -> Result<ArrayD<f32>> {
    inputs
        .remove(name)
        .ok_or_else(|| anyhow!("missing input `{name}`"))?
        .into_f32()
        .ok_or_else(|| anyhow!("input `{name}` must be f32"))
}
