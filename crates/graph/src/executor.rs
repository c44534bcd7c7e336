//! [`ModelExecutor`] over a named-tensor graph.

use crate::error::GraphError;
use crate::naming::{CachePattern, TensorNames};
use crate::signature::{ElementType, GraphSignature, TensorSpec};
use crate::tensor::{NamedTensors, TensorData};
use anyhow::{anyhow, bail, ensure, Context, Result};
use kvforge_decode::{KvCacheEntry, ModelExecutor, ModelOutput, ModelTopology, StepInput};
use ndarray::{Array2, Array3, Array4, ArrayD, Ix3, Ix4};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Something that evaluates a graph on a set of named tensors.
pub trait GraphBackend: Send + Sync {
    fn name(&self) -> &str;

    fn signature(&self) -> &GraphSignature;

    fn run(&self, inputs: NamedTensors) -> Result<NamedTensors>;
}

/// What a signature lets the adapter do, worked out without running the
/// graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphCapabilities {
    pub topology: ModelTopology,
    pub feeds_positions: bool,
    pub feeds_mask: bool,
}

impl GraphCapabilities {
    /// Fails if the graph lacks a required tensor or its cache layers are
    /// not numbered `0..n` with matching key/value shapes.
    pub fn inspect(signature: &GraphSignature, names: &TensorNames) -> Result<Self, GraphError> {
        let ids = signature
            .input(&names.input_ids)
            .ok_or_else(|| GraphError::MissingInput(names.input_ids.clone()))?;
        expect_spec(ids, ElementType::I64, 2)?;

        let logits = signature
            .output(&names.logits)
            .ok_or_else(|| GraphError::MissingOutput(names.logits.clone()))?;
        expect_spec(logits, ElementType::F32, 3)?;
        let vocab_size = logits
            .fixed_dim(2)
            .ok_or_else(|| unexpected(logits, "vocabulary axis is not fixed"))?;

        let layers: BTreeSet<usize> = signature
            .inputs
            .iter()
            .filter_map(|spec| names.past_key.parse_layer(&spec.name))
            .collect();
        if layers.is_empty() {
            return Err(GraphError::NoCacheLayers);
        }
        if let Some(missing) = layers.iter().enumerate().find_map(|(i, &l)| (i != l).then_some(i)) {
            return Err(GraphError::LayerGap { missing });
        }
        let layer_count = layers.len();

        let mut cache_shape: Option<(usize, usize)> = None;
        for layer in 0..layer_count {
            let specs = [
                cache_input(signature, &names.past_key, layer)?,
                cache_input(signature, &names.past_value, layer)?,
                cache_output(signature, &names.present_key, layer)?,
                cache_output(signature, &names.present_value, layer)?,
            ];
            for spec in specs {
                expect_spec(spec, ElementType::F32, 4)?;
                let shape = match (spec.fixed_dim(1), spec.fixed_dim(3)) {
                    (Some(heads), Some(head_dim)) => (heads, head_dim),
                    _ => return Err(unexpected(spec, "head axes are not fixed")),
                };
                match cache_shape {
                    None => cache_shape = Some(shape),
                    Some(expected) if expected != shape => {
                        return Err(unexpected(
                            spec,
                            &format!("expected {} heads of width {}", expected.0, expected.1),
                        ))
                    }
                    Some(_) => {}
                }
            }
        }
        let (heads, head_dim) = cache_shape.ok_or(GraphError::NoCacheLayers)?;

        Ok(Self {
            topology: ModelTopology::new(layer_count, heads, head_dim, vocab_size),
            feeds_positions: signature.input(&names.position_ids).is_some(),
            feeds_mask: signature.input(&names.attention_mask).is_some(),
        })
    }
}

pub struct GraphExecutor<B> {
    backend: B,
    names: TensorNames,
    topology: ModelTopology,
    feeds_positions: bool,
    feeds_mask: bool,
}

impl<B: GraphBackend> GraphExecutor<B> {
    pub fn new(backend: B) -> Result<Self, GraphError> {
        Self::with_names(backend, TensorNames::default())
    }

    /// Wrap `backend`, reading the topology off its signature.
    pub fn with_names(backend: B, names: TensorNames) -> Result<Self, GraphError> {
        let GraphCapabilities {
            topology,
            feeds_positions,
            feeds_mask,
        } = GraphCapabilities::inspect(backend.signature(), &names)?;

        info!(
            backend = backend.name(),
            layers = topology.layer_count,
            heads = topology.heads,
            head_dim = topology.head_dim,
            vocab_size = topology.vocab_size,
            feeds_positions,
            feeds_mask,
            "graph accepted"
        );

        Ok(Self {
            backend,
            names,
            topology,
            feeds_positions,
            feeds_mask,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn names(&self) -> &TensorNames {
        &self.names
    }

    fn feeds(&self, input: &StepInput<'_>) -> Result<NamedTensors> {
        ensure!(
            input.cache.layer_count() == self.topology.layer_count,
            "graph expects {} cache layers, got {}",
            self.topology.layer_count,
            input.cache.layer_count()
        );

        let n = input.new_tokens();
        let mut feeds = NamedTensors::new();
        let ids = input.input_ids.iter().map(|&t| t as i64).collect();
        feeds.insert(self.names.input_ids.clone(), row_i64(n, ids)?);

        if self.feeds_positions {
            let positions = input.position_ids.iter().map(|&p| p as i64).collect();
            feeds.insert(self.names.position_ids.clone(), row_i64(n, positions)?);
        }
        if self.feeds_mask {
            let mask = input.attention_mask.iter().map(|&m| m as i64).collect();
            feeds.insert(
                self.names.attention_mask.clone(),
                row_i64(input.total_length(), mask)?,
            );
        }

        for (layer, entry) in input.cache.iter().enumerate() {
            feeds.insert(
                self.names.past_key.name(layer),
                TensorData::F32(entry.key.clone().into_dyn()),
            );
            feeds.insert(
                self.names.past_value.name(layer),
                TensorData::F32(entry.value.clone().into_dyn()),
            );
        }
        Ok(feeds)
    }
}

impl<B: GraphBackend> ModelExecutor for GraphExecutor<B> {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn topology(&self) -> ModelTopology {
        self.topology
    }

    fn execute(&self, input: &StepInput<'_>) -> Result<ModelOutput> {
        let feeds = self.feeds(input)?;
        debug!(
            backend = self.backend.name(),
            feeds = feeds.len(),
            new_tokens = input.new_tokens(),
            "running graph"
        );
        let mut outputs = self
            .backend
            .run(feeds)
            .with_context(|| format!("graph `{}` failed", self.backend.name()))?;

        let signature = self.backend.signature();
        for (name, tensor) in &outputs {
            if let Some(spec) = signature.output(name) {
                ensure!(
                    spec.accepts(tensor),
                    "`{name}` came back as {:?} {:?}, declared {:?} {:?}",
                    tensor.element_type(),
                    tensor.shape(),
                    spec.element_type,
                    spec.dims
                );
            }
        }

        let logits: Array3<f32> = take_f32(&mut outputs, &self.names.logits)?
            .into_dimensionality::<Ix3>()
            .context("logits must be rank 3")?;

        // All contiguous layers go back; the cache commit checks the count.
        let returned: BTreeSet<usize> = outputs
            .keys()
            .filter_map(|name| self.names.present_key.parse_layer(name))
            .collect();
        let layer_count = returned
            .iter()
            .enumerate()
            .take_while(|&(i, &layer)| i == layer)
            .count();

        let mut present = Vec::with_capacity(layer_count);
        for layer in 0..layer_count {
            let key = take_cache(&mut outputs, &self.names.present_key.name(layer))?;
            let value = take_cache(&mut outputs, &self.names.present_value.name(layer))?;
            present.push(KvCacheEntry::new(key, value));
        }

        if !outputs.is_empty() {
            let stray: Vec<&str> = outputs.keys().map(String::as_str).collect();
            bail!("graph returned unexpected outputs: {}", stray.join(", "));
        }

        Ok(ModelOutput { logits, present })
    }
}

fn row_i64(len: usize, values: Vec<i64>) -> Result<TensorData> {
    Ok(TensorData::I64(Array2::from_shape_vec((1, len), values)?.into_dyn()))
}

fn take_f32(outputs: &mut NamedTensors, name: &str) -> Result<ArrayD<f32>> {
    outputs
        .remove(name)
        .ok_or_else(|| anyhow!("graph returned no `{name}`"))?
        .into_f32()
        .ok_or_else(|| anyhow!("`{name}` is not f32"))
}

fn take_cache(outputs: &mut NamedTensors, name: &str) -> Result<Array4<f32>> {
    take_f32(outputs, name)?
        .into_dimensionality::<Ix4>()
        .with_context(|| format!("`{name}` must be rank 4"))
}

fn cache_input<'s>(
    signature: &'s GraphSignature,
    pattern: &CachePattern,
    layer: usize,
) -> Result<&'s TensorSpec, GraphError> {
    let name = pattern.name(layer);
    signature.input(&name).ok_or(GraphError::MissingInput(name))
}

fn cache_output<'s>(
    signature: &'s GraphSignature,
    pattern: &CachePattern,
    layer: usize,
) -> Result<&'s TensorSpec, GraphError> {
    let name = pattern.name(layer);
    signature.output(&name).ok_or(GraphError::MissingOutput(name))
}

fn expect_spec(spec: &TensorSpec, element_type: ElementType, rank: usize) -> Result<(), GraphError> {
    if spec.element_type != element_type {
        return Err(unexpected(spec, &format!("expected {element_type:?} elements")));
    }
    if spec.rank() != rank {
        return Err(unexpected(spec, &format!("expected rank {rank}, declared {}", spec.rank())));
    }
    Ok(())
}

fn unexpected(spec: &TensorSpec, reason: &str) -> GraphError {
    GraphError::UnexpectedSpec {
        name: spec.name.clone(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Dim;
    use kvforge_decode::{DecodeError, DecodingController, SessionConfig, StopReason};
    use ndarray::{concatenate, Axis, IxDyn};
    use std::sync::{Arc, Mutex};

    /// Emits `(last_id + 1) % vocab` and grows every cache tensor by the
    /// submitted ids.
    struct CountingGraph {
        signature: GraphSignature,
        layers: usize,
        vocab: usize,
        stray: Option<&'static str>,
        last_feeds: Mutex<Option<NamedTensors>>,
    }

    impl CountingGraph {
        fn new(signature: GraphSignature, layers: usize, vocab: usize) -> Self {
            Self {
                signature,
                layers,
                vocab,
                stray: None,
                last_feeds: Mutex::new(None),
            }
        }

        fn standard() -> Self {
            Self::new(
                GraphSignature::causal_lm(&TensorNames::default(), 2, 2, 4, 10),
                2,
                10,
            )
        }
    }

    impl GraphBackend for CountingGraph {
        fn name(&self) -> &str {
            "counting"
        }

        fn signature(&self) -> &GraphSignature {
            &self.signature
        }

        fn run(&self, inputs: NamedTensors) -> Result<NamedTensors> {
            let names = TensorNames::default();
            let ids = inputs[&names.input_ids].as_i64().expect("ids").clone();
            let n = ids.shape()[1];

            let mut logits = Array3::<f32>::zeros((1, n, self.vocab));
            for (i, &id) in ids.iter().enumerate() {
                logits[[0, i, (id as usize + 1) % self.vocab]] = 1.0;
            }

            let mut out = NamedTensors::new();
            out.insert(names.logits.clone(), TensorData::F32(logits.into_dyn()));
            for layer in 0..self.layers {
                for (past, present) in [
                    (&names.past_key, &names.present_key),
                    (&names.past_value, &names.present_value),
                ] {
                    let past = inputs
                        .get(&past.name(layer))
                        .and_then(TensorData::as_f32)
                        .cloned()
                        .unwrap_or_else(|| ArrayD::zeros(IxDyn(&[1, 2, 0, 4])));
                    let fresh = ArrayD::<f32>::ones(IxDyn(&[1, 2, n, 4]));
                    let grown = concatenate(Axis(2), &[past.view(), fresh.view()])?;
                    out.insert(present.name(layer), TensorData::F32(grown));
                }
            }
            if let Some(name) = self.stray {
                out.insert(name.to_string(), TensorData::F32(ArrayD::zeros(IxDyn(&[1]))));
            }
            *self.last_feeds.lock().expect("lock") = Some(inputs);
            Ok(out)
        }
    }

    #[test]
    fn topology_is_read_from_signature() {
        let executor = GraphExecutor::new(CountingGraph::standard()).expect("accepted");
        assert_eq!(executor.topology(), ModelTopology::new(2, 2, 4, 10));
    }

    #[test]
    fn decodes_through_named_tensors() {
        let executor = Arc::new(GraphExecutor::new(CountingGraph::standard()).expect("accepted"));
        let mut session = DecodingController::new(executor.clone(), SessionConfig::new(3, None));
        let output = session.generate(&[5, 9, 2]).expect("generate");

        assert_eq!(output.tokens, vec![5, 9, 2, 3, 4, 5]);
        assert_eq!(output.stop_reason, StopReason::MaxTokensReached);
        assert_eq!(session.cache().expect("cache").layer_lengths(), vec![5, 5]);

        let feeds = executor.backend().last_feeds.lock().expect("lock").take().expect("feeds");
        let positions = feeds["position_ids"].as_i64().expect("positions");
        assert_eq!(positions.shape(), &[1, 1]);
        assert_eq!(positions[[0, 0]], 4);
        assert_eq!(feeds["attention_mask"].shape(), &[1, 5]);
        assert_eq!(feeds["past_key_values.1.key"].shape(), &[1, 2, 4, 4]);
    }

    #[test]
    fn optional_inputs_are_not_fed_when_undeclared() {
        let mut signature = GraphSignature::causal_lm(&TensorNames::default(), 2, 2, 4, 10);
        signature
            .inputs
            .retain(|spec| spec.name != "position_ids" && spec.name != "attention_mask");
        let executor = Arc::new(
            GraphExecutor::new(CountingGraph::new(signature, 2, 10)).expect("accepted"),
        );
        DecodingController::new(executor.clone(), SessionConfig::new(1, None))
            .generate(&[1, 2])
            .expect("generate");

        let feeds = executor.backend().last_feeds.lock().expect("lock").take().expect("feeds");
        assert!(!feeds.contains_key("position_ids"));
        assert!(!feeds.contains_key("attention_mask"));
    }

    #[test]
    fn missing_input_ids_is_rejected() {
        let mut signature = GraphSignature::causal_lm(&TensorNames::default(), 1, 2, 4, 10);
        signature.inputs.retain(|spec| spec.name != "input_ids");
        let err = GraphExecutor::new(CountingGraph::new(signature, 1, 10)).err();
        assert!(matches!(err, Some(GraphError::MissingInput(name)) if name == "input_ids"));
    }

    #[test]
    fn graph_without_cache_is_rejected() {
        let mut signature = GraphSignature::causal_lm(&TensorNames::default(), 1, 2, 4, 10);
        signature.inputs.retain(|spec| !spec.name.starts_with("past_key_values."));
        let err = GraphExecutor::new(CountingGraph::new(signature, 1, 10)).err();
        assert!(matches!(err, Some(GraphError::NoCacheLayers)));
    }

    #[test]
    fn non_contiguous_layers_are_rejected() {
        let mut signature = GraphSignature::causal_lm(&TensorNames::default(), 3, 2, 4, 10);
        signature
            .inputs
            .retain(|spec| spec.name != "past_key_values.1.key");
        let err = GraphExecutor::new(CountingGraph::new(signature, 3, 10)).err();
        assert!(matches!(err, Some(GraphError::LayerGap { missing: 1 })));
    }

    #[test]
    fn inconsistent_head_count_is_rejected() {
        let mut signature = GraphSignature::causal_lm(&TensorNames::default(), 2, 2, 4, 10);
        if let Some(spec) = signature
            .outputs
            .iter_mut()
            .find(|spec| spec.name == "present.1.value")
        {
            spec.dims[1] = Dim::Fixed(3);
        }
        let err = GraphExecutor::new(CountingGraph::new(signature, 2, 10)).err();
        assert!(
            matches!(err, Some(GraphError::UnexpectedSpec { name, .. }) if name == "present.1.value")
        );
    }

    #[test]
    fn symbolic_vocab_is_rejected() {
        let mut signature = GraphSignature::causal_lm(&TensorNames::default(), 1, 2, 4, 10);
        if let Some(spec) = signature.outputs.iter_mut().find(|spec| spec.name == "logits") {
            spec.dims[2] = Dim::symbolic("vocab");
        }
        let err = GraphExecutor::new(CountingGraph::new(signature, 1, 10)).err();
        assert!(matches!(err, Some(GraphError::UnexpectedSpec { .. })));
    }

    fn run_two_layer_graph(graph: CountingGraph) -> Result<Vec<u32>, DecodeError> {
        let executor = Arc::new(GraphExecutor::new(graph).expect("accepted"));
        let mut session = DecodingController::new(executor, SessionConfig::new(2, None));
        session.generate(&[1, 2]).map(|output| output.tokens)
    }

    #[test]
    fn extra_present_layer_is_a_layer_count_mismatch() {
        let signature = GraphSignature::causal_lm(&TensorNames::default(), 2, 2, 4, 10);
        let err = run_two_layer_graph(CountingGraph::new(signature, 3, 10)).err();
        assert!(matches!(
            err,
            Some(DecodeError::LayerCountMismatch { expected: 2, found: 3 })
        ));
    }

    #[test]
    fn missing_present_layer_is_a_layer_count_mismatch() {
        let signature = GraphSignature::causal_lm(&TensorNames::default(), 2, 2, 4, 10);
        let err = run_two_layer_graph(CountingGraph::new(signature, 1, 10)).err();
        assert!(matches!(
            err,
            Some(DecodeError::LayerCountMismatch { expected: 2, found: 1 })
        ));
    }

    #[test]
    fn stray_outputs_are_rejected() {
        let signature = GraphSignature::causal_lm(&TensorNames::default(), 2, 2, 4, 10);
        let mut graph = CountingGraph::new(signature, 2, 10);
        graph.stray = Some("present.5.key");
        let err = run_two_layer_graph(graph).err();
        assert!(
            matches!(&err, Some(DecodeError::BackendExecution { .. })),
            "unexpected result: {err:?}"
        );
        let message = err.expect("error").to_string();
        assert!(message.contains("present.5.key"), "{message}");
    }

    #[test]
    fn outputs_must_match_declared_dims() {
        let signature = GraphSignature::causal_lm(&TensorNames::default(), 2, 2, 4, 10);
        let err = run_two_layer_graph(CountingGraph::new(signature, 2, 12)).err();
        assert!(matches!(err, Some(DecodeError::BackendExecution { .. })));
    }

    #[test]
    fn capabilities_come_from_the_signature_alone() {
        let mut signature = GraphSignature::causal_lm(&TensorNames::default(), 3, 2, 8, 40);
        signature.inputs.retain(|spec| spec.name != "attention_mask");
        let caps = GraphCapabilities::inspect(&signature, &TensorNames::default()).expect("inspect");
        assert_eq!(caps.topology, ModelTopology::new(3, 2, 8, 40));
        assert!(caps.feeds_positions);
        assert!(!caps.feeds_mask);
    }
}
