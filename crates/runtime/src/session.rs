//! Inference session orchestration.

use crate::config::{BackendKind, DecodeMode, RuntimeConfig};
use anyhow::{Context, Result};
use kvforge_backend_cpu::{ModelWeights, ReferenceGraph, ReferenceModel};
use kvforge_decode::{
    generate_without_cache, DecodeMetrics, DecodingController, ModelExecutor, StopReason, TokenId,
    Tokenizer, WordTokenizer,
};
use kvforge_graph::{GraphCapabilities, GraphExecutor, GraphSignature, TensorNames};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Result of one generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub mode: DecodeMode,
    pub tokens: Vec<TokenId>,
    pub prompt_len: usize,
    pub text: String,
    pub stop_reason: StopReason,
    pub elapsed_ms: f64,
    /// Only the cached path records per-phase metrics.
    pub metrics: Option<DecodeMetrics>,
}

impl Generation {
    pub fn generated(&self) -> &[TokenId] {
        &self.tokens[self.prompt_len..]
    }
}

/// Long-lived owner of one executor and tokenizer. Every call to
/// [`generate`](Self::generate) opens a fresh decoding session.
pub struct InferenceSession {
    config: RuntimeConfig,
    executor: Arc<dyn ModelExecutor>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl InferenceSession {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let model_config = config.model.clone();
        let weights = match &config.weights {
            Some(path) => {
                info!(path = %path.display(), "loading weights from safetensors");
                ModelWeights::load_safetensors(path, &model_config)?
            }
            None => {
                info!(seed = config.weight_seed, "using random weights (not pretrained)");
                ModelWeights::random(&model_config, config.weight_seed)
            }
        };
        let model = ReferenceModel::new(model_config, weights)?;

        let executor: Arc<dyn ModelExecutor> = match config.backend {
            BackendKind::Reference => Arc::new(model),
            BackendKind::Graph => Arc::new(
                GraphExecutor::new(ReferenceGraph::new(model))
                    .context("reference graph failed the capability check")?,
            ),
        };
        let tokenizer = Arc::new(WordTokenizer::new(config.model.vocab_size));
        Ok(Self::with_executor(config, executor, tokenizer))
    }

    pub fn with_executor(
        config: RuntimeConfig,
        executor: Arc<dyn ModelExecutor>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        info!(
            backend = executor.name(),
            layers = executor.topology().layer_count,
            mode = config.mode.as_str(),
            "inference session ready"
        );
        Self {
            config,
            executor,
            tokenizer,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn executor(&self) -> Arc<dyn ModelExecutor> {
        self.executor.clone()
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    /// Encode `prompt`, decode in the configured mode, render the result.
    pub fn generate(&self, prompt: &str) -> Result<Generation> {
        let ids = self.tokenizer.encode(prompt);
        info!(prompt = %prompt, tokens = ids.len(), "prompt encoded");
        self.generate_ids(&ids, self.config.mode)
    }

    pub fn generate_ids(&self, prompt: &[TokenId], mode: DecodeMode) -> Result<Generation> {
        let generation = &self.config.generation;
        let session_config = generation.session_config();

        let (tokens, prompt_len, stop_reason, elapsed_ms, metrics) = match mode {
            DecodeMode::Cached => {
                let mut controller =
                    DecodingController::new(self.executor.clone(), session_config)
                        .with_boxed_policy(generation.policy());
                let output = controller.generate(prompt)?;
                let elapsed_ms = output.metrics.total_ms();
                (
                    output.tokens,
                    output.prompt_len,
                    output.stop_reason,
                    elapsed_ms,
                    Some(output.metrics),
                )
            }
            DecodeMode::Naive => {
                let mut policy = generation.policy();
                let trace = generate_without_cache(
                    self.executor.as_ref(),
                    policy.as_mut(),
                    prompt,
                    &session_config,
                )?;
                (
                    trace.tokens,
                    trace.prompt_len,
                    trace.stop_reason,
                    trace.elapsed_ms,
                    None,
                )
            }
        };

        let text = self.tokenizer.decode(&tokens[prompt_len..]);
        Ok(Generation {
            mode,
            tokens,
            prompt_len,
            text,
            stop_reason,
            elapsed_ms,
            metrics,
        })
    }
}

/// Load a graph signature from disk and run the adapter's capability check
/// on it, without building a backend.
pub fn check_signature(path: impl AsRef<Path>) -> Result<GraphCapabilities> {
    let path = path.as_ref();
    let signature = GraphSignature::load_json(path)?;
    GraphCapabilities::inspect(&signature, &TensorNames::default())
        .with_context(|| format!("graph signature {} failed the capability check", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvforge_backend_cpu::ModelConfig;
    use kvforge_decode::testing::ModularSumExecutor;

    #[test]
    fn session_over_mock_executor() {
        let mut config = RuntimeConfig::default();
        config.generation.max_new_tokens = 3;
        config.generation.stop_token = None;
        let session = InferenceSession::with_executor(
            config,
            Arc::new(ModularSumExecutor::with_vocab(10)),
            Arc::new(WordTokenizer::new(10)),
        );

        let cached = session.generate_ids(&[5, 9, 2], DecodeMode::Cached).expect("cached");
        let naive = session.generate_ids(&[5, 9, 2], DecodeMode::Naive).expect("naive");
        assert_eq!(cached.generated(), &[6, 2, 4]);
        assert_eq!(cached.tokens, naive.tokens);
        assert!(cached.metrics.is_some());
        assert!(naive.metrics.is_none());
    }

    #[test]
    fn empty_text_prompt_is_an_error() {
        let session = InferenceSession::new(RuntimeConfig::default()).expect("session");
        assert!(session.generate("   ").is_err());
    }

    #[test]
    fn saved_reference_signature_passes_the_check() {
        let config = ModelConfig::tiny();
        let path = std::env::temp_dir().join(format!("kvforge-signature-{}.json", std::process::id()));
        ReferenceGraph::signature_for(&config, &TensorNames::default())
            .save_json(&path)
            .expect("save");
        let caps = check_signature(&path);
        let _ = std::fs::remove_file(&path);

        let caps = caps.expect("check");
        assert_eq!(caps.topology, config.topology());
        assert!(caps.feeds_positions && caps.feeds_mask);
    }

    #[test]
    fn signature_without_cache_fails_the_check() {
        let path = std::env::temp_dir().join(format!("kvforge-nocache-{}.json", std::process::id()));
        let mut signature = GraphSignature::causal_lm(&TensorNames::default(), 1, 2, 4, 10);
        signature.inputs.retain(|spec| !spec.name.starts_with("past_key_values."));
        signature.save_json(&path).expect("save");
        let result = check_signature(&path);
        let _ = std::fs::remove_file(&path);
        assert!(result.is_err());
    }
}
