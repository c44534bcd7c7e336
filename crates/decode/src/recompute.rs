//! Decoding without a cache: every step re-submits the whole sequence.
//!
//! Cost per step grows with sequence length. Kept as the baseline the
//! cached controller is measured and checked against.

use crate::config::SessionConfig;
use crate::controller::StopReason;
use crate::error::{DecodeError, DecodeResult};
use crate::executor::ModelExecutor;
use crate::kv_cache::CacheStore;
use crate::policy::DecodingPolicy;
use crate::sequence::{TokenId, TokenSequence};
use crate::step_input::StepInputBuilder;
use ndarray::{Array1, Axis};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RecomputeTrace {
    pub tokens: Vec<TokenId>,
    pub prompt_len: usize,
    /// Last-position logits for each step, in order.
    pub step_logits: Vec<Array1<f32>>,
    pub stop_reason: StopReason,
    pub elapsed_ms: f64,
}

impl RecomputeTrace {
    pub fn generated(&self) -> &[TokenId] {
        &self.tokens[self.prompt_len..]
    }
}

/// Logits for the last position of `tokens`, computed from scratch.
pub fn full_sequence_logits(
    executor: &dyn ModelExecutor,
    tokens: &[TokenId],
) -> DecodeResult<Array1<f32>> {
    let topology = executor.topology();
    let empty = CacheStore::for_topology(&topology, 1);
    let input = StepInputBuilder::assemble(tokens, empty.view())?;
    let output = executor
        .execute(&input)
        .map_err(|source| DecodeError::BackendExecution {
            backend: executor.name().to_string(),
            source,
        })?;

    let expected = [1, tokens.len(), topology.vocab_size];
    if output.logits.shape() != expected {
        return Err(DecodeError::shape("logits", &expected, output.logits.shape()));
    }
    if output.present.len() != topology.layer_count {
        return Err(DecodeError::LayerCountMismatch {
            expected: topology.layer_count,
            found: output.present.len(),
        });
    }
    Ok(output
        .logits
        .index_axis(Axis(0), 0)
        .index_axis(Axis(0), tokens.len() - 1)
        .to_owned())
}

pub fn generate_without_cache(
    executor: &dyn ModelExecutor,
    policy: &mut dyn DecodingPolicy,
    prompt: &[TokenId],
    config: &SessionConfig,
) -> DecodeResult<RecomputeTrace> {
    let mut sequence = TokenSequence::from_prompt(prompt)?;
    let mut step_logits = Vec::with_capacity(config.max_new_tokens);
    let mut stop_reason = StopReason::MaxTokensReached;
    let started = Instant::now();

    for step in 0..config.max_new_tokens {
        debug!(step, sequence_len = sequence.len(), "recomputing full sequence");
        let logits = full_sequence_logits(executor, sequence.as_slice())?;
        let token = policy.select(logits.view(), sequence.as_slice());
        sequence.push(token);
        step_logits.push(logits);

        if config.stop_token == Some(token) {
            stop_reason = StopReason::StopTokenEmitted;
            break;
        }
    }

    Ok(RecomputeTrace {
        prompt_len: sequence.prompt_len(),
        tokens: sequence.into_vec(),
        step_logits,
        stop_reason,
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
    })
}
