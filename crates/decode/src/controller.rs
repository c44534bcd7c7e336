//! Decoding session state machine.
//!
//! `Init -> Stepping -> Stopped(reason)`, or `Failed` on the first
//! component error. Each step builds a fresh [`StepInput`], calls the
//! executor once, validates everything it returned, commits the cache for
//! all layers at once and only then appends the chosen token.

use crate::config::{ModelTopology, SessionConfig};
use crate::error::{DecodeError, DecodeResult};
use crate::executor::ModelExecutor;
use crate::kv_cache::CacheStore;
use crate::policy::{DecodingPolicy, GreedyPolicy};
use crate::sequence::{TokenId, TokenSequence};
use crate::step_input::StepInputBuilder;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxTokensReached,
    StopTokenEmitted,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Stepping,
    Stopped(StopReason),
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped(_) | SessionState::Failed)
    }
}

/// Cooperative cancellation flag shared between a session and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one committed step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub token: TokenId,
    /// Logits of the last submitted position.
    pub logits: Array1<f32>,
    /// Cache length after the commit.
    pub cache_length: usize,
    pub state: SessionState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodeMetrics {
    pub prefill_ms: f64,
    pub decode_ms: f64,
    pub tokens_generated: usize,
    pub tokens_per_sec: f64,
    pub kv_cache_bytes_per_token: usize,
    pub executor_calls: usize,
}

impl DecodeMetrics {
    pub fn total_ms(&self) -> f64 {
        self.prefill_ms + self.decode_ms
    }

    /// Book one executor call. Calls made before the first committed token
    /// count towards prefill.
    fn record_call(&mut self, prefill: bool, elapsed_ms: f64) {
        self.executor_calls += 1;
        if prefill {
            self.prefill_ms += elapsed_ms;
        } else {
            self.decode_ms += elapsed_ms;
        }
    }

    fn finalize(&mut self, tokens_generated: usize) {
        self.tokens_generated = tokens_generated;
        let total_ms = self.total_ms();
        self.tokens_per_sec = if total_ms > 0.0 {
            (tokens_generated as f64 / total_ms) * 1000.0
        } else {
            0.0
        };
    }
}

/// Owned summary of a finished session.
#[derive(Debug, Clone)]
pub struct DecodeOutput {
    pub tokens: Vec<TokenId>,
    pub prompt_len: usize,
    pub stop_reason: StopReason,
    pub metrics: DecodeMetrics,
}

impl DecodeOutput {
    pub fn generated(&self) -> &[TokenId] {
        &self.tokens[self.prompt_len..]
    }
}

pub struct DecodingController {
    executor: Arc<dyn ModelExecutor>,
    policy: Box<dyn DecodingPolicy>,
    config: SessionConfig,
    topology: ModelTopology,
    sequence: Option<TokenSequence>,
    cache: Option<CacheStore>,
    state: SessionState,
    steps_taken: usize,
    failure: Option<String>,
    cancel: CancelHandle,
    metrics: DecodeMetrics,
}

impl DecodingController {
    pub fn new(executor: Arc<dyn ModelExecutor>, config: SessionConfig) -> Self {
        let topology = executor.topology();
        Self {
            executor,
            policy: Box::new(GreedyPolicy),
            config,
            topology,
            sequence: None,
            cache: None,
            state: SessionState::Init,
            steps_taken: 0,
            failure: None,
            cancel: CancelHandle::new(),
            metrics: DecodeMetrics::default(),
        }
    }

    pub fn with_policy<P: DecodingPolicy + 'static>(self, policy: P) -> Self {
        self.with_boxed_policy(Box::new(policy))
    }

    pub fn with_boxed_policy(mut self, policy: Box<dyn DecodingPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn topology(&self) -> &ModelTopology {
        &self.topology
    }

    pub fn sequence(&self) -> Option<&TokenSequence> {
        self.sequence.as_ref()
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    /// Tokens in the sequence that the cache has not absorbed yet.
    pub fn pending_tokens(&self) -> usize {
        match (&self.sequence, &self.cache) {
            (Some(sequence), Some(cache)) => sequence.len().saturating_sub(cache.cache_length()),
            _ => 0,
        }
    }

    /// Display form of the error that moved the session to `Failed`.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn metrics(&self) -> &DecodeMetrics {
        &self.metrics
    }

    /// Validate the prompt and create the session's sequence and cache.
    pub fn start(&mut self, prompt: &[TokenId]) -> DecodeResult<()> {
        if self.state != SessionState::Init {
            return Err(DecodeError::NotStepping { state: self.state });
        }

        let sequence = match TokenSequence::from_prompt(prompt) {
            Ok(sequence) => sequence,
            Err(err) => return Err(self.fail(err)),
        };
        let cache = CacheStore::for_topology(&self.topology, 1);
        self.metrics.kv_cache_bytes_per_token = cache.bytes_per_token();
        self.sequence = Some(sequence);
        self.cache = Some(cache);
        self.state = SessionState::Stepping;

        info!(
            backend = self.executor.name(),
            policy = self.policy.name(),
            prompt_tokens = prompt.len(),
            max_new_tokens = self.config.max_new_tokens,
            "decode session started"
        );

        if self.config.max_new_tokens == 0 {
            self.finish(StopReason::MaxTokensReached);
        }
        Ok(())
    }

    /// Run one step. `Ok(None)` means cancellation was observed and no
    /// token was retained.
    pub fn step(&mut self) -> DecodeResult<Option<StepOutcome>> {
        if self.state != SessionState::Stepping {
            return Err(DecodeError::NotStepping { state: self.state });
        }
        if self.cancel.is_cancelled() {
            self.finish(StopReason::Cancelled);
            return Ok(None);
        }

        match self.advance() {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Step until a terminal state.
    pub fn run(&mut self) -> DecodeResult<&TokenSequence> {
        while self.state == SessionState::Stepping {
            self.step()?;
        }
        self.sequence
            .as_ref()
            .ok_or(DecodeError::NotStepping { state: self.state })
    }

    /// `start` followed by `run`, returning an owned summary.
    pub fn generate(&mut self, prompt: &[TokenId]) -> DecodeResult<DecodeOutput> {
        self.start(prompt)?;
        self.run()?;
        self.output()
            .ok_or(DecodeError::NotStepping { state: self.state })
    }

    /// Summary of a stopped session; `None` unless the state is `Stopped`.
    pub fn output(&self) -> Option<DecodeOutput> {
        let SessionState::Stopped(stop_reason) = self.state else {
            return None;
        };
        let sequence = self.sequence.as_ref()?;
        Some(DecodeOutput {
            tokens: sequence.as_slice().to_vec(),
            prompt_len: sequence.prompt_len(),
            stop_reason,
            metrics: self.metrics.clone(),
        })
    }

    fn advance(&mut self) -> DecodeResult<Option<StepOutcome>> {
        let state = self.state;
        let (Some(sequence), Some(cache)) = (self.sequence.as_mut(), self.cache.as_mut()) else {
            return Err(DecodeError::NotStepping { state });
        };

        let started = Instant::now();
        let (output, appended) = {
            let input = StepInputBuilder::build(sequence, cache)?;
            debug!(
                step = self.steps_taken,
                cache_length = input.cache_length(),
                new_tokens = input.new_tokens(),
                "executing decode step"
            );
            let output = self.executor.execute(&input).map_err(|source| {
                DecodeError::BackendExecution {
                    backend: self.executor.name().to_string(),
                    source,
                }
            })?;
            (output, input.new_tokens())
        };
        self.metrics
            .record_call(self.steps_taken == 0, started.elapsed().as_secs_f64() * 1000.0);

        if self.cancel.is_cancelled() {
            debug!(step = self.steps_taken, "discarding step output after cancellation");
            self.finish(StopReason::Cancelled);
            return Ok(None);
        }

        let expected_logits = [cache.batch(), appended, self.topology.vocab_size];
        if output.logits.shape() != expected_logits {
            return Err(DecodeError::shape(
                "logits",
                &expected_logits,
                output.logits.shape(),
            ));
        }
        let logits = match output.last_logits() {
            Some(row) => row.to_owned(),
            None => {
                return Err(DecodeError::shape(
                    "logits",
                    &expected_logits,
                    output.logits.shape(),
                ))
            }
        };

        cache.commit(output.present, appended)?;
        let token = self.policy.select(logits.view(), sequence.as_slice());
        sequence.push(token);
        let cache_length = cache.cache_length();

        self.steps_taken += 1;

        if self.config.stop_token == Some(token) {
            self.finish(StopReason::StopTokenEmitted);
        } else if self.steps_taken >= self.config.max_new_tokens {
            self.finish(StopReason::MaxTokensReached);
        }

        Ok(Some(StepOutcome {
            token,
            logits,
            cache_length,
            state: self.state,
        }))
    }

    fn finish(&mut self, reason: StopReason) {
        self.state = SessionState::Stopped(reason);
        self.metrics.finalize(self.steps_taken);
        if reason == StopReason::Cancelled {
            warn!(steps = self.steps_taken, "decode session cancelled");
        } else {
            info!(
                ?reason,
                steps = self.steps_taken,
                tokens_per_sec = self.metrics.tokens_per_sec,
                "decode session stopped"
            );
        }
    }

    fn fail(&mut self, err: DecodeError) -> DecodeError {
        warn!(error = %err, steps = self.steps_taken, "decode session failed");
        self.state = SessionState::Failed;
        self.failure = Some(err.to_string());
        self.metrics.finalize(self.steps_taken);
        err
    }
}
