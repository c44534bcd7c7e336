//! Naive-versus-cached comparison reports.
//!
//! Both paths run greedily on the same executor and prompt. The report
//! checks that they produced the same tokens, records how far the
//! per-step logits drifted apart and how much time the cache saved, and
//! serializes to JSON so runs can be diffed against a stored baseline.

use crate::session::InferenceSession;
use anyhow::{anyhow, Result};
use kvforge_decode::{
    generate_without_cache, DecodingController, GreedyPolicy, SessionState, TokenId,
};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeResult {
    pub mode: String,
    pub latency_ms: f64,
    pub tokens_generated: usize,
    pub tokens_per_sec: f64,
    pub executor_calls: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub backend: String,
    pub generated_at_unix_ms: u128,
    pub prompt_tokens: usize,
    pub tokens: Vec<TokenId>,
    pub tokens_match: bool,
    pub max_abs_logit_deviation: f64,
    pub speedup: f64,
    pub kv_cache_bytes_per_token: usize,
    pub modes: Vec<ModeResult>,
}

impl ComparisonReport {
    pub fn as_map(&self) -> BTreeMap<&str, &ModeResult> {
        self.modes
            .iter()
            .map(|result| (result.mode.as_str(), result))
            .collect()
    }

    pub fn diff<'a>(&'a self, baseline: &'a ComparisonReport) -> BTreeMap<&'a str, ModeDelta<'a>> {
        let mut deltas = BTreeMap::new();
        let previous = baseline.as_map();

        for (mode, result) in self.as_map() {
            if let Some(&baseline_result) = previous.get(mode) {
                deltas.insert(
                    mode,
                    ModeDelta {
                        current: result,
                        baseline: baseline_result,
                        latency_ms_delta: result.latency_ms - baseline_result.latency_ms,
                        tokens_per_sec_delta: result.tokens_per_sec - baseline_result.tokens_per_sec,
                    },
                );
            }
        }

        deltas
    }
}

#[derive(Debug)]
pub struct ModeDelta<'a> {
    pub current: &'a ModeResult,
    pub baseline: &'a ModeResult,
    pub latency_ms_delta: f64,
    pub tokens_per_sec_delta: f64,
}

/// Run `prompt` through both decoding paths of `session`'s executor.
pub fn compare(session: &InferenceSession, prompt: &[TokenId]) -> Result<ComparisonReport> {
    let executor = session.executor();
    let session_config = session.config().generation.session_config();

    let (naive_time, naive) = timed(|| {
        Ok(generate_without_cache(
            executor.as_ref(),
            &mut GreedyPolicy,
            prompt,
            &session_config,
        )?)
    })?;

    let mut controller = DecodingController::new(executor.clone(), session_config);
    let (cached_time, cached_logits) = timed(|| {
        controller.start(prompt)?;
        let mut logits: Vec<Array1<f32>> = Vec::new();
        while controller.state() == SessionState::Stepping {
            if let Some(outcome) = controller.step()? {
                logits.push(outcome.logits);
            }
        }
        Ok(logits)
    })?;
    let cached = controller
        .output()
        .ok_or_else(|| anyhow!("cached decoding did not stop cleanly"))?;

    let max_abs_logit_deviation = naive
        .step_logits
        .iter()
        .zip(&cached_logits)
        .flat_map(|(a, b)| a.iter().zip(b.iter()))
        .fold(0.0_f64, |acc, (a, b)| acc.max((a - b).abs() as f64));

    let naive_ms = naive_time.as_secs_f64() * 1000.0;
    let cached_ms = cached_time.as_secs_f64() * 1000.0;
    let speedup = if cached_ms > 0.0 { naive_ms / cached_ms } else { 0.0 };

    let naive_steps = naive.step_logits.len();
    let modes = vec![
        ModeResult {
            mode: "naive".to_string(),
            latency_ms: naive_ms,
            tokens_generated: naive.generated().len(),
            tokens_per_sec: per_sec(naive.generated().len(), naive_ms),
            executor_calls: naive_steps,
        },
        ModeResult {
            mode: "cached".to_string(),
            latency_ms: cached_ms,
            tokens_generated: cached.generated().len(),
            tokens_per_sec: per_sec(cached.generated().len(), cached_ms),
            executor_calls: cached.metrics.executor_calls,
        },
    ];

    let generated_at_unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis();

    Ok(ComparisonReport {
        backend: executor.name().to_string(),
        generated_at_unix_ms,
        prompt_tokens: prompt.len(),
        tokens_match: naive.tokens == cached.tokens,
        tokens: cached.tokens,
        max_abs_logit_deviation,
        speedup,
        kv_cache_bytes_per_token: cached.metrics.kv_cache_bytes_per_token,
        modes,
    })
}

fn per_sec(tokens: usize, ms: f64) -> f64 {
    if ms > 0.0 {
        tokens as f64 / ms * 1000.0
    } else {
        0.0
    }
}

fn timed<F, T>(f: F) -> Result<(Duration, T)>
where
    F: FnOnce() -> Result<T>,
{
    let start = Instant::now();
    let value = f()?;
    Ok((start.elapsed(), value))
}
