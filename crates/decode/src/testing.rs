//! Deterministic mock executors shared by unit and integration tests.

use crate::config::ModelTopology;
use crate::controller::CancelHandle;
use crate::executor::{ModelExecutor, ModelOutput};
use crate::kv_cache::{KvCacheEntry, SEQ_AXIS};
use crate::step_input::StepInput;
use anyhow::{bail, ensure, Result};
use ndarray::{concatenate, Array3, Array4, Axis};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Scores each position by the sum of every token it can see.
///
/// The cache stores each token id in the key tensor and its position in
/// the value tensor, so the running sum survives across calls without the
/// executor holding any state. For a position whose visible tokens sum to
/// `s`, the logits are `1.0` at every index `>= s % vocab_size` and `0.0`
/// below it, which makes the greedy pick depend on lowest-index tie-breaking.
pub struct ModularSumExecutor {
    topology: ModelTopology,
    calls: AtomicUsize,
}

impl ModularSumExecutor {
    pub fn new(topology: ModelTopology) -> Self {
        Self {
            topology,
            calls: AtomicUsize::new(0),
        }
    }

    /// Two layers, two heads of width four.
    pub fn with_vocab(vocab_size: usize) -> Self {
        Self::new(ModelTopology::new(2, 2, 4, vocab_size))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Token a greedy decoder picks after a context summing to `sum`.
    pub fn expected_next(&self, sum: u64) -> u32 {
        (sum % self.topology.vocab_size as u64) as u32
    }
}

impl ModelExecutor for ModularSumExecutor {
    fn name(&self) -> &str {
        "modular-sum"
    }

    fn topology(&self) -> ModelTopology {
        self.topology
    }

    fn execute(&self, input: &StepInput<'_>) -> Result<ModelOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ModelTopology {
            layer_count,
            heads,
            head_dim,
            vocab_size,
        } = self.topology;
        ensure!(
            input.cache.layer_count() == layer_count,
            "expected {} cache layers, got {}",
            layer_count,
            input.cache.layer_count()
        );
        ensure!(
            input.position_ids.len() == input.input_ids.len(),
            "position ids do not match input ids"
        );

        let mut running: u64 = match input.cache.layer(0) {
            Some((key, _)) => (0..key.len_of(Axis(SEQ_AXIS)))
                .map(|j| key[[0, 0, j, 0]] as u64)
                .sum(),
            None => 0,
        };

        let new_len = input.input_ids.len();
        let mut logits = Array3::<f32>::zeros((1, new_len, vocab_size));
        for (i, &token) in input.input_ids.iter().enumerate() {
            running += token as u64;
            let target = (running % vocab_size as u64) as usize;
            for j in target..vocab_size {
                logits[[0, i, j]] = 1.0;
            }
        }

        let new_key = Array4::from_shape_fn((1, heads, new_len, head_dim), |(_, _, i, _)| {
            input.input_ids[i] as f32
        });
        let new_value = Array4::from_shape_fn((1, heads, new_len, head_dim), |(_, _, i, _)| {
            input.position_ids[i] as f32
        });

        let mut present = Vec::with_capacity(layer_count);
        for entry in input.cache.iter() {
            let key = concatenate(Axis(SEQ_AXIS), &[entry.key.view(), new_key.view()])?;
            let value = concatenate(Axis(SEQ_AXIS), &[entry.value.view(), new_value.view()])?;
            present.push(KvCacheEntry::new(key, value));
        }

        Ok(ModelOutput { logits, present })
    }
}

/// What [`FaultyExecutor`] does wrong once it is triggered.
#[derive(Debug, Clone)]
pub enum Fault {
    /// The call itself fails.
    Error,
    /// One layer too many comes back.
    ExtraLayer,
    /// The last layer comes back with an extra head.
    WrongHeads,
    /// Logits come back one entry short on the vocabulary axis.
    ShortLogits,
    /// The given handle is cancelled while the call is in flight.
    CancelDuring(CancelHandle),
}

/// Behaves like [`ModularSumExecutor`] for the first `healthy_calls` calls,
/// then injects `fault` on every later call.
pub struct FaultyExecutor {
    inner: ModularSumExecutor,
    fault: Fault,
    healthy_calls: usize,
}

impl FaultyExecutor {
    pub fn new(inner: ModularSumExecutor, fault: Fault, healthy_calls: usize) -> Self {
        Self {
            inner,
            fault,
            healthy_calls,
        }
    }

    pub fn calls(&self) -> usize {
        self.inner.calls()
    }
}

impl ModelExecutor for FaultyExecutor {
    fn name(&self) -> &str {
        "faulty"
    }

    fn topology(&self) -> ModelTopology {
        self.inner.topology()
    }

    fn execute(&self, input: &StepInput<'_>) -> Result<ModelOutput> {
        let triggered = self.inner.calls() >= self.healthy_calls;
        let mut output = self.inner.execute(input)?;
        if !triggered {
            return Ok(output);
        }

        match &self.fault {
            Fault::Error => bail!("injected backend failure"),
            Fault::ExtraLayer => {
                let extra = output.present[0].clone();
                output.present.push(extra);
            }
            Fault::WrongHeads => {
                if let Some(last) = output.present.last_mut() {
                    let (batch, heads, len, dim) = last.key.dim();
                    *last = KvCacheEntry::new(
                        Array4::zeros((batch, heads + 1, len, dim)),
                        Array4::zeros((batch, heads + 1, len, dim)),
                    );
                }
            }
            Fault::ShortLogits => {
                let (batch, len, vocab) = output.logits.dim();
                output.logits = Array3::zeros((batch, len, vocab.saturating_sub(1)));
            }
            Fault::CancelDuring(handle) => handle.cancel(),
        }
        Ok(output)
    }
}
