//! Incremental decoding over a stateless scorer with a key/value cache.
//!
//! This crate implements the decoding core:
//! - [`TokenSequence`]: append-only prompt + generated ids
//! - [`CacheStore`]: per-layer key/value tensors with all-or-nothing commits
//! - [`StepInputBuilder`]: ids, positions and mask for the next call
//! - [`ModelExecutor`]: the stateless forward-pass contract
//! - [`DecodingPolicy`]: logits row to next token (greedy by default)
//! - [`DecodingController`]: the step loop and its state machine
//!
//! [`recompute`] holds the cache-free baseline that re-submits the whole
//! sequence on every step.

pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod kv_cache;
pub mod policy;
pub mod recompute;
pub mod sequence;
pub mod step_input;
pub mod testing;
pub mod tokenizer;

pub use config::{ModelTopology, SessionConfig};
pub use controller::{
    CancelHandle, DecodeMetrics, DecodeOutput, DecodingController, SessionState, StepOutcome,
    StopReason,
};
pub use error::{DecodeError, DecodeResult};
pub use executor::{ModelExecutor, ModelOutput};
pub use kv_cache::{CacheStore, CacheView, KvCacheEntry};
pub use policy::{argmax, policy_fn, DecodingPolicy, GreedyPolicy, TemperaturePolicy};
pub use recompute::{full_sequence_logits, generate_without_cache, RecomputeTrace};
pub use sequence::{TokenId, TokenSequence};
pub use step_input::{StepInput, StepInputBuilder};
pub use tokenizer::{Tokenizer, WordTokenizer};
