//! Scorer topology and per-session decoding parameters.

use crate::sequence::TokenId;
use serde::{Deserialize, Serialize};

/// Immutable shape facts about a scorer, fixed at model-load time and
/// shared read-only by every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTopology {
    pub layer_count: usize,
    pub heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
}

impl ModelTopology {
    pub fn new(layer_count: usize, heads: usize, head_dim: usize, vocab_size: usize) -> Self {
        Self {
            layer_count,
            heads,
            head_dim,
            vocab_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on generated tokens; zero leaves the prompt untouched.
    pub max_new_tokens: usize,
    /// Generation stops right after this token is emitted.
    pub stop_token: Option<TokenId>,
}

impl SessionConfig {
    pub fn new(max_new_tokens: usize, stop_token: Option<TokenId>) -> Self {
        Self {
            max_new_tokens,
            stop_token,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 20,
            stop_token: None,
        }
    }
}
