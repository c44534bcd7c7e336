//! Per-step executor inputs derived from sequence and cache occupancy.

use crate::error::{DecodeError, DecodeResult};
use crate::kv_cache::{CacheStore, CacheView};
use crate::sequence::{TokenId, TokenSequence};

/// Everything the executor needs for one call. Built fresh each step and
/// never mutated afterwards.
#[derive(Debug, Clone)]
pub struct StepInput<'a> {
    /// Tokens not yet reflected in the cache.
    pub input_ids: Vec<TokenId>,
    /// Absolute positions, starting at the current cache length.
    pub position_ids: Vec<usize>,
    /// One entry per cached or submitted token; always all ones.
    pub attention_mask: Vec<u8>,
    pub cache: CacheView<'a>,
}

impl StepInput<'_> {
    pub fn cache_length(&self) -> usize {
        self.cache.cache_length()
    }

    /// `cache_length + input_ids.len()`, the length every returned cache
    /// entry must have.
    pub fn total_length(&self) -> usize {
        self.attention_mask.len()
    }

    pub fn new_tokens(&self) -> usize {
        self.input_ids.len()
    }
}

pub struct StepInputBuilder;

impl StepInputBuilder {
    /// Inputs for the next step: on the first step the whole prompt, later
    /// only the generated token(s) the cache has not absorbed yet.
    pub fn build<'a>(sequence: &TokenSequence, cache: &'a CacheStore) -> DecodeResult<StepInput<'a>> {
        let uncached = sequence.tail(cache.cache_length());
        Self::assemble(uncached, cache.view())
    }

    pub fn assemble<'a>(new_ids: &[TokenId], cache: CacheView<'a>) -> DecodeResult<StepInput<'a>> {
        if new_ids.is_empty() {
            return Err(DecodeError::EmptyStep);
        }
        let cache_length = cache.cache_length();
        let total = cache_length + new_ids.len();
        Ok(StepInput {
            input_ids: new_ids.to_vec(),
            position_ids: (cache_length..total).collect(),
            attention_mask: vec![1; total],
            cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::KvCacheEntry;
    use ndarray::Array4;

    #[test]
    fn first_step_submits_whole_prompt() {
        let seq = TokenSequence::from_prompt(&[5, 9, 2]).expect("prompt");
        let cache = CacheStore::initialize(2, 1, 2, 4);
        let input = StepInputBuilder::build(&seq, &cache).expect("input");

        assert_eq!(input.input_ids, vec![5, 9, 2]);
        assert_eq!(input.position_ids, vec![0, 1, 2]);
        assert_eq!(input.attention_mask, vec![1, 1, 1]);
        assert_eq!(input.cache_length(), 0);
    }

    #[test]
    fn later_steps_submit_only_uncached_tokens() {
        let mut seq = TokenSequence::from_prompt(&[5, 9, 2]).expect("prompt");
        let mut cache = CacheStore::initialize(1, 1, 2, 4);
        let filled = KvCacheEntry::new(Array4::zeros((1, 2, 3, 4)), Array4::zeros((1, 2, 3, 4)));
        cache.commit(vec![filled], 3).expect("commit");
        seq.push(6);

        let input = StepInputBuilder::build(&seq, &cache).expect("input");
        assert_eq!(input.input_ids, vec![6]);
        assert_eq!(input.position_ids, vec![3]);
        assert_eq!(input.attention_mask.len(), 4);
        assert_eq!(input.total_length(), 4);
    }

    #[test]
    fn nothing_uncached_is_an_empty_step() {
        let seq = TokenSequence::from_prompt(&[1]).expect("prompt");
        let mut cache = CacheStore::initialize(1, 1, 1, 1);
        let filled = KvCacheEntry::new(Array4::zeros((1, 1, 1, 1)), Array4::zeros((1, 1, 1, 1)));
        cache.commit(vec![filled], 1).expect("commit");

        assert!(matches!(
            StepInputBuilder::build(&seq, &cache),
            Err(DecodeError::EmptyStep)
        ));
    }
}
