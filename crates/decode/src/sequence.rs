//! Append-only token sequence for a decoding session.

use crate::error::{DecodeError, DecodeResult};

pub type TokenId = u32;

/// Prompt followed by generated tokens. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    tokens: Vec<TokenId>,
    prompt_len: usize,
}

impl TokenSequence {
    pub fn from_prompt(prompt: &[TokenId]) -> DecodeResult<Self> {
        if prompt.is_empty() {
            return Err(DecodeError::EmptyPrompt);
        }
        Ok(Self {
            tokens: prompt.to_vec(),
            prompt_len: prompt.len(),
        })
    }

    pub fn push(&mut self, token: TokenId) {
        self.tokens.push(token);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// A sequence built from a prompt is never empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn as_slice(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn prompt(&self) -> &[TokenId] {
        &self.tokens[..self.prompt_len]
    }

    pub fn generated(&self) -> &[TokenId] {
        &self.tokens[self.prompt_len..]
    }

    pub fn last(&self) -> TokenId {
        self.tokens[self.tokens.len() - 1]
    }

    /// Tokens from `start` onward; empty when `start >= len`.
    pub fn tail(&self, start: usize) -> &[TokenId] {
        self.tokens.get(start..).unwrap_or(&[])
    }

    pub fn into_vec(self) -> Vec<TokenId> {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prompt_rejected() {
        assert!(matches!(
            TokenSequence::from_prompt(&[]),
            Err(DecodeError::EmptyPrompt)
        ));
    }

    #[test]
    fn prompt_and_generated_split() {
        let mut seq = TokenSequence::from_prompt(&[5, 9, 2]).expect("non-empty");
        seq.push(6);
        assert_eq!(seq.prompt(), &[5, 9, 2]);
        assert_eq!(seq.generated(), &[6]);
        assert_eq!(seq.last(), 6);
        assert_eq!(seq.tail(3), &[6]);
        assert!(seq.tail(10).is_empty());
    }
}
