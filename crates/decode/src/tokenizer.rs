//! Tokenizer boundary.
//!
//! The decoding core only ever looks at integer ids and the stop id; real
//! vocabularies live behind [`Tokenizer`].

use crate::sequence::TokenId;
use std::collections::HashMap;

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<TokenId>;

    fn decode(&self, ids: &[TokenId]) -> String;

    fn stop_token(&self) -> Option<TokenId>;

    fn vocab_size(&self) -> usize;
}

pub const PAD_TOKEN: TokenId = 0;
pub const UNK_TOKEN: TokenId = 1;
pub const EOS_TOKEN: TokenId = 2;

const COMMON_WORDS: &[&str] = &[
    "the", "a", "is", "in", "to", "of", "and", "for", "on", "with", "as", "at", "by", "from",
    "it", "this", "that", "are", "was", "be", "have", "has", "had", "not", "can", "will",
    "would", "could", "should", "said", "there", "their", "they", "we", "you", "he", "she", "i",
    "my", "your", "our", "but", "or", "so", "if", "then", "when", "where", "what", "how", "why",
    "who", "which", "do", "does", "did", "go", "come", "see", "get", "make", "know", "think",
    "take", "want", "use", "find", "give", "tell", "work", "call", "try", "ask", "need", "feel",
    "become", "leave", "put", "cache", "token", "model", "next", "word",
];

/// Whitespace word tokenizer with a fixed vocabulary. Unknown words map to
/// `<unk>`; `<eos>` is the stop token.
pub struct WordTokenizer {
    vocab: HashMap<String, TokenId>,
    reverse_vocab: HashMap<TokenId, String>,
    vocab_size: usize,
}

impl WordTokenizer {
    pub fn new(vocab_size: usize) -> Self {
        let reserved = [("<pad>", PAD_TOKEN), ("<unk>", UNK_TOKEN), ("<eos>", EOS_TOKEN)];
        let words = COMMON_WORDS
            .iter()
            .enumerate()
            .map(|(i, word)| (*word, (i + reserved.len()) as TokenId));

        let mut vocab = HashMap::new();
        let mut reverse_vocab = HashMap::new();
        for (word, id) in reserved.into_iter().chain(words) {
            if id as usize >= vocab_size {
                break;
            }
            vocab.insert(word.to_string(), id);
            reverse_vocab.insert(id, word.to_string());
        }

        Self {
            vocab,
            reverse_vocab,
            vocab_size,
        }
    }
}

impl Tokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        text.split_whitespace()
            .map(|word| {
                self.vocab
                    .get(&word.to_lowercase())
                    .copied()
                    .unwrap_or(UNK_TOKEN)
            })
            .collect()
    }

    /// Ids outside the vocabulary render as `<id>`.
    fn decode(&self, ids: &[TokenId]) -> String {
        ids.iter()
            .map(|id| {
                self.reverse_vocab
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| format!("<{id}>"))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn stop_token(&self) -> Option<TokenId> {
        Some(EOS_TOKEN)
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_known_words() {
        let tok = WordTokenizer::new(1000);
        let ids = tok.encode("The quick cache");
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[1], UNK_TOKEN);
        assert_eq!(tok.decode(&ids), "the <unk> cache");
    }

    #[test]
    fn small_vocab_truncates_words() {
        let tok = WordTokenizer::new(4);
        assert_eq!(tok.encode("the a"), vec![3, UNK_TOKEN]);
        assert_eq!(tok.decode(&[2, 9]), "<eos> <9>");
        assert_eq!(tok.stop_token(), Some(EOS_TOKEN));
    }
}
