//! Tensor naming conventions for exported decoder graphs.

use serde::{Deserialize, Serialize};

/// Per-layer tensor name built as `{prefix}{layer}{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePattern {
    pub prefix: String,
    pub suffix: String,
}

impl CachePattern {
    pub fn new(prefix: &str, suffix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        }
    }

    pub fn name(&self, layer: usize) -> String {
        format!("{}{}{}", self.prefix, layer, self.suffix)
    }

    /// Layer index encoded in `name`, if it follows this pattern.
    pub fn parse_layer(&self, name: &str) -> Option<usize> {
        let digits = name
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

/// Names the adapter uses when talking to a graph. Defaults follow the
/// Hugging Face Optimum export layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorNames {
    pub input_ids: String,
    pub position_ids: String,
    pub attention_mask: String,
    pub logits: String,
    pub past_key: CachePattern,
    pub past_value: CachePattern,
    pub present_key: CachePattern,
    pub present_value: CachePattern,
}

impl Default for TensorNames {
    fn default() -> Self {
        Self {
            input_ids: "input_ids".to_string(),
            position_ids: "position_ids".to_string(),
            attention_mask: "attention_mask".to_string(),
            logits: "logits".to_string(),
            past_key: CachePattern::new("past_key_values.", ".key"),
            past_value: CachePattern::new("past_key_values.", ".value"),
            present_key: CachePattern::new("present.", ".key"),
            present_value: CachePattern::new("present.", ".value"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_round_trips_layer_index() {
        let names = TensorNames::default();
        assert_eq!(names.past_key.name(3), "past_key_values.3.key");
        assert_eq!(names.present_value.name(0), "present.0.value");
        assert_eq!(names.past_key.parse_layer("past_key_values.11.key"), Some(11));
    }

    #[test]
    fn pattern_rejects_foreign_names() {
        let pattern = CachePattern::new("past_key_values.", ".key");
        assert_eq!(pattern.parse_layer("past_key_values.1.value"), None);
        assert_eq!(pattern.parse_layer("past_key_values..key"), None);
        assert_eq!(pattern.parse_layer("past_key_values.-1.key"), None);
        assert_eq!(pattern.parse_layer("input_ids"), None);
    }

    #[test]
    fn partial_override_keeps_defaults() {
        let names: TensorNames =
            serde_json::from_str(r#"{ "logits": "lm_logits" }"#).expect("parse");
        assert_eq!(names.logits, "lm_logits");
        assert_eq!(names.input_ids, "input_ids");
    }
}
