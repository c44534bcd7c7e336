//! Runtime configuration, loadable from JSON.

use anyhow::{Context, Result};
use kvforge_backend_cpu::ModelConfig;
use kvforge_decode::tokenizer::EOS_TOKEN;
use kvforge_decode::{DecodingPolicy, GreedyPolicy, SessionConfig, TemperaturePolicy, TokenId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Which executor a session is built on. Chosen once, at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The ndarray model called directly.
    #[default]
    Reference,
    /// The same model behind the named-tensor graph adapter.
    Graph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMode {
    /// Incremental decoding with the key/value cache.
    #[default]
    Cached,
    /// Full recomputation of the sequence on every step.
    Naive,
}

impl DecodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeMode::Cached => "cached",
            DecodeMode::Naive => "naive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub stop_token: Option<TokenId>,
    /// Zero selects greedy decoding.
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 20,
            stop_token: Some(EOS_TOKEN),
            temperature: 0.0,
            top_k: None,
            seed: None,
        }
    }
}

impl GenerationConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.max_new_tokens, self.stop_token)
    }

    pub fn policy(&self) -> Box<dyn DecodingPolicy> {
        if self.temperature < 1e-5 {
            Box::new(GreedyPolicy)
        } else {
            Box::new(TemperaturePolicy::new(self.temperature, self.top_k, self.seed))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: BackendKind,
    pub mode: DecodeMode,
    pub model: ModelConfig,
    pub generation: GenerationConfig,
    /// Safetensors file; seeded random weights when absent.
    pub weights: Option<PathBuf>,
    pub weight_seed: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            mode: DecodeMode::default(),
            model: ModelConfig::tiny(),
            generation: GenerationConfig::default(),
            weights: None,
            weight_seed: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let blob = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&blob)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{ "backend": "graph", "generation": { "max_new_tokens": 4 } }"#,
        )
        .expect("parse");
        assert_eq!(config.backend, BackendKind::Graph);
        assert_eq!(config.mode, DecodeMode::Cached);
        assert_eq!(config.generation.max_new_tokens, 4);
        assert_eq!(config.generation.stop_token, Some(EOS_TOKEN));
        assert_eq!(config.model, ModelConfig::tiny());
    }

    #[test]
    fn zero_temperature_selects_greedy() {
        let generation = GenerationConfig::default();
        assert_eq!(generation.policy().name(), "greedy");

        let sampled = GenerationConfig {
            temperature: 0.8,
            top_k: Some(5),
            ..GenerationConfig::default()
        };
        assert_eq!(sampled.policy().name(), "temperature");
    }

    #[test]
    fn config_file_reloads() {
        let path = std::env::temp_dir().join(format!("kvforge-config-{}.json", std::process::id()));
        let config = RuntimeConfig {
            mode: DecodeMode::Naive,
            weight_seed: 7,
            ..RuntimeConfig::default()
        };
        config.save(&path).expect("save");
        let loaded = RuntimeConfig::load(&path).expect("load");
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, config);
    }
}
