//! CLI wiring for the kvforge runtime.

use crate::config::{BackendKind, DecodeMode, RuntimeConfig};
use crate::eval::{compare, ComparisonReport};
use crate::session::{check_signature, Generation, InferenceSession};
use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use kvforge_backend_cpu::ReferenceGraph;
use kvforge_graph::TensorNames;
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kvforge", about = "Incremental decoding with a key/value cache")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum BackendArg {
    Reference,
    Graph,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> BackendKind {
        match value {
            BackendArg::Reference => BackendKind::Reference,
            BackendArg::Graph => BackendKind::Graph,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum ModeArg {
    Cached,
    Naive,
}

impl From<ModeArg> for DecodeMode {
    fn from(value: ModeArg) -> DecodeMode {
        match value {
            ModeArg::Cached => DecodeMode::Cached,
            ModeArg::Naive => DecodeMode::Naive,
        }
    }
}

/// Options shared by every subcommand. Flags override the config file.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    #[arg(long)]
    pub prompt: String,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,
    #[arg(long)]
    pub weights: Option<PathBuf>,
    #[arg(long)]
    pub max_new_tokens: Option<usize>,
    #[arg(long)]
    pub stop_token: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a continuation of the prompt.
    Generate {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Decode with and without the cache and emit a JSON comparison report.
    Compare {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        baseline: Option<PathBuf>,
    },
    /// Write the graph signature of the configured model, or check an
    /// existing signature file.
    Signature {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, conflicts_with_all = ["config", "output"])]
        check: Option<PathBuf>,
    },
}

impl ModelArgs {
    fn runtime_config(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(backend) = self.backend {
            config.backend = backend.into();
        }
        if let Some(path) = &self.weights {
            config.weights = Some(path.clone());
        }
        if let Some(max_new_tokens) = self.max_new_tokens {
            config.generation.max_new_tokens = max_new_tokens;
        }
        if let Some(stop_token) = self.stop_token {
            config.generation.stop_token = Some(stop_token);
        }
        Ok(config)
    }
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    match cli.command {
        Command::Generate {
            model,
            mode,
            temperature,
            top_k,
            seed,
        } => {
            let mut config = model.runtime_config()?;
            if let Some(mode) = mode {
                config.mode = mode.into();
            }
            if let Some(temperature) = temperature {
                config.generation.temperature = temperature;
            }
            if top_k.is_some() {
                config.generation.top_k = top_k;
            }
            if seed.is_some() {
                config.generation.seed = seed;
            }

            let session = InferenceSession::new(config)?;
            let generation = session.generate(&model.prompt)?;
            print_generation(&model.prompt, &generation);
        }
        Command::Compare {
            model,
            output,
            baseline,
        } => {
            let session = InferenceSession::new(model.runtime_config()?)?;
            let ids = session.tokenizer().encode(&model.prompt);
            let report = compare(&session, &ids)?;

            println!(
                "backend={}, prompt_tokens={}, tokens_match={}, speedup={:.2}x, max_abs_logit_deviation={:.3e}",
                report.backend,
                report.prompt_tokens,
                report.tokens_match,
                report.speedup,
                report.max_abs_logit_deviation
            );
            for mode in &report.modes {
                println!(
                    "- {}: latency_ms={:.3} tokens={} tokens_per_sec={:.2} executor_calls={}",
                    mode.mode,
                    mode.latency_ms,
                    mode.tokens_generated,
                    mode.tokens_per_sec,
                    mode.executor_calls
                );
            }

            if let Some(path) = baseline {
                if path.exists() {
                    let baseline_blob = fs::read_to_string(&path)?;
                    let baseline_report: ComparisonReport = serde_json::from_str(&baseline_blob)?;
                    for (name, delta) in report.diff(&baseline_report) {
                        println!(
                            "Δ {}: latency_ms={:+.3} tokens_per_sec={:+.2}",
                            name, delta.latency_ms_delta, delta.tokens_per_sec_delta
                        );
                    }
                } else {
                    info!(path = %path.display(), "baseline report not found; skipping diff");
                }
            }

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&report)?;
                fs::write(path, json)?;
            }

            if !report.tokens_match {
                bail!("cached and naive decoding produced different tokens");
            }
        }
        Command::Signature {
            config,
            output,
            check,
        } => {
            if let Some(path) = check {
                let caps = check_signature(&path)?;
                println!(
                    "{}: layers={} heads={} head_dim={} vocab_size={} position_ids={} attention_mask={}",
                    path.display(),
                    caps.topology.layer_count,
                    caps.topology.heads,
                    caps.topology.head_dim,
                    caps.topology.vocab_size,
                    caps.feeds_positions,
                    caps.feeds_mask
                );
                return Ok(());
            }

            let runtime = match config {
                Some(path) => RuntimeConfig::load(path)?,
                None => RuntimeConfig::default(),
            };
            let signature = ReferenceGraph::signature_for(&runtime.model, &TensorNames::default());
            match output {
                Some(path) => {
                    signature.save_json(&path)?;
                    info!(path = %path.display(), "graph signature written");
                }
                None => println!("{}", serde_json::to_string_pretty(&signature)?),
            }
        }
    }
    Ok(())
}

fn print_generation(prompt: &str, generation: &Generation) {
    println!("\n=== Generation ({}) ===", generation.mode.as_str());
    println!("Prompt: {}", prompt);
    println!("Output: {}", generation.text);
    println!("Stop reason: {:?}", generation.stop_reason);
    println!("Tokens generated: {}", generation.generated().len());
    println!("Total time: {:.2} ms", generation.elapsed_ms);

    if let Some(metrics) = &generation.metrics {
        println!("\n=== Metrics ===");
        println!("Prefill time: {:.2} ms", metrics.prefill_ms);
        println!("Decode time: {:.2} ms", metrics.decode_ms);
        println!("Tokens/sec: {:.2}", metrics.tokens_per_sec);
        println!("KV-cache: {} bytes/token", metrics.kv_cache_bytes_per_token);
        println!("Executor calls: {}", metrics.executor_calls);
    }
}
