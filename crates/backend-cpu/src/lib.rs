//! Reference transformer scorer for the kvforge decoding core.

pub mod config;
pub mod graph;
pub mod model;
pub mod rope;
pub mod weights;

pub use config::ModelConfig;
pub use graph::ReferenceGraph;
pub use model::ReferenceModel;
pub use rope::RoPECache;
pub use weights::{DecoderWeights, ModelWeights};
