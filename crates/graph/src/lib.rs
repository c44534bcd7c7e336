//! Graph-exchange adapter.
//!
//! Exported decoder graphs (ONNX and friends) take and return tensors by
//! name: `input_ids`, `position_ids`, `attention_mask`,
//! `past_key_values.{i}.key|value` in and `logits`,
//! `present.{i}.key|value` out. [`GraphExecutor`] maps the decoding core's
//! step request onto that layout and back for any [`GraphBackend`].

pub mod error;
pub mod executor;
pub mod naming;
pub mod signature;
pub mod tensor;

pub use error::GraphError;
pub use executor::{GraphBackend, GraphCapabilities, GraphExecutor};
pub use naming::{CachePattern, TensorNames};
pub use signature::{Dim, ElementType, GraphSignature, TensorSpec};
pub use tensor::{NamedTensors, TensorData};
