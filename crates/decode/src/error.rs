//! Error taxonomy for decoding sessions.

use crate::controller::SessionState;
use thiserror::Error;

/// Failures surfaced by the decoding core. None of them are retried
/// internally; after a failed executor call the cache cannot be trusted.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("prompt must contain at least one token")]
    EmptyPrompt,

    #[error("no uncached tokens to submit for this step")]
    EmptyStep,

    #[error("{tensor} shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("layer count mismatch: expected {expected}, found {found}")]
    LayerCountMismatch { expected: usize, found: usize },

    #[error("layer {index} out of range for {layer_count} cached layers")]
    LayerOutOfRange { index: usize, layer_count: usize },

    #[error("backend `{backend}` execution failed: {source:#}")]
    BackendExecution {
        backend: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("session cannot step from state {state:?}")]
    NotStepping { state: SessionState },
}

impl DecodeError {
    pub fn shape(tensor: impl Into<String>, expected: &[usize], found: &[usize]) -> Self {
        DecodeError::ShapeMismatch {
            tensor: tensor.into(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;
