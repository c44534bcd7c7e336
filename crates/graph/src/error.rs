use thiserror::Error;

/// Capability-check failures raised when a graph is wrapped.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("graph has no input named `{0}`")]
    MissingInput(String),

    #[error("graph has no output named `{0}`")]
    MissingOutput(String),

    #[error("`{name}` is not usable: {reason}")]
    UnexpectedSpec { name: String, reason: String },

    #[error("graph declares no key/value cache inputs")]
    NoCacheLayers,

    #[error("cache layer {missing} is missing; layer indices must be contiguous from 0")]
    LayerGap { missing: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_layer_gap() {
        let e = GraphError::LayerGap { missing: 1 };
        assert_eq!(
            e.to_string(),
            "cache layer 1 is missing; layer indices must be contiguous from 0"
        );
    }
}
