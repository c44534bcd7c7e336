//! Numeric kernels backing the kvforge reference scorer.

pub mod attention;
pub mod layernorm;
pub mod utils;

pub use attention::*;
pub use layernorm::*;
pub use utils::*;
