//! kvforge: incremental decoding with a key/value cache.
//!
//! The facade re-exports the workspace crates so integration tests and
//! downstream users can depend on a single package.

pub use kvforge_backend_cpu as backend_cpu;
pub use kvforge_decode as decode;
pub use kvforge_graph as graph;
pub use kvforge_runtime as runtime;
