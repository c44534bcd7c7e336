//! kvforge runtime facade: configuration, sessions, comparison reports.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod eval;
pub mod session;

#[cfg(feature = "cli")]
pub use cli::*;
pub use config::*;
pub use eval::*;
pub use session::*;
