//! `kvforge` executable.

use anyhow::Result;
use clap::Parser;
use kvforge_runtime::cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
