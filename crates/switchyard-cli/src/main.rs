#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use switchyard_cli::{run_cli, Cli};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    run_cli(Cli::parse())
}
