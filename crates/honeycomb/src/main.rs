//! Honeycomb CLI: load honeypot session logs into SQLite.

use std::process::ExitCode;

use clap::Parser;

use honeycomb::cli::Cli;
use honeycomb::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    cli.run().await
}
