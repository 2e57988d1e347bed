//! PlanIndex CLI: build hierarchical context trees from annotated plan sets.
//!
//! Imports projects, runs the three enrichment passes with live progress,
//! and serves the HTTP/SSE control surface.

mod commands;
mod import;
mod server;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
