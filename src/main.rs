//! tick-downloader binary

use anyhow::Context;
use clap::Parser;
use tick_downloader::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::init_tracing();

    let cli = Cli::parse();
    cli.run()
        .await
        .with_context(|| format!("{} failed", cli.command.name()))
}
