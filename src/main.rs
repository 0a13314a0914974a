mod cli;
mod commands;

use anyhow::Context;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = cli::Args::parse();

    match args.cmd {
        cli::Command::Ingest(cmd) => commands::ingest(cmd).await.context("ingest failed"),
        cli::Command::Status(cmd) => commands::status(cmd).context("status failed"),
        cli::Command::Reset(cmd) => commands::reset(cmd).context("reset failed"),
        cli::Command::LoadProviders(cmd) => commands::load_providers(cmd)
            .await
            .context("load-providers failed"),
    }
}
