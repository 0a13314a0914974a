use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tic_rates::config::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(name = "tic")]
#[command(about = "Ingest Transparency in Coverage negotiated rates into DuckDB", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List each payer's documents and ingest the ones not yet complete.
    Ingest(IngestArgs),
    /// Show rate store totals, per-payer breakdown and ledger state.
    Status(StatusArgs),
    /// Remove every rate row and ledger entry of one payer.
    Reset(ResetArgs),
    /// Import an NPPES CSV into the provider lookup table.
    LoadProviders(LoadProvidersArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ConfigArgs {
    /// TOML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// DuckDB database path. Overrides `[database] path`.
    #[arg(long)]
    pub db: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct IngestArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Only ingest these payers (repeatable). Defaults to every enabled payer.
    #[arg(long = "payer")]
    pub payers: Vec<String>,

    /// Concurrent documents per payer. Overrides `[ingest] workers`.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Ingest at most this many documents per payer.
    #[arg(long)]
    pub max_files: Option<usize>,

    /// Clear the selected payers' rates and ledger before ingesting.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Attempts per HTTP request. Overrides `[ingest] max_retries`.
    #[arg(long)]
    pub max_retries: Option<usize>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ResetArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(long)]
    pub payer: String,

    /// Skip the confirmation prompt.
    #[arg(long, default_value_t = false)]
    pub yes: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct LoadProvidersArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// NPPES data dissemination CSV.
    #[arg(long)]
    pub csv: PathBuf,

    /// Clear the provider table before importing.
    #[arg(long, default_value_t = false)]
    pub replace: bool,
}
