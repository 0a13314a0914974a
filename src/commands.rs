use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};
use indicatif::MultiProgress;
use tic_rates::common::{format_count, stop_on_ctrl_c};
use tic_rates::config::Config;
use tic_rates::fetch::Fetcher;
use tic_rates::error::IngestError;
use tic_rates::pipeline::{PayerJob, Pipeline, PipelineOptions, list_and_reset};
use tic_rates::providers::{ProviderFilter, load_providers as import_providers};
use tic_rates::report::{Palette, render_run_summary, render_status};
use tic_rates::store::RateStore;

use crate::cli::{ConfigArgs, IngestArgs, LoadProvidersArgs, ResetArgs, StatusArgs};

fn load_config(args: &ConfigArgs) -> Result<Config> {
    Config::load(&args.config)
        .with_context(|| format!("Failed loading config {}", args.config.display()))
}

/// `--db` wins; otherwise the config file names the database.
fn database_path(args: &ConfigArgs) -> Result<PathBuf> {
    match &args.db {
        Some(path) => Ok(path.clone()),
        None => Ok(load_config(args)?.database.path),
    }
}

fn open_store(path: &Path) -> Result<RateStore> {
    RateStore::open(path).with_context(|| format!("Failed opening rate store {}", path.display()))
}

pub async fn ingest(args: IngestArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let payers = config.select_payers(&args.payers)?;
    if payers.is_empty() {
        bail!("No enabled payers in {}", args.config.config.display());
    }

    let db_path = args
        .config
        .db
        .clone()
        .unwrap_or_else(|| config.database.path.clone());
    let store = Arc::new(open_store(&db_path)?);

    let shutdown = Arc::new(AtomicBool::new(false));
    stop_on_ctrl_c(Arc::clone(&shutdown));

    let fetcher = Arc::new(
        Fetcher::new(args.max_retries.unwrap_or(config.ingest.max_retries))
            .context("Failed building HTTP client")?
            .with_progress(Arc::new(MultiProgress::new())),
    );
    let filter = Arc::new(config.code_filter());
    let options = PipelineOptions {
        workers: args.workers.unwrap_or(config.ingest.workers).max(1),
        batch_size: config.ingest.batch_size,
        restrict_to_known_providers: config.ingest.restrict_to_known_providers,
        follow_remote_references: config.ingest.follow_remote_references,
    };
    tracing::info!(
        "Ingesting {} payers into {} ({} billing codes, {} workers)",
        payers.len(),
        db_path.display(),
        filter.len(),
        options.workers
    );

    let mut jobs = Vec::new();
    let mut listing_failures = Vec::new();
    for payer in payers {
        let listed =
            list_and_reset(&store, &fetcher, &payer.source(args.max_files), args.force).await;
        let documents = match listed {
            Ok((documents, cleared)) => {
                if let Some(cleared) = cleared {
                    tracing::info!(
                        "[{}] --force cleared {} rate rows and {} ledger entries",
                        payer.name,
                        format_count(cleared.rates),
                        format_count(cleared.ledger)
                    );
                }
                documents
            }
            Err(IngestError::Storage(err)) => {
                return Err(err).with_context(|| format!("Failed resetting payer '{}'", payer.name));
            }
            Err(err) => {
                tracing::error!("[{}] failed listing documents: {err}", payer.name);
                listing_failures.push(payer.name.clone());
                continue;
            }
        };
        if documents.is_empty() {
            tracing::warn!("[{}] no in-network documents to ingest", payer.name);
            continue;
        }
        jobs.push(PayerJob {
            payer_name: payer.name.clone(),
            documents,
            reference_files: payer.reference_files.clone(),
        });
    }

    let pipeline = Pipeline::new(Arc::clone(&store), fetcher, filter, options)
        .with_shutdown(Arc::clone(&shutdown));
    let summary = pipeline.run(jobs).await.context("Ingest run aborted")?;
    println!();
    print!("{}", render_run_summary(&summary, &Palette::detect()));

    if summary.failed() > 0 {
        tracing::warn!(
            "{} documents failed; rerun to retry them",
            summary.failed()
        );
    }
    if !listing_failures.is_empty() {
        bail!(
            "Could not list documents for: {}",
            listing_failures.join(", ")
        );
    }
    Ok(())
}

pub fn status(args: StatusArgs) -> Result<()> {
    let db_path = database_path(&args.config)?;
    let store = open_store(&db_path)?;
    let stats = store.stats().context("Failed reading store stats")?;
    let payers = store
        .payer_breakdown()
        .context("Failed reading payer breakdown")?;
    let ledger = store
        .ledger_entries(None)
        .context("Failed reading ingestion ledger")?;

    println!();
    println!("Database: {}", db_path.display());
    print!("{}", render_status(&stats, &payers, &ledger, &Palette::detect()));
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush().context("Failed writing prompt")?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed reading confirmation")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "YES"))
}

pub fn reset(args: ResetArgs) -> Result<()> {
    let payer = args.payer.trim();
    if payer.is_empty() {
        bail!("--payer must not be empty");
    }
    let db_path = database_path(&args.config)?;
    if !args.yes
        && !confirm(&format!(
            "Delete every rate row and ledger entry of '{payer}' in {}?",
            db_path.display()
        ))?
    {
        println!("Aborted.");
        return Ok(());
    }

    let store = open_store(&db_path)?;
    let counts = store
        .reset_payer(payer)
        .with_context(|| format!("Failed resetting payer '{payer}'"))?;
    println!(
        "Removed {} rate rows and {} ledger entries for '{payer}'.",
        format_count(counts.rates),
        format_count(counts.ledger)
    );
    Ok(())
}

pub async fn load_providers(args: LoadProvidersArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let db_path = args
        .config
        .db
        .clone()
        .unwrap_or_else(|| config.database.path.clone());
    let filter = ProviderFilter::new(&config.geography, &config.providers);

    let shutdown = Arc::new(AtomicBool::new(false));
    stop_on_ctrl_c(Arc::clone(&shutdown));

    let csv = args.csv.clone();
    let replace = args.replace;
    let outcome = tokio::task::spawn_blocking(move || {
        let store = open_store(&db_path)?;
        import_providers(&store, &csv, &filter, replace, Some(shutdown.as_ref()))
    })
    .await
    .context("Provider import task failed")??;

    println!(
        "Loaded {} providers ({} rows scanned){}.",
        format_count(outcome.loaded),
        format_count(outcome.scanned),
        if outcome.interrupted {
            ", stopped early"
        } else {
            ""
        }
    );
    Ok(())
}
