//! Per-payer ingestion driver.
//!
//! Each document goes through claim → fetch → decode → resolve/normalize →
//! batched insert → complete. Workers share nothing but the store, and the
//! ledger claim is the only coordination between them.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{StreamExt, stream};

use crate::common::new_run_id;
use crate::decode::{DecodeSummary, decode_document};
use crate::error::{DecodeError, IngestError, ResolutionError, StorageError};
use crate::fetch::{Fetcher, Location, for_each_document};
use crate::filter::CodeFilter;
use crate::model::ReferenceId;
use crate::normalize::{RowDeduplicator, RowStamp, normalize};
use crate::resolve::{DocumentCollector, ReferenceFileCollector, ReferenceTable, Resolver};
use crate::source::{DocumentDescriptor, IndexSource};
use crate::store::{ClaimOutcome, RateStore, ResetCounts};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    pub batch_size: usize,
    pub restrict_to_known_providers: bool,
    pub follow_remote_references: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_size: 5000,
            restrict_to_known_providers: false,
            follow_remote_references: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PayerJob {
    pub payer_name: String,
    pub documents: Vec<DocumentDescriptor>,
    pub reference_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOutcome {
    Complete { rows: u64 },
    SkippedComplete,
    /// Claimed by another worker of the same run.
    SkippedHeld,
    Failed {
        kind: &'static str,
        retryable: bool,
        reason: String,
    },
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct DocumentReport {
    pub payer_name: String,
    pub url: String,
    pub outcome: DocumentOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id: String,
    pub reports: Vec<DocumentReport>,
}

impl RunSummary {
    fn count(&self, pred: impl Fn(&DocumentOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, DocumentOutcome::Complete { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, DocumentOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                DocumentOutcome::SkippedComplete | DocumentOutcome::SkippedHeld
            )
        })
    }

    pub fn interrupted(&self) -> usize {
        self.count(|o| matches!(o, DocumentOutcome::Interrupted))
    }

    pub fn rows_inserted(&self) -> u64 {
        self.reports
            .iter()
            .map(|r| match r.outcome {
                DocumentOutcome::Complete { rows } => rows,
                _ => 0,
            })
            .sum()
    }
}

/// One decoded JSON document (a whole file or one archive member).
struct DecodedDocument {
    source: String,
    summary: DecodeSummary,
    collector: DocumentCollector,
}

#[derive(Default)]
struct WriteTally {
    rows: u64,
    dropped_entries: u64,
    duplicates: u64,
}

/// Lists a payer's documents and, with `force`, then clears its rates and
/// ledger. A payer that cannot be listed is left untouched.
pub async fn list_and_reset(
    store: &Arc<RateStore>,
    fetcher: &Fetcher,
    source: &IndexSource,
    force: bool,
) -> Result<(Vec<DocumentDescriptor>, Option<ResetCounts>), IngestError> {
    let documents = source.list_documents(fetcher).await?;
    if !force {
        return Ok((documents, None));
    }
    let store = Arc::clone(store);
    let payer = source.payer_name.clone();
    let cleared = tokio::task::spawn_blocking(move || store.reset_payer(&payer))
        .await
        .map_err(|err| IngestError::Worker(err.to_string()))??;
    Ok((documents, Some(cleared)))
}

/// Registers the run as active on the store until dropped, so pipelines
/// sharing one store never reclaim each other's live documents.
struct ActiveRun<'a> {
    store: &'a RateStore,
    run_id: &'a str,
}

impl<'a> ActiveRun<'a> {
    fn enter(store: &'a RateStore, run_id: &'a str) -> Result<Self, IngestError> {
        store.enter_run(run_id)?;
        Ok(Self { store, run_id })
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.leave_run(self.run_id) {
            tracing::warn!("failed releasing run {}: {err}", self.run_id);
        }
    }
}

pub struct Pipeline {
    store: Arc<RateStore>,
    fetcher: Arc<Fetcher>,
    filter: Arc<CodeFilter>,
    options: PipelineOptions,
    run_id: String,
    shutdown: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        store: Arc<RateStore>,
        fetcher: Arc<Fetcher>,
        filter: Arc<CodeFilter>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            fetcher,
            filter,
            options,
            run_id: new_run_id(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn stop_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Runs every job in order. A storage failure that prevents recording a
    /// document's outcome ends the run with an error.
    pub async fn run(&self, jobs: Vec<PayerJob>) -> Result<RunSummary, IngestError> {
        let mut summary = RunSummary {
            run_id: self.run_id.clone(),
            reports: Vec::new(),
        };
        for job in jobs {
            if self.stop_requested() {
                break;
            }
            summary.reports.extend(self.run_payer(job).await?);
        }
        Ok(summary)
    }

    pub async fn run_payer(&self, job: PayerJob) -> Result<Vec<DocumentReport>, IngestError> {
        let _active = ActiveRun::enter(&self.store, &self.run_id)?;
        let payer = job.payer_name.clone();
        let urls: Vec<String> = job.documents.iter().map(|d| d.url.clone()).collect();
        tracing::info!(
            "[{payer}] {} documents, run {} with {} workers",
            urls.len(),
            self.run_id,
            self.options.workers.max(1)
        );

        {
            let payer = payer.clone();
            let urls = urls.clone();
            self.with_store(move |store| store.register_pending(&payer, &urls))
                .await?;
        }

        let known_npis = if self.options.restrict_to_known_providers {
            let npis = self.with_store(|store| store.known_npis()).await?;
            if npis.is_empty() {
                tracing::warn!(
                    "[{payer}] provider table is empty; known-provider restriction disabled"
                );
                None
            } else {
                Some(Arc::new(npis))
            }
        } else {
            None
        };

        let external = match self.load_reference_files(&job.reference_files).await {
            Ok(table) => Arc::new(table),
            Err(err) => {
                tracing::error!("[{payer}] failed loading reference files: {err}");
                let reason = format!("reference files unavailable: {err}");
                return Ok(urls
                    .into_iter()
                    .map(|url| DocumentReport {
                        payer_name: payer.clone(),
                        url,
                        outcome: DocumentOutcome::Failed {
                            kind: err.kind(),
                            retryable: err.is_retryable(),
                            reason: reason.clone(),
                        },
                        elapsed: Duration::ZERO,
                    })
                    .collect());
            }
        };

        let results: Vec<Result<DocumentReport, IngestError>> = stream::iter(urls)
            .map(|url| {
                self.process_document(
                    payer.clone(),
                    url,
                    Arc::clone(&external),
                    known_npis.clone(),
                )
            })
            .buffer_unordered(self.options.workers.max(1))
            .collect()
            .await;

        results.into_iter().collect()
    }

    async fn process_document(
        &self,
        payer: String,
        url: String,
        external: Arc<ReferenceTable>,
        known_npis: Option<Arc<HashSet<String>>>,
    ) -> Result<DocumentReport, IngestError> {
        let started = Instant::now();
        let report = |outcome| DocumentReport {
            payer_name: payer.clone(),
            url: url.clone(),
            outcome,
            elapsed: started.elapsed(),
        };

        if self.stop_requested() {
            return Ok(report(DocumentOutcome::Interrupted));
        }

        let claim = {
            let (payer, url, run_id) = (payer.clone(), url.clone(), self.run_id.clone());
            self.with_store(move |store| store.begin(&payer, &url, &run_id))
                .await
        };
        let result = match claim {
            Ok(ClaimOutcome::AlreadyComplete) => {
                tracing::info!("[{payer}] already complete, skipping {url}");
                return Ok(report(DocumentOutcome::SkippedComplete));
            }
            Ok(ClaimOutcome::HeldByRun) => {
                tracing::debug!("[{payer}] {url} is held by another worker of this run");
                return Ok(report(DocumentOutcome::SkippedHeld));
            }
            Ok(ClaimOutcome::Claimed {
                previous,
                cleared_rows,
            }) => {
                if cleared_rows > 0 {
                    tracing::info!(
                        "[{payer}] cleared {cleared_rows} rows left by a previous attempt ({}) of {url}",
                        previous.map(|s| s.as_str()).unwrap_or("new")
                    );
                }
                self.ingest_claimed(&payer, &url, external, known_npis)
                    .await
            }
            Err(err) => Err(err),
        };

        let result = match result {
            Ok(tally) => {
                let (p, u, rows) = (payer.clone(), url.clone(), tally.rows);
                self.with_store(move |store| store.complete(&p, &u, rows))
                    .await
                    .map(|()| tally)
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(tally) => {
                tracing::info!(
                    "[{payer}] complete: {} rows from {url} ({} entries without providers, {} duplicate rows)",
                    tally.rows,
                    tally.dropped_entries,
                    tally.duplicates
                );
                Ok(report(DocumentOutcome::Complete { rows: tally.rows }))
            }
            Err(IngestError::Interrupted) => {
                tracing::warn!("[{payer}] interrupted, {url} stays in progress");
                Ok(report(DocumentOutcome::Interrupted))
            }
            Err(err) => {
                let reason = format!("{}: {err}", err.kind());
                tracing::error!("[{payer}] failed {url}: {reason}");
                let (p, u, r) = (payer.clone(), url.clone(), reason.clone());
                self.with_store(move |store| store.fail(&p, &u, &r))
                    .await?;
                Ok(report(DocumentOutcome::Failed {
                    kind: err.kind(),
                    retryable: err.is_retryable(),
                    reason,
                }))
            }
        }
    }

    async fn ingest_claimed(
        &self,
        payer: &str,
        url: &str,
        external: Arc<ReferenceTable>,
        known_npis: Option<Arc<HashSet<String>>>,
    ) -> Result<WriteTally, IngestError> {
        let stream = self.fetcher.open(url).await?;
        let decoded = {
            let filter = Arc::clone(&self.filter);
            let shutdown = Arc::clone(&self.shutdown);
            let source = stream.source().to_string();
            tokio::task::spawn_blocking(move || {
                let mut decoded = Vec::new();
                for_each_document(stream, &source, |member, reader| {
                    let mut collector =
                        DocumentCollector::new(Arc::clone(&filter)).with_shutdown(Arc::clone(&shutdown));
                    let summary = decode_document(reader, &mut collector)?;
                    tracing::debug!(
                        "{member}: {} in_network items, {} accepted, {} reference groups",
                        summary.in_network_items,
                        summary.accepted_items,
                        summary.reference_definitions
                    );
                    decoded.push(DecodedDocument {
                        source: member.to_string(),
                        summary,
                        collector,
                    });
                    Ok(())
                })?;
                Ok::<_, DecodeError>(decoded)
            })
            .await
            .map_err(|err| IngestError::Worker(err.to_string()))??
        };

        let external = self.with_remote_references(url, &decoded, external).await?;

        let store = Arc::clone(&self.store);
        let shutdown = Arc::clone(&self.shutdown);
        let payer = payer.to_string();
        let batch_size = self.options.batch_size.max(1);
        tokio::task::spawn_blocking(move || {
            write_documents(
                &store,
                &payer,
                decoded,
                &external,
                known_npis.as_deref(),
                batch_size,
                &shutdown,
            )
        })
        .await
        .map_err(|err| IngestError::Worker(err.to_string()))?
    }

    /// Fetches remote reference files cited by accepted entries and layers
    /// them over the payer's external table.
    ///
    /// A document served over http(s) cannot point the fetcher at local paths;
    /// such citations are refused and stay unresolved.
    async fn with_remote_references(
        &self,
        url: &str,
        decoded: &[DecodedDocument],
        external: Arc<ReferenceTable>,
    ) -> Result<Arc<ReferenceTable>, IngestError> {
        let citing = Location::parse(url)?;
        let mut wanted: Vec<(ReferenceId, String)> = Vec::new();
        let mut seen = HashSet::new();
        for doc in decoded {
            for (id, location) in doc.collector.cited_remote() {
                if external.contains(&id) || !seen.insert(id.clone()) {
                    continue;
                }
                match Location::parse(&location) {
                    Ok(cited) if citing.may_follow(&cited) => wanted.push((id, location)),
                    _ => tracing::warn!(
                        "{url}: refusing provider reference {} at {location}",
                        id.as_str()
                    ),
                }
            }
        }
        if wanted.is_empty() {
            return Ok(external);
        }
        if !self.options.follow_remote_references {
            tracing::warn!(
                "{} remote provider references not followed; their entries will be dropped",
                wanted.len()
            );
            return Ok(external);
        }

        tracing::info!("fetching {} remote provider reference files", wanted.len());
        let mut table = (*external).clone();
        for (id, location) in wanted {
            if self.stop_requested() {
                return Err(IngestError::Interrupted);
            }
            table.extend(self.fetch_references(&location, Some(id)).await?);
        }
        Ok(Arc::new(table))
    }

    async fn load_reference_files(&self, files: &[String]) -> Result<ReferenceTable, IngestError> {
        let mut table = ReferenceTable::default();
        for location in files.iter().map(|f| f.trim()).filter(|f| !f.is_empty()) {
            let loaded = self.fetch_references(location, None).await?;
            tracing::info!("loaded {} provider groups from {location}", loaded.len());
            table.extend(loaded);
        }
        Ok(table)
    }

    async fn fetch_references(
        &self,
        location: &str,
        group: Option<ReferenceId>,
    ) -> Result<ReferenceTable, IngestError> {
        let stream = self.fetcher.open(location).await?;
        let source = stream.source().to_string();
        tokio::task::spawn_blocking(move || {
            let mut table = ReferenceTable::default();
            for_each_document(stream, &source, |_, reader| {
                let mut collector = match &group {
                    Some(id) => ReferenceFileCollector::for_group(id.clone()),
                    None => ReferenceFileCollector::new(),
                };
                decode_document(reader, &mut collector)?;
                table.extend(collector.table);
                Ok(())
            })?;
            Ok::<_, DecodeError>(table)
        })
        .await
        .map_err(|err| IngestError::Worker(err.to_string()))?
        .map_err(IngestError::from)
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T, IngestError>
    where
        T: Send + 'static,
        F: FnOnce(&RateStore) -> Result<T, StorageError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| IngestError::Worker(err.to_string()))?;
        Ok(result?)
    }
}

fn write_documents(
    store: &RateStore,
    payer: &str,
    decoded: Vec<DecodedDocument>,
    external: &ReferenceTable,
    known_npis: Option<&HashSet<String>>,
    batch_size: usize,
    shutdown: &AtomicBool,
) -> Result<WriteTally, IngestError> {
    let ingested_at = Utc::now();
    let mut tally = WriteTally::default();

    for doc in decoded {
        let stamp = RowStamp {
            payer_name: payer.to_string(),
            file_source: doc.source,
            last_updated: doc.summary.header.last_updated_on,
            ingested_at,
        };
        let mut resolver = Resolver::new(&doc.collector.references).with_external(external);
        if let Some(known) = known_npis {
            resolver = resolver.restricted_to(known);
        }

        let mut dedup = RowDeduplicator::default();
        let mut batch = Vec::with_capacity(batch_size);
        let mut unknown: BTreeSet<ReferenceId> = BTreeSet::new();
        let mut empty_groups = 0u64;

        for entry in &doc.collector.entries {
            if shutdown.load(Ordering::SeqCst) {
                return Err(IngestError::Interrupted);
            }
            let resolution = resolver.resolve(entry);
            for issue in resolution.issues {
                match issue {
                    ResolutionError::UnknownReference(id) => {
                        unknown.insert(id);
                    }
                    ResolutionError::EmptyGroup(_) => empty_groups += 1,
                }
            }
            if resolution.providers.is_empty() {
                tally.dropped_entries += 1;
                continue;
            }
            for row in normalize(entry, &resolution.providers, &stamp) {
                if !dedup.admit(&row) {
                    continue;
                }
                batch.push(row);
                if batch.len() >= batch_size {
                    tally.rows += store.insert_rows(&batch)?;
                    batch.clear();
                }
            }
        }
        tally.rows += store.insert_rows(&batch)?;
        tally.duplicates += dedup.duplicates();

        if !unknown.is_empty() {
            let sample: Vec<&str> = unknown.iter().take(5).map(ReferenceId::as_str).collect();
            tracing::warn!(
                "{}: {} undefined provider reference ids (e.g. {})",
                stamp.file_source,
                unknown.len(),
                sample.join(", ")
            );
        }
        if empty_groups > 0 {
            tracing::warn!(
                "{}: {empty_groups} citations of provider groups without providers",
                stamp.file_source
            );
        }
    }
    Ok(tally)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: DocumentOutcome) -> DocumentReport {
        DocumentReport {
            payer_name: "Example Health".to_string(),
            url: "https://example.com/a.json".to_string(),
            outcome,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn summary_totals() {
        let summary = RunSummary {
            run_id: "run-1".to_string(),
            reports: vec![
                report(DocumentOutcome::Complete { rows: 10 }),
                report(DocumentOutcome::Complete { rows: 5 }),
                report(DocumentOutcome::SkippedComplete),
                report(DocumentOutcome::SkippedHeld),
                report(DocumentOutcome::Interrupted),
                report(DocumentOutcome::Failed {
                    kind: "decode",
                    retryable: false,
                    reason: "decode: malformed".to_string(),
                }),
            ],
        };
        assert_eq!(summary.completed(), 2);
        assert_eq!(summary.rows_inserted(), 15);
        assert_eq!(summary.skipped(), 2);
        assert_eq!(summary.interrupted(), 1);
        assert_eq!(summary.failed(), 1);
    }
}
