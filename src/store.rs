//! DuckDB-backed rate store and ingestion ledger.
//!
//! One connection is shared behind a mutex, so every ledger transition runs
//! as a single transaction with no other writer interleaved. A successful
//! claim also deletes the rows a previous attempt left behind for the same
//! document, which makes retries idempotent without a unique key on `rates`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use duckdb::{Connection, OptionalExt, params};

use crate::common::truncate_for_log;
use crate::error::{StorageContext, StorageError};
use crate::model::{NormalizedRateRow, ProviderRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rates (
  payer_name VARCHAR NOT NULL,
  last_updated DATE,
  billing_code VARCHAR NOT NULL,
  billing_code_type VARCHAR,
  negotiated_rate DECIMAL(12, 2),
  negotiated_type VARCHAR,
  billing_class VARCHAR,
  place_of_service VARCHAR,
  npi VARCHAR NOT NULL,
  tin VARCHAR,
  file_source VARCHAR NOT NULL,
  ingested_at TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_rates_billing_code ON rates (billing_code);
CREATE INDEX IF NOT EXISTS idx_rates_npi ON rates (npi);
CREATE INDEX IF NOT EXISTS idx_rates_payer ON rates (payer_name);

CREATE TABLE IF NOT EXISTS providers (
  npi VARCHAR PRIMARY KEY,
  provider_name VARCHAR,
  provider_type INTEGER,
  city VARCHAR,
  state VARCHAR,
  zip VARCHAR,
  taxonomy_code VARCHAR
);

CREATE TABLE IF NOT EXISTS ingestion_log (
  payer_name VARCHAR NOT NULL,
  file_url VARCHAR NOT NULL,
  status VARCHAR NOT NULL,
  records_inserted BIGINT DEFAULT 0,
  started_at TIMESTAMP,
  completed_at TIMESTAMP,
  error_message VARCHAR,
  run_id VARCHAR,
  UNIQUE (payer_name, file_url)
);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the atomic check-and-set performed by [`RateStore::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed {
        previous: Option<LedgerStatus>,
        cleared_rows: u64,
    },
    AlreadyComplete,
    /// In progress under a run that is still active on this store: another
    /// worker of the caller's run, or another pipeline sharing the store.
    HeldByRun,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub payer_name: String,
    pub file_url: String,
    pub status: LedgerStatus,
    pub records_inserted: u64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub total_rates: u64,
    pub payers: u64,
    pub billing_codes: u64,
    pub npis: u64,
    pub providers: u64,
    pub ledger_pending: u64,
    pub ledger_in_progress: u64,
    pub ledger_complete: u64,
    pub ledger_failed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayerBreakdown {
    pub payer_name: String,
    pub rows: u64,
    pub billing_codes: u64,
    pub npis: u64,
    pub min_rate: Option<f64>,
    pub max_rate: Option<f64>,
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetCounts {
    pub rates: u64,
    pub ledger: u64,
}

/// A stored rate row as read back for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRate {
    pub billing_code: String,
    pub billing_code_type: Option<String>,
    pub negotiated_rate: f64,
    pub negotiated_type: Option<String>,
    pub billing_class: Option<String>,
    pub place_of_service: Option<String>,
    pub npi: String,
    pub tin: Option<String>,
    pub last_updated: Option<String>,
    pub file_source: String,
}

pub struct RateStore {
    conn: Mutex<Connection>,
    /// Run ids currently driving documents through this handle, with the
    /// number of pipelines entered under each.
    active_runs: Mutex<HashMap<String, usize>>,
}

impl RateStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Directory {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)
            .storage(&format!("open duckdb at {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().storage("open in-memory duckdb")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA).storage("create schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            active_runs: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Marks `run_id` as live. Its `in_progress` claims are not reclaimed by
    /// other runs until a matching [`RateStore::leave_run`].
    pub fn enter_run(&self, run_id: &str) -> Result<(), StorageError> {
        let mut runs = self.active_runs.lock().map_err(|_| StorageError::Poisoned)?;
        *runs.entry(run_id.to_string()).or_default() += 1;
        Ok(())
    }

    pub fn leave_run(&self, run_id: &str) -> Result<(), StorageError> {
        let mut runs = self.active_runs.lock().map_err(|_| StorageError::Poisoned)?;
        if let Some(count) = runs.get_mut(run_id) {
            *count -= 1;
            if *count == 0 {
                runs.remove(run_id);
            }
        }
        Ok(())
    }

    fn run_is_active(&self, run_id: &str) -> Result<bool, StorageError> {
        let runs = self.active_runs.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(runs.contains_key(run_id))
    }

    /// Adds `pending` entries for documents the ledger has not seen yet.
    pub fn register_pending(&self, payer: &str, urls: &[String]) -> Result<u64, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().storage("begin register transaction")?;
        let mut added = 0u64;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO ingestion_log (payer_name, file_url, status, records_inserted) \
                     VALUES (?, ?, 'pending', 0)",
                )
                .storage("prepare register pending")?;
            for url in urls {
                added += stmt
                    .execute(params![payer, url])
                    .storage("insert pending ledger entry")? as u64;
            }
        }
        tx.commit().storage("commit register transaction")?;
        Ok(added)
    }

    /// Atomically claims `(payer, url)` for `run_id`.
    ///
    /// Complete entries are never claimed. `in_progress` entries of the
    /// caller's run or of any run active on this handle are held. `pending`,
    /// `failed` and stale `in_progress` entries (left by a run that is no
    /// longer active) are claimed, and the claim deletes every rate row
    /// previously stored for the document.
    pub fn begin(&self, payer: &str, url: &str, run_id: &str) -> Result<ClaimOutcome, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().storage("begin claim transaction")?;

        let current: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT status, run_id FROM ingestion_log WHERE payer_name = ? AND file_url = ?",
                params![payer, url],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .storage("read ledger entry")?;

        let previous = match &current {
            None => None,
            Some((status, holder)) => {
                let status = LedgerStatus::parse(status)
                    .ok_or_else(|| StorageError::InvalidState(format!("unknown status '{status}'")))?;
                match status {
                    LedgerStatus::Complete => return Ok(ClaimOutcome::AlreadyComplete),
                    LedgerStatus::InProgress => {
                        let held = match holder.as_deref() {
                            Some(holder) => holder == run_id || self.run_is_active(holder)?,
                            None => false,
                        };
                        if held {
                            return Ok(ClaimOutcome::HeldByRun);
                        }
                        Some(LedgerStatus::InProgress)
                    }
                    other => Some(other),
                }
            }
        };

        let started_at = sql_timestamp(Utc::now());
        if current.is_some() {
            tx.execute(
                "UPDATE ingestion_log SET status = 'in_progress', run_id = ?, \
                 started_at = CAST(? AS TIMESTAMP), completed_at = NULL, error_message = NULL, \
                 records_inserted = 0 WHERE payer_name = ? AND file_url = ?",
                params![run_id, started_at, payer, url],
            )
            .storage("claim ledger entry")?;
        } else {
            tx.execute(
                "INSERT INTO ingestion_log (payer_name, file_url, status, records_inserted, started_at, run_id) \
                 VALUES (?, ?, 'in_progress', 0, CAST(? AS TIMESTAMP), ?)",
                params![payer, url, started_at, run_id],
            )
            .storage("insert claimed ledger entry")?;
        }

        let cleared_rows = tx
            .execute(
                "DELETE FROM rates WHERE payer_name = ? AND (file_source = ? OR starts_with(file_source, ?))",
                params![payer, url, format!("{url}#")],
            )
            .storage("clear rows of previous attempt")? as u64;

        tx.commit().storage("commit claim transaction")?;
        Ok(ClaimOutcome::Claimed {
            previous,
            cleared_rows,
        })
    }

    pub fn insert_rows(&self, rows: &[NormalizedRateRow]) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().storage("begin insert transaction")?;
        let mut inserted = 0u64;
        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT INTO rates (
                      payer_name, last_updated, billing_code, billing_code_type, negotiated_rate,
                      negotiated_type, billing_class, place_of_service, npi, tin, file_source, ingested_at
                    ) VALUES (
                      ?, CAST(? AS DATE), ?, ?, CAST(? AS DECIMAL(12, 2)),
                      ?, ?, ?, ?, ?, ?, CAST(? AS TIMESTAMP)
                    )
                "#,
                )
                .storage("prepare insert rates")?;
            for row in rows {
                let last_updated = row.last_updated.map(|d| d.format("%Y-%m-%d").to_string());
                inserted += stmt
                    .execute(params![
                        row.payer_name,
                        last_updated,
                        row.billing_code,
                        row.billing_code_type,
                        row.negotiated_rate,
                        row.negotiated_type,
                        row.billing_class,
                        row.place_of_service,
                        row.npi,
                        row.tin,
                        row.file_source,
                        sql_timestamp(row.ingested_at),
                    ])
                    .storage("insert rate row")? as u64;
            }
        }
        tx.commit().storage("commit insert transaction")?;
        Ok(inserted)
    }

    pub fn complete(&self, payer: &str, url: &str, row_count: u64) -> Result<(), StorageError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE ingestion_log SET status = 'complete', records_inserted = ?, \
                 completed_at = CAST(? AS TIMESTAMP), error_message = NULL \
                 WHERE payer_name = ? AND file_url = ? AND status = 'in_progress'",
                params![row_count as i64, sql_timestamp(Utc::now()), payer, url],
            )
            .storage("mark ledger entry complete")?;
        if changed == 0 {
            return Err(StorageError::InvalidState(format!(
                "{payer} {url} is not in progress"
            )));
        }
        Ok(())
    }

    pub fn fail(&self, payer: &str, url: &str, reason: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE ingestion_log SET status = 'failed', error_message = ?, completed_at = NULL \
             WHERE payer_name = ? AND file_url = ? AND status <> 'complete'",
            params![truncate_for_log(reason), payer, url],
        )
        .storage("mark ledger entry failed")?;
        Ok(())
    }

    pub fn ledger_entry(&self, payer: &str, url: &str) -> Result<Option<LedgerEntry>, StorageError> {
        Ok(self
            .ledger_entries(Some(payer))?
            .into_iter()
            .find(|entry| entry.file_url == url))
    }

    pub fn ledger_entries(&self, payer: Option<&str>) -> Result<Vec<LedgerEntry>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT payer_name, file_url, status, COALESCE(records_inserted, 0)::BIGINT,
                       CAST(started_at AS VARCHAR), CAST(completed_at AS VARCHAR),
                       error_message, run_id
                FROM ingestion_log
                ORDER BY payer_name, file_url
            "#,
            )
            .storage("prepare ledger scan")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<usize, String>(0)?,
                    row.get::<usize, String>(1)?,
                    row.get::<usize, String>(2)?,
                    row.get::<usize, i64>(3)?,
                    row.get::<usize, Option<String>>(4)?,
                    row.get::<usize, Option<String>>(5)?,
                    row.get::<usize, Option<String>>(6)?,
                    row.get::<usize, Option<String>>(7)?,
                ))
            })
            .storage("scan ledger")?;

        let mut out = Vec::new();
        for r in rows {
            let (payer_name, file_url, status, records, started_at, completed_at, error_message, run_id) =
                r.storage("read ledger row")?;
            if payer.is_some_and(|wanted| wanted != payer_name) {
                continue;
            }
            let status = LedgerStatus::parse(&status)
                .ok_or_else(|| StorageError::InvalidState(format!("unknown status '{status}'")))?;
            out.push(LedgerEntry {
                payer_name,
                file_url,
                status,
                records_inserted: records.max(0) as u64,
                started_at,
                completed_at,
                error_message,
                run_id,
            });
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<StoreStats, StorageError> {
        let conn = self.lock()?;
        let (total_rates, payers, billing_codes, npis) = conn
            .query_row(
                "SELECT COUNT(*)::BIGINT, COUNT(DISTINCT payer_name)::BIGINT, \
                 COUNT(DISTINCT billing_code)::BIGINT, COUNT(DISTINCT npi)::BIGINT FROM rates",
                [],
                |row| {
                    Ok((
                        row.get::<usize, i64>(0)?,
                        row.get::<usize, i64>(1)?,
                        row.get::<usize, i64>(2)?,
                        row.get::<usize, i64>(3)?,
                    ))
                },
            )
            .storage("count rates")?;
        let providers: i64 = conn
            .query_row("SELECT COUNT(*)::BIGINT FROM providers", [], |row| row.get(0))
            .storage("count providers")?;

        let mut stats = StoreStats {
            total_rates: total_rates.max(0) as u64,
            payers: payers.max(0) as u64,
            billing_codes: billing_codes.max(0) as u64,
            npis: npis.max(0) as u64,
            providers: providers.max(0) as u64,
            ..StoreStats::default()
        };

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*)::BIGINT FROM ingestion_log GROUP BY status")
            .storage("prepare ledger status counts")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<usize, String>(0)?, row.get::<usize, i64>(1)?))
            })
            .storage("count ledger statuses")?;
        for r in rows {
            let (status, count) = r.storage("read ledger status count")?;
            let count = count.max(0) as u64;
            match LedgerStatus::parse(&status) {
                Some(LedgerStatus::Pending) => stats.ledger_pending = count,
                Some(LedgerStatus::InProgress) => stats.ledger_in_progress = count,
                Some(LedgerStatus::Complete) => stats.ledger_complete = count,
                Some(LedgerStatus::Failed) => stats.ledger_failed = count,
                None => tracing::warn!("ignoring unknown ledger status '{status}'"),
            }
        }
        Ok(stats)
    }

    pub fn payer_breakdown(&self) -> Result<Vec<PayerBreakdown>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT payer_name,
                       COUNT(*)::BIGINT,
                       COUNT(DISTINCT billing_code)::BIGINT,
                       COUNT(DISTINCT npi)::BIGINT,
                       CAST(MIN(negotiated_rate) AS DOUBLE),
                       CAST(MAX(negotiated_rate) AS DOUBLE),
                       CAST(MAX(last_updated) AS VARCHAR)
                FROM rates
                GROUP BY payer_name
                ORDER BY payer_name
            "#,
            )
            .storage("prepare payer breakdown")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PayerBreakdown {
                    payer_name: row.get::<usize, String>(0)?,
                    rows: row.get::<usize, i64>(1)?.max(0) as u64,
                    billing_codes: row.get::<usize, i64>(2)?.max(0) as u64,
                    npis: row.get::<usize, i64>(3)?.max(0) as u64,
                    min_rate: row.get::<usize, Option<f64>>(4)?,
                    max_rate: row.get::<usize, Option<f64>>(5)?,
                    last_updated: row.get::<usize, Option<String>>(6)?,
                })
            })
            .storage("scan payer breakdown")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.storage("read payer breakdown row")?);
        }
        Ok(out)
    }

    /// Rate rows of one payer, ordered for stable comparison.
    pub fn rates_for_payer(&self, payer: &str) -> Result<Vec<StoredRate>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT billing_code, billing_code_type, CAST(negotiated_rate AS DOUBLE),
                       negotiated_type, billing_class, place_of_service, npi, tin,
                       CAST(last_updated AS VARCHAR), file_source
                FROM rates
                WHERE payer_name = ?
                ORDER BY file_source, billing_code, npi, negotiated_rate, place_of_service
            "#,
            )
            .storage("prepare rate scan")?;
        let rows = stmt
            .query_map(params![payer], |row| {
                Ok(StoredRate {
                    billing_code: row.get(0)?,
                    billing_code_type: row.get(1)?,
                    negotiated_rate: row.get(2)?,
                    negotiated_type: row.get(3)?,
                    billing_class: row.get(4)?,
                    place_of_service: row.get(5)?,
                    npi: row.get(6)?,
                    tin: row.get(7)?,
                    last_updated: row.get(8)?,
                    file_source: row.get(9)?,
                })
            })
            .storage("scan rates")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.storage("read rate row")?);
        }
        Ok(out)
    }

    /// Clears every rate row and ledger entry of `payer`.
    pub fn reset_payer(&self, payer: &str) -> Result<ResetCounts, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().storage("begin reset transaction")?;
        let rates = tx
            .execute("DELETE FROM rates WHERE payer_name = ?", params![payer])
            .storage("delete payer rates")? as u64;
        let ledger = tx
            .execute("DELETE FROM ingestion_log WHERE payer_name = ?", params![payer])
            .storage("delete payer ledger")? as u64;
        tx.commit().storage("commit reset transaction")?;
        Ok(ResetCounts { rates, ledger })
    }

    pub fn known_npis(&self) -> Result<HashSet<String>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT npi FROM providers")
            .storage("prepare provider npi scan")?;
        let rows = stmt
            .query_map([], |row| row.get::<usize, String>(0))
            .storage("scan provider npis")?;
        let mut out = HashSet::new();
        for r in rows {
            out.insert(r.storage("read provider npi")?);
        }
        Ok(out)
    }

    pub fn upsert_providers(
        &self,
        records: &[ProviderRecord],
        replace: bool,
    ) -> Result<u64, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().storage("begin provider transaction")?;
        if replace {
            tx.execute("DELETE FROM providers", [])
                .storage("clear providers")?;
        }
        let mut written = 0u64;
        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT OR REPLACE INTO providers
                      (npi, provider_name, provider_type, city, state, zip, taxonomy_code)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
                )
                .storage("prepare provider upsert")?;
            for record in records {
                written += stmt
                    .execute(params![
                        record.npi,
                        record.provider_name,
                        record.provider_type.map(|t| t.code()),
                        record.city,
                        record.state,
                        record.zip,
                        record.taxonomy_code,
                    ])
                    .storage("upsert provider")? as u64;
            }
        }
        tx.commit().storage("commit provider transaction")?;
        Ok(written)
    }
}

fn sql_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProviderType;
    use chrono::NaiveDate;

    const PAYER: &str = "Example Health";
    const URL: &str = "https://example.com/in-network.json.gz";

    fn row(npi: &str, rate: f64, file_source: &str) -> NormalizedRateRow {
        NormalizedRateRow {
            payer_name: PAYER.to_string(),
            last_updated: NaiveDate::from_ymd_opt(2024, 5, 1),
            billing_code: "97110".to_string(),
            billing_code_type: "CPT".to_string(),
            negotiated_rate: rate,
            negotiated_type: Some("negotiated".to_string()),
            billing_class: Some("professional".to_string()),
            place_of_service: Some("11".to_string()),
            npi: npi.to_string(),
            tin: Some("12-3456789".to_string()),
            file_source: file_source.to_string(),
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn claim_lifecycle() {
        let store = RateStore::open_in_memory().unwrap();
        store.register_pending(PAYER, &[URL.to_string()]).unwrap();
        store.register_pending(PAYER, &[URL.to_string()]).unwrap();
        assert_eq!(store.ledger_entries(Some(PAYER)).unwrap().len(), 1);

        let outcome = store.begin(PAYER, URL, "run-1").unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Claimed {
                previous: Some(LedgerStatus::Pending),
                cleared_rows: 0
            }
        );
        assert_eq!(store.begin(PAYER, URL, "run-1").unwrap(), ClaimOutcome::HeldByRun);

        store
            .insert_rows(&[row("1111111111", 45.0, URL), row("2222222222", 45.0, URL)])
            .unwrap();
        store.complete(PAYER, URL, 2).unwrap();

        let entry = store.ledger_entry(PAYER, URL).unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Complete);
        assert_eq!(entry.records_inserted, 2);
        assert!(entry.completed_at.is_some());
        assert_eq!(entry.run_id.as_deref(), Some("run-1"));

        assert_eq!(
            store.begin(PAYER, URL, "run-2").unwrap(),
            ClaimOutcome::AlreadyComplete
        );
    }

    #[test]
    fn claims_of_another_active_run_are_held() {
        let store = RateStore::open_in_memory().unwrap();
        store.enter_run("run-a").unwrap();
        store.enter_run("run-b").unwrap();

        assert!(matches!(
            store.begin(PAYER, URL, "run-a").unwrap(),
            ClaimOutcome::Claimed { .. }
        ));
        assert_eq!(store.begin(PAYER, URL, "run-b").unwrap(), ClaimOutcome::HeldByRun);

        store.leave_run("run-a").unwrap();
        assert_eq!(
            store.begin(PAYER, URL, "run-b").unwrap(),
            ClaimOutcome::Claimed {
                previous: Some(LedgerStatus::InProgress),
                cleared_rows: 0
            }
        );
        assert_eq!(
            store.ledger_entry(PAYER, URL).unwrap().unwrap().run_id.as_deref(),
            Some("run-b")
        );
    }

    #[test]
    fn stale_claim_is_reclaimed_and_rows_cleared() {
        let store = RateStore::open_in_memory().unwrap();
        store.begin(PAYER, URL, "crashed-run").unwrap();
        store
            .insert_rows(&[
                row("1111111111", 45.0, URL),
                row("2222222222", 45.0, &format!("{URL}#member.json")),
                row("3333333333", 45.0, "https://example.com/other.json"),
            ])
            .unwrap();

        let outcome = store.begin(PAYER, URL, "next-run").unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Claimed {
                previous: Some(LedgerStatus::InProgress),
                cleared_rows: 2
            }
        );
        let remaining = store.rates_for_payer(PAYER).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].npi, "3333333333");
    }

    #[test]
    fn failed_entries_are_retryable() {
        let store = RateStore::open_in_memory().unwrap();
        store.begin(PAYER, URL, "run-1").unwrap();
        store.fail(PAYER, URL, "malformed JSON").unwrap();

        let entry = store.ledger_entry(PAYER, URL).unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Failed);
        assert_eq!(entry.error_message.as_deref(), Some("malformed JSON"));

        assert!(matches!(
            store.begin(PAYER, URL, "run-1").unwrap(),
            ClaimOutcome::Claimed {
                previous: Some(LedgerStatus::Failed),
                ..
            }
        ));
    }

    #[test]
    fn complete_requires_a_claim() {
        let store = RateStore::open_in_memory().unwrap();
        store.register_pending(PAYER, &[URL.to_string()]).unwrap();
        let err = store.complete(PAYER, URL, 0).unwrap_err();
        assert!(matches!(err, StorageError::InvalidState(_)));
    }

    #[test]
    fn rates_round_to_two_decimals() {
        let store = RateStore::open_in_memory().unwrap();
        store.insert_rows(&[row("1111111111", 45.004, URL)]).unwrap();
        let rates = store.rates_for_payer(PAYER).unwrap();
        assert_eq!(rates[0].negotiated_rate, 45.0);
        assert_eq!(rates[0].last_updated.as_deref(), Some("2024-05-01"));
    }

    #[test]
    fn stats_breakdown_and_reset() {
        let store = RateStore::open_in_memory().unwrap();
        store.begin(PAYER, URL, "run-1").unwrap();
        store
            .insert_rows(&[row("1111111111", 45.0, URL), row("2222222222", 60.5, URL)])
            .unwrap();
        store.complete(PAYER, URL, 2).unwrap();
        store
            .register_pending("Other Payer", &["https://other.example/a.json".to_string()])
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_rates, 2);
        assert_eq!(stats.payers, 1);
        assert_eq!(stats.npis, 2);
        assert_eq!(stats.ledger_complete, 1);
        assert_eq!(stats.ledger_pending, 1);

        let breakdown = store.payer_breakdown().unwrap();
        assert_eq!(breakdown.len(), 1);
        assert_eq!(breakdown[0].rows, 2);
        assert_eq!(breakdown[0].min_rate, Some(45.0));
        assert_eq!(breakdown[0].max_rate, Some(60.5));

        let counts = store.reset_payer(PAYER).unwrap();
        assert_eq!(counts, ResetCounts { rates: 2, ledger: 1 });
        assert!(store.ledger_entry(PAYER, URL).unwrap().is_none());
        assert_eq!(store.ledger_entries(None).unwrap().len(), 1);
    }

    #[test]
    fn provider_upsert_and_replace() {
        let store = RateStore::open_in_memory().unwrap();
        let provider = |npi: &str, name: &str| ProviderRecord {
            npi: npi.to_string(),
            provider_name: Some(name.to_string()),
            provider_type: Some(ProviderType::Individual),
            city: Some("Minneapolis".to_string()),
            state: Some("MN".to_string()),
            zip: Some("55401".to_string()),
            taxonomy_code: Some("225100000X".to_string()),
        };
        store
            .upsert_providers(&[provider("1111111111", "A"), provider("2222222222", "B")], false)
            .unwrap();
        store
            .upsert_providers(&[provider("1111111111", "A2")], false)
            .unwrap();
        assert_eq!(store.known_npis().unwrap().len(), 2);

        store
            .upsert_providers(&[provider("3333333333", "C")], true)
            .unwrap();
        let npis = store.known_npis().unwrap();
        assert_eq!(npis.len(), 1);
        assert!(npis.contains("3333333333"));
    }

    #[test]
    fn file_database_is_created_with_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rates.duckdb");
        let store = RateStore::open(&path).unwrap();
        store.register_pending(PAYER, &[URL.to_string()]).unwrap();
        drop(store);

        let reopened = RateStore::open(&path).unwrap();
        assert_eq!(reopened.ledger_entries(Some(PAYER)).unwrap().len(), 1);
    }
}
