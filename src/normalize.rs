use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};

use crate::model::{NormalizedRateRow, ProviderIdentity, RateEntry, RowKey};

/// Per-document stamp applied to every row.
#[derive(Debug, Clone)]
pub struct RowStamp {
    pub payer_name: String,
    pub file_source: String,
    pub last_updated: Option<NaiveDate>,
    pub ingested_at: DateTime<Utc>,
}

/// One row per (price, provider) pair. No providers, no rows.
///
/// `place_of_service` is the first listed service code.
pub fn normalize(
    entry: &RateEntry,
    providers: &[ProviderIdentity],
    stamp: &RowStamp,
) -> Vec<NormalizedRateRow> {
    let mut rows = Vec::with_capacity(entry.prices.len() * providers.len());
    for price in &entry.prices {
        let place_of_service = price.service_codes.first().cloned();
        for provider in providers {
            rows.push(NormalizedRateRow {
                payer_name: stamp.payer_name.clone(),
                last_updated: stamp.last_updated,
                billing_code: entry.billing_code.clone(),
                billing_code_type: entry.billing_code_type.clone(),
                negotiated_rate: price.rate,
                negotiated_type: price.rate_type.clone(),
                billing_class: price.billing_class.clone(),
                place_of_service: place_of_service.clone(),
                npi: provider.npi.clone(),
                tin: provider.tin.clone(),
                file_source: stamp.file_source.clone(),
                ingested_at: stamp.ingested_at,
            });
        }
    }
    rows
}

/// Drops rows already emitted for the same document.
#[derive(Debug, Default)]
pub struct RowDeduplicator {
    seen: HashSet<RowKey>,
    duplicates: u64,
}

impl RowDeduplicator {
    pub fn admit(&mut self, row: &NormalizedRateRow) -> bool {
        let fresh = self.seen.insert(row.key());
        if !fresh {
            self.duplicates += 1;
        }
        fresh
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}
