//! NPPES provider import into the lookup table used by the known-provider
//! restriction.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};

use crate::config::{GeographyConfig, ProviderFilterConfig};
use crate::model::{ProviderRecord, ProviderType};
use crate::store::RateStore;

const FLUSH_EVERY: usize = 50_000;
const TAXONOMY_COLUMNS: usize = 15;

const NPI: &str = "NPI";
const ENTITY_TYPE: &str = "Entity Type Code";
const ORGANIZATION_NAME: &str = "Provider Organization Name (Legal Business Name)";
const FIRST_NAME: &str = "Provider First Name";
const LAST_NAME: &str = "Provider Last Name (Legal Name)";
const CITY: &str = "Provider Business Practice Location Address City Name";
const STATE: &str = "Provider Business Practice Location Address State Name";
const POSTAL_CODE: &str = "Provider Business Practice Location Address Postal Code";

/// Geography and specialty constraints. Empty lists do not constrain.
#[derive(Debug, Clone, Default)]
pub struct ProviderFilter {
    states: HashSet<String>,
    zip_prefixes: Vec<String>,
    taxonomy_codes: HashSet<String>,
}

impl ProviderFilter {
    pub fn new(geography: &GeographyConfig, providers: &ProviderFilterConfig) -> Self {
        let clean = |values: &[String]| -> Vec<String> {
            values
                .iter()
                .map(|v| v.trim().to_ascii_uppercase())
                .filter(|v| !v.is_empty())
                .collect()
        };
        Self {
            states: clean(&geography.states).into_iter().collect(),
            zip_prefixes: clean(&geography.zip_prefixes),
            taxonomy_codes: clean(&providers.taxonomy_codes).into_iter().collect(),
        }
    }

    fn allows_location(&self, state: &str, zip: &str) -> bool {
        let state_ok = self.states.is_empty() || self.states.contains(state);
        let zip_ok = self.zip_prefixes.is_empty()
            || self.zip_prefixes.iter().any(|prefix| zip.starts_with(prefix.as_str()));
        state_ok && zip_ok
    }

    /// The taxonomy to record for a provider, or `None` when the filter rejects it.
    fn pick_taxonomy<'a>(&self, taxonomies: &[&'a str]) -> Option<Option<&'a str>> {
        if self.taxonomy_codes.is_empty() {
            return Some(taxonomies.first().copied());
        }
        taxonomies
            .iter()
            .find(|code| self.taxonomy_codes.contains(&code.to_ascii_uppercase()))
            .map(|code| Some(*code))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderImport {
    pub scanned: u64,
    pub loaded: u64,
    pub interrupted: bool,
}

struct Columns {
    npi: usize,
    entity_type: Option<usize>,
    organization: Option<usize>,
    first_name: Option<usize>,
    last_name: Option<usize>,
    city: Option<usize>,
    state: Option<usize>,
    postal_code: Option<usize>,
    taxonomies: Vec<usize>,
}

impl Columns {
    fn locate(headers: &csv::StringRecord) -> Result<Self> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        Ok(Self {
            npi: header_index(headers, NPI)?,
            entity_type: find(ENTITY_TYPE),
            organization: find(ORGANIZATION_NAME),
            first_name: find(FIRST_NAME),
            last_name: find(LAST_NAME),
            city: find(CITY),
            state: find(STATE),
            postal_code: find(POSTAL_CODE),
            taxonomies: (1..=TAXONOMY_COLUMNS)
                .filter_map(|n| find(format!("Healthcare Provider Taxonomy Code_{n}").as_str()))
                .collect(),
        })
    }
}

fn header_index(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .with_context(|| format!("CSV missing required header '{name}'"))
}

fn field<'r>(row: &'r csv::StringRecord, idx: Option<usize>) -> &'r str {
    idx.and_then(|i| row.get(i)).map(str::trim).unwrap_or("")
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn provider_name(organization: &str, first: &str, last: &str) -> Option<String> {
    if !organization.is_empty() {
        Some(organization.to_string())
    } else if !first.is_empty() && !last.is_empty() {
        Some(format!("{first} {last}"))
    } else if !first.is_empty() {
        Some(first.to_string())
    } else {
        non_empty(last)
    }
}

/// Streams an NPPES CSV, handing matching providers to `sink` in chunks.
pub fn scan_nppes<R, F>(
    reader: R,
    filter: &ProviderFilter,
    shutdown: Option<&AtomicBool>,
    mut sink: F,
) -> Result<ProviderImport>
where
    R: Read,
    F: FnMut(Vec<ProviderRecord>) -> Result<()>,
{
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let headers = reader.headers().context("Failed reading NPPES headers")?.clone();
    let columns = Columns::locate(&headers)?;

    let mut outcome = ProviderImport::default();
    let mut pending = Vec::new();
    for row in reader.records() {
        let row = row.context("Failed reading NPPES record")?;
        outcome.scanned += 1;
        if outcome.scanned % FLUSH_EVERY as u64 == 0
            && shutdown.is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            outcome.interrupted = true;
            break;
        }

        let npi = field(&row, Some(columns.npi));
        if npi.is_empty() {
            continue;
        }
        let state = field(&row, columns.state).to_ascii_uppercase();
        let zip: String = field(&row, columns.postal_code).chars().take(5).collect();
        if !filter.allows_location(&state, &zip) {
            continue;
        }
        let taxonomies: Vec<&str> = columns
            .taxonomies
            .iter()
            .map(|&idx| field(&row, Some(idx)))
            .filter(|code| !code.is_empty())
            .collect();
        let Some(taxonomy) = filter.pick_taxonomy(&taxonomies) else {
            continue;
        };

        pending.push(ProviderRecord {
            npi: npi.to_string(),
            provider_name: provider_name(
                field(&row, columns.organization),
                field(&row, columns.first_name),
                field(&row, columns.last_name),
            ),
            provider_type: field(&row, columns.entity_type)
                .parse::<i32>()
                .ok()
                .and_then(ProviderType::from_code),
            city: non_empty(field(&row, columns.city)),
            state: non_empty(&state),
            zip: non_empty(&zip),
            taxonomy_code: taxonomy.map(str::to_string),
        });
        outcome.loaded += 1;

        if pending.len() >= FLUSH_EVERY {
            sink(std::mem::take(&mut pending))?;
        }
    }
    if !pending.is_empty() {
        sink(pending)?;
    }
    Ok(outcome)
}

pub fn load_providers(
    store: &RateStore,
    csv_path: &Path,
    filter: &ProviderFilter,
    replace: bool,
    shutdown: Option<&AtomicBool>,
) -> Result<ProviderImport> {
    tracing::info!("Loading providers from {}", csv_path.display());
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("Failed opening NPPES CSV {}", csv_path.display()))?;

    if replace {
        store
            .upsert_providers(&[], true)
            .context("Failed clearing provider table")?;
    }
    let outcome = scan_nppes(file, filter, shutdown, |records| {
        store
            .upsert_providers(&records, false)
            .context("Failed upserting providers")?;
        Ok(())
    })
    .with_context(|| format!("Failed importing {}", csv_path.display()))?;

    if outcome.interrupted {
        tracing::warn!(
            "Shutdown requested; kept {} providers after scanning {} rows",
            outcome.loaded,
            outcome.scanned
        );
    } else {
        tracing::info!(
            "Scanned {} rows, loaded {} providers",
            outcome.scanned,
            outcome.loaded
        );
    }
    Ok(outcome)
}
