use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Number, Value};

/// Canonical key of a provider group.
///
/// Payers publish group ids as integers (`123`) or as decimals that encode a
/// network prefix (`720.0000237894`). Both the definition site and the citing
/// rate entry go through [`ReferenceId::from_value`], so equal ids compare equal
/// regardless of how the number was spelled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceId(String);

impl ReferenceId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn from_number(number: &Number) -> Self {
        if let Some(v) = number.as_u64() {
            return Self(v.to_string());
        }
        if let Some(v) = number.as_i64() {
            return Self(v.to_string());
        }
        match number.as_f64() {
            Some(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => Self((v as i64).to_string()),
            Some(v) => Self(v.to_string()),
            None => Self(number.to_string()),
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self::from_number(n)),
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return None;
                }
                match trimmed.parse::<Number>() {
                    Ok(n) => Some(Self::from_number(&n)),
                    Err(_) => Some(Self(trimmed.to_string())),
                }
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One concrete billing identity behind a provider group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderIdentity {
    pub npi: String,
    pub tin_type: Option<String>,
    pub tin: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderGroupReference {
    pub id: ReferenceId,
    pub providers: Vec<ProviderIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceEntry {
    pub rate: f64,
    pub rate_type: Option<String>,
    pub billing_class: Option<String>,
    pub service_codes: Vec<String>,
    pub expiration_date: Option<String>,
}

/// One negotiated-rate group of an `in_network` item: the item's code fields,
/// the group's prices and the providers those prices apply to.
#[derive(Debug, Clone, PartialEq)]
pub struct RateEntry {
    pub billing_code: String,
    pub billing_code_type: String,
    pub negotiation_arrangement: Option<String>,
    pub prices: Vec<PriceEntry>,
    pub reference_ids: Vec<ReferenceId>,
    /// Providers listed inline on the rate instead of through a reference id.
    pub embedded_providers: Vec<ProviderIdentity>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentHeader {
    pub reporting_entity_name: Option<String>,
    pub last_updated_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRateRow {
    pub payer_name: String,
    pub last_updated: Option<NaiveDate>,
    pub billing_code: String,
    pub billing_code_type: String,
    pub negotiated_rate: f64,
    pub negotiated_type: Option<String>,
    pub billing_class: Option<String>,
    pub place_of_service: Option<String>,
    pub npi: String,
    pub tin: Option<String>,
    pub file_source: String,
    pub ingested_at: DateTime<Utc>,
}

/// Identity of a stored row, excluding the ingestion timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub billing_code: String,
    pub billing_code_type: String,
    pub rate_cents: i64,
    pub negotiated_type: Option<String>,
    pub billing_class: Option<String>,
    pub place_of_service: Option<String>,
    pub npi: String,
    pub tin: Option<String>,
    pub file_source: String,
}

impl NormalizedRateRow {
    pub fn key(&self) -> RowKey {
        RowKey {
            billing_code: self.billing_code.clone(),
            billing_code_type: self.billing_code_type.clone(),
            rate_cents: to_cents(self.negotiated_rate),
            negotiated_type: self.negotiated_type.clone(),
            billing_class: self.billing_class.clone(),
            place_of_service: self.place_of_service.clone(),
            npi: self.npi.clone(),
            tin: self.tin.clone(),
            file_source: self.file_source.clone(),
        }
    }
}

pub fn to_cents(rate: f64) -> i64 {
    (rate * 100.0).round() as i64
}

/// NPPES entity type: 1 = individual clinician, 2 = organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    Individual,
    Organization,
}

impl ProviderType {
    pub fn code(self) -> i32 {
        match self {
            Self::Individual => 1,
            Self::Organization => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Individual),
            2 => Some(Self::Organization),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRecord {
    pub npi: String,
    pub provider_name: Option<String>,
    pub provider_type: Option<ProviderType>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub taxonomy_code: Option<String>,
}
