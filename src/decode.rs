//! Incremental decoder for in-network rate documents.
//!
//! The document is walked with a serde visitor over a reader-backed
//! `serde_json::Deserializer`, so only one `in_network` item or one
//! `provider_references` element is materialized at a time. Every event is
//! pushed into a [`DecodeSink`]; the sink decides which billing codes are worth
//! the cost of parsing their negotiated rates.

use std::fmt;
use std::io::{BufReader, Read};

use chrono::NaiveDate;
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use serde_json::value::RawValue;

use crate::error::DecodeError;
use crate::model::{
    DocumentHeader, PriceEntry, ProviderGroupReference, ProviderIdentity, RateEntry, ReferenceId,
};

const READ_BUFFER_BYTES: usize = 256 * 1024;
const DEFAULT_BILLING_CODE_TYPE: &str = "CPT";
/// Largest magnitude `negotiated_rate DECIMAL(12, 2)` can hold.
const MAX_STORABLE_RATE: f64 = 9_999_999_999.99;

/// Consumer of decoded document events.
pub trait DecodeSink {
    /// Called once per `in_network` item before its rates are parsed.
    fn accepts(&self, billing_code: &str, billing_code_type: &str) -> bool;

    fn rate_entry(&mut self, entry: RateEntry);

    fn provider_group(&mut self, group: ProviderGroupReference);

    /// A `provider_references` element that points at a separate file.
    fn remote_reference(&mut self, _id: ReferenceId, _location: String) {}

    /// Top-level `provider_groups` of a standalone reference file.
    fn standalone_groups(&mut self, _providers: Vec<ProviderIdentity>) {}

    fn should_stop(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeSummary {
    pub header: DocumentHeader,
    pub in_network_items: u64,
    pub accepted_items: u64,
    pub rate_entries: u64,
    pub skipped_prices: u64,
    pub reference_definitions: u64,
    pub remote_references: u64,
    pub invalid_references: u64,
}

/// Decode one JSON document from `reader`, feeding `sink` as items are parsed.
///
/// `reader` may be unbuffered; it is wrapped in a large `BufReader`.
pub fn decode_document<R: Read, S: DecodeSink>(
    reader: R,
    sink: &mut S,
) -> Result<DecodeSummary, DecodeError> {
    let mut de =
        serde_json::Deserializer::from_reader(BufReader::with_capacity(READ_BUFFER_BYTES, reader));
    let mut ctx = Context {
        sink,
        summary: DecodeSummary::default(),
        aborted: false,
    };

    let result = (&mut de)
        .deserialize_map(DocumentVisitor(&mut ctx))
        .and_then(|()| de.end());

    if ctx.aborted {
        return Err(DecodeError::Aborted);
    }
    result.map_err(DecodeError::from_json)?;
    Ok(ctx.summary)
}

struct Context<'s, S> {
    sink: &'s mut S,
    summary: DecodeSummary,
    aborted: bool,
}

impl<S: DecodeSink> Context<'_, S> {
    fn check_stop<E: de::Error>(&mut self) -> Result<(), E> {
        if self.sink.should_stop() {
            self.aborted = true;
            return Err(E::custom("decoding stopped"));
        }
        Ok(())
    }
}

struct DocumentVisitor<'c, 's, S>(&'c mut Context<'s, S>);

impl<'de, S: DecodeSink> Visitor<'de> for DocumentVisitor<'_, '_, S> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an in-network rate document object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "reporting_entity_name" => {
                    self.0.summary.header.reporting_entity_name = map
                        .next_value::<Option<String>>()?
                        .map(|name| name.trim().to_string())
                        .filter(|name| !name.is_empty());
                }
                "last_updated_on" => {
                    let raw = map.next_value::<Option<String>>()?;
                    self.0.summary.header.last_updated_on = raw.as_deref().and_then(parse_date);
                }
                "in_network" => map.next_value_seed(InNetworkSeed(&mut *self.0))?,
                "provider_references" => map.next_value_seed(ReferencesSeed(&mut *self.0))?,
                "provider_groups" => map.next_value_seed(StandaloneGroupsSeed(&mut *self.0))?,
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(())
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let day = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

struct InNetworkSeed<'c, 's, S>(&'c mut Context<'s, S>);

impl<'de, S: DecodeSink> DeserializeSeed<'de> for InNetworkSeed<'_, '_, S> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de, S: DecodeSink> Visitor<'de> for InNetworkSeed<'_, '_, S> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an in_network array")
    }

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        let ctx = self.0;
        loop {
            ctx.check_stop::<A::Error>()?;
            let Some(item) = seq.next_element::<InNetworkItem>()? else {
                break;
            };
            ctx.summary.in_network_items += 1;
            emit_item(ctx, item).map_err(<A::Error as de::Error>::custom)?;
        }
        Ok(())
    }
}

fn emit_item<S: DecodeSink>(ctx: &mut Context<'_, S>, item: InNetworkItem) -> Result<(), String> {
    let Some(billing_code) = item.billing_code.filter(|code| !code.is_empty()) else {
        return Ok(());
    };
    let billing_code_type = item
        .billing_code_type
        .filter(|code_type| !code_type.is_empty())
        .unwrap_or_else(|| DEFAULT_BILLING_CODE_TYPE.to_string());

    if !ctx.sink.accepts(&billing_code, &billing_code_type) {
        return Ok(());
    }
    ctx.summary.accepted_items += 1;

    let Some(raw_rates) = item.negotiated_rates else {
        return Ok(());
    };
    let groups: Option<Vec<NegotiatedRateGroup>> = serde_json::from_str(raw_rates.get())
        .map_err(|err| format!("negotiated_rates of billing code {billing_code}: {err}"))?;

    for group in groups.unwrap_or_default() {
        let mut prices = Vec::with_capacity(group.negotiated_prices.len());
        for price in group.negotiated_prices {
            match price.into_entry() {
                Some(entry) => prices.push(entry),
                None => ctx.summary.skipped_prices += 1,
            }
        }
        let reference_ids = group
            .provider_references
            .iter()
            .filter_map(ReferenceId::from_value)
            .collect();
        let embedded_providers = group
            .provider_groups
            .into_iter()
            .flat_map(RawProviderGroup::into_identities)
            .collect();

        ctx.summary.rate_entries += 1;
        ctx.sink.rate_entry(RateEntry {
            billing_code: billing_code.clone(),
            billing_code_type: billing_code_type.clone(),
            negotiation_arrangement: item.negotiation_arrangement.clone(),
            prices,
            reference_ids,
            embedded_providers,
        });
    }
    Ok(())
}

struct ReferencesSeed<'c, 's, S>(&'c mut Context<'s, S>);

impl<'de, S: DecodeSink> DeserializeSeed<'de> for ReferencesSeed<'_, '_, S> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de, S: DecodeSink> Visitor<'de> for ReferencesSeed<'_, '_, S> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a provider_references array")
    }

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        let ctx = self.0;
        loop {
            ctx.check_stop::<A::Error>()?;
            let Some(definition) = seq.next_element::<RawReferenceDefinition>()? else {
                break;
            };
            let Some(id) = ReferenceId::from_value(&definition.provider_group_id) else {
                ctx.summary.invalid_references += 1;
                continue;
            };

            let providers: Vec<ProviderIdentity> = definition
                .provider_groups
                .into_iter()
                .flat_map(RawProviderGroup::into_identities)
                .collect();

            match definition.location.filter(|loc| !loc.trim().is_empty()) {
                Some(location) if providers.is_empty() => {
                    ctx.summary.remote_references += 1;
                    ctx.sink.remote_reference(id, location.trim().to_string());
                }
                _ => {
                    ctx.summary.reference_definitions += 1;
                    ctx.sink.provider_group(ProviderGroupReference { id, providers });
                }
            }
        }
        Ok(())
    }
}

struct StandaloneGroupsSeed<'c, 's, S>(&'c mut Context<'s, S>);

impl<'de, S: DecodeSink> DeserializeSeed<'de> for StandaloneGroupsSeed<'_, '_, S> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        let groups = null_as_empty::<D, RawProviderGroup>(deserializer)?;
        let providers: Vec<ProviderIdentity> = groups
            .into_iter()
            .flat_map(RawProviderGroup::into_identities)
            .collect();
        self.0.sink.standalone_groups(providers);
        Ok(())
    }
}

#[derive(Deserialize)]
struct InNetworkItem {
    #[serde(default, deserialize_with = "lenient_string")]
    billing_code: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    billing_code_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    negotiation_arrangement: Option<String>,
    #[serde(default)]
    negotiated_rates: Option<Box<RawValue>>,
}

#[derive(Deserialize)]
struct NegotiatedRateGroup {
    #[serde(default, deserialize_with = "null_as_empty")]
    negotiated_prices: Vec<RawPrice>,
    #[serde(default, deserialize_with = "null_as_empty")]
    provider_references: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_empty")]
    provider_groups: Vec<RawProviderGroup>,
}

#[derive(Deserialize)]
struct RawPrice {
    #[serde(default, deserialize_with = "lenient_f64")]
    negotiated_rate: Option<f64>,
    #[serde(default, deserialize_with = "lenient_string")]
    negotiated_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    billing_class: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    service_code: Vec<Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    expiration_date: Option<String>,
}

impl RawPrice {
    fn into_entry(self) -> Option<PriceEntry> {
        // Placeholder amounts such as 99999999999.99 do not fit the column.
        let rate = self
            .negotiated_rate
            .filter(|rate| rate.is_finite() && rate.abs() <= MAX_STORABLE_RATE)?;
        Some(PriceEntry {
            rate,
            rate_type: self.negotiated_type,
            billing_class: self.billing_class,
            service_codes: self.service_code.iter().filter_map(value_text).collect(),
            expiration_date: self.expiration_date,
        })
    }
}

#[derive(Deserialize)]
struct RawProviderGroup {
    #[serde(default, deserialize_with = "null_as_empty")]
    npi: Vec<Value>,
    #[serde(default)]
    tin: Option<RawTin>,
}

#[derive(Deserialize)]
struct RawTin {
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    tin_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    value: Option<String>,
}

impl RawProviderGroup {
    fn into_identities(self) -> Vec<ProviderIdentity> {
        let (tin_type, tin) = match self.tin {
            Some(tin) => (tin.tin_type, tin.value),
            None => (None, None),
        };
        self.npi
            .iter()
            .filter_map(npi_text)
            .map(|npi| ProviderIdentity {
                npi,
                tin_type: tin_type.clone(),
                tin: tin.clone(),
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct RawReferenceDefinition {
    #[serde(default)]
    provider_group_id: Value,
    #[serde(default, deserialize_with = "null_as_empty")]
    provider_groups: Vec<RawProviderGroup>,
    #[serde(default, deserialize_with = "lenient_string")]
    location: Option<String>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Value>::deserialize(deserializer)?
        .as_ref()
        .and_then(value_text))
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn npi_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(ReferenceId::from_number(n).as_str().to_string()),
        other => value_text(other),
    }
}
