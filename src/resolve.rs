//! Provider-group reference resolution.
//!
//! Rate entries are buffered by [`DocumentCollector`] while the document is
//! decoded, so a reference table placed after `in_network` is as usable as one
//! placed before it. Resolution runs once the whole document has been read.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::decode::DecodeSink;
use crate::error::ResolutionError;
use crate::filter::CodeFilter;
use crate::model::{ProviderGroupReference, ProviderIdentity, RateEntry, ReferenceId};

#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    groups: HashMap<ReferenceId, Vec<ProviderIdentity>>,
}

impl ReferenceTable {
    /// Repeated definitions of one id are concatenated.
    pub fn insert(&mut self, group: ProviderGroupReference) {
        self.groups
            .entry(group.id)
            .or_default()
            .extend(group.providers);
    }

    pub fn get(&self, id: &ReferenceId) -> Option<&[ProviderIdentity]> {
        self.groups.get(id).map(Vec::as_slice)
    }

    pub fn contains(&self, id: &ReferenceId) -> bool {
        self.groups.contains_key(id)
    }

    pub fn extend(&mut self, other: ReferenceTable) {
        for (id, providers) in other.groups {
            self.insert(ProviderGroupReference { id, providers });
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub providers: Vec<ProviderIdentity>,
    pub issues: Vec<ResolutionError>,
}

/// Maps a rate entry's references to concrete provider identities.
///
/// Document-local definitions win over the external table. When
/// `known_npis` is a non-empty set, identities outside it are dropped.
pub struct Resolver<'a> {
    document: &'a ReferenceTable,
    external: Option<&'a ReferenceTable>,
    known_npis: Option<&'a HashSet<String>>,
}

impl<'a> Resolver<'a> {
    pub fn new(document: &'a ReferenceTable) -> Self {
        Self {
            document,
            external: None,
            known_npis: None,
        }
    }

    pub fn with_external(mut self, external: &'a ReferenceTable) -> Self {
        self.external = Some(external);
        self
    }

    pub fn restricted_to(mut self, known_npis: &'a HashSet<String>) -> Self {
        self.known_npis = Some(known_npis).filter(|npis| !npis.is_empty());
        self
    }

    pub fn resolve(&self, entry: &RateEntry) -> Resolution {
        let mut resolution = Resolution::default();
        let mut seen: HashSet<(&str, Option<&str>)> = HashSet::new();
        let mut candidates: Vec<&ProviderIdentity> = entry.embedded_providers.iter().collect();

        for id in &entry.reference_ids {
            let group = self
                .document
                .get(id)
                .or_else(|| self.external.and_then(|table| table.get(id)));
            match group {
                None => resolution
                    .issues
                    .push(ResolutionError::UnknownReference(id.clone())),
                Some([]) => resolution.issues.push(ResolutionError::EmptyGroup(id.clone())),
                Some(providers) => candidates.extend(providers),
            }
        }

        for provider in candidates {
            if self
                .known_npis
                .is_some_and(|known| !known.contains(&provider.npi))
            {
                continue;
            }
            if seen.insert((provider.npi.as_str(), provider.tin.as_deref())) {
                resolution.providers.push(provider.clone());
            }
        }
        resolution
    }
}

/// Buffers the accepted entries and the reference table of one document.
pub struct DocumentCollector {
    filter: Arc<CodeFilter>,
    shutdown: Option<Arc<AtomicBool>>,
    pub entries: Vec<RateEntry>,
    pub references: ReferenceTable,
    pub remote: HashMap<ReferenceId, String>,
}

impl DocumentCollector {
    pub fn new(filter: Arc<CodeFilter>) -> Self {
        Self {
            filter,
            shutdown: None,
            entries: Vec::new(),
            references: ReferenceTable::default(),
            remote: HashMap::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Remote locations cited by buffered entries and not defined inline.
    pub fn cited_remote(&self) -> Vec<(ReferenceId, String)> {
        let mut wanted: Vec<(ReferenceId, String)> = Vec::new();
        let mut seen = HashSet::new();
        for id in self.entries.iter().flat_map(|entry| &entry.reference_ids) {
            if self.references.contains(id) || !seen.insert(id) {
                continue;
            }
            if let Some(location) = self.remote.get(id) {
                wanted.push((id.clone(), location.clone()));
            }
        }
        wanted
    }
}

impl DecodeSink for DocumentCollector {
    fn accepts(&self, billing_code: &str, billing_code_type: &str) -> bool {
        self.filter.accepts(billing_code, billing_code_type)
    }

    fn rate_entry(&mut self, entry: RateEntry) {
        self.entries.push(entry);
    }

    fn provider_group(&mut self, group: ProviderGroupReference) {
        self.references.insert(group);
    }

    fn remote_reference(&mut self, id: ReferenceId, location: String) {
        self.remote.entry(id).or_insert(location);
    }

    fn should_stop(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Sink for separately published reference files.
///
/// A file may carry a full `provider_references` table, or only the
/// `provider_groups` of a single group, which are filed under `standalone_id`.
#[derive(Debug, Default)]
pub struct ReferenceFileCollector {
    standalone_id: Option<ReferenceId>,
    pub table: ReferenceTable,
}

impl ReferenceFileCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_group(id: ReferenceId) -> Self {
        Self {
            standalone_id: Some(id),
            table: ReferenceTable::default(),
        }
    }
}

impl DecodeSink for ReferenceFileCollector {
    fn accepts(&self, _billing_code: &str, _billing_code_type: &str) -> bool {
        false
    }

    fn rate_entry(&mut self, _entry: RateEntry) {}

    fn provider_group(&mut self, group: ProviderGroupReference) {
        self.table.insert(group);
    }

    fn standalone_groups(&mut self, providers: Vec<ProviderIdentity>) {
        if let Some(id) = self.standalone_id.clone() {
            self.table.insert(ProviderGroupReference { id, providers });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode_document;
    use crate::filter::AllowedCode;

    fn identity(npi: &str, tin: &str) -> ProviderIdentity {
        ProviderIdentity {
            npi: npi.to_string(),
            tin_type: Some("ein".to_string()),
            tin: Some(tin.to_string()),
        }
    }

    fn entry(ids: &[&str]) -> RateEntry {
        RateEntry {
            billing_code: "97110".to_string(),
            billing_code_type: "CPT".to_string(),
            negotiation_arrangement: None,
            prices: Vec::new(),
            reference_ids: ids.iter().map(|id| ReferenceId::new(*id)).collect(),
            embedded_providers: Vec::new(),
        }
    }

    fn table(groups: &[(&str, Vec<ProviderIdentity>)]) -> ReferenceTable {
        let mut table = ReferenceTable::default();
        for (id, providers) in groups {
            table.insert(ProviderGroupReference {
                id: ReferenceId::new(*id),
                providers: providers.clone(),
            });
        }
        table
    }

    fn filter() -> Arc<CodeFilter> {
        Arc::new(CodeFilter::new([AllowedCode {
            code: "97110".to_string(),
            code_type: None,
            label: None,
        }]))
    }

    #[test]
    fn unknown_ids_resolve_to_nothing() {
        let document = table(&[("1", vec![identity("1111111111", "12-3456789")])]);
        let resolution = Resolver::new(&document).resolve(&entry(&["9"]));
        assert!(resolution.providers.is_empty());
        assert_eq!(
            resolution.issues,
            vec![ResolutionError::UnknownReference(ReferenceId::new("9"))]
        );
    }

    #[test]
    fn providers_are_deduplicated_on_npi_and_tin() {
        let document = table(&[
            ("1", vec![identity("1111111111", "12-3456789")]),
            (
                "2",
                vec![
                    identity("1111111111", "12-3456789"),
                    identity("1111111111", "98-7654321"),
                ],
            ),
        ]);
        let resolution = Resolver::new(&document).resolve(&entry(&["1", "2"]));
        assert_eq!(resolution.providers.len(), 2);
        assert!(resolution.issues.is_empty());
    }

    #[test]
    fn document_definitions_win_over_external() {
        let document = table(&[("1", vec![identity("1111111111", "12-3456789")])]);
        let external = table(&[
            ("1", vec![identity("9999999999", "00-0000000")]),
            ("2", vec![identity("2222222222", "12-3456789")]),
        ]);
        let resolution = Resolver::new(&document)
            .with_external(&external)
            .resolve(&entry(&["1", "2"]));
        let npis: Vec<&str> = resolution.providers.iter().map(|p| p.npi.as_str()).collect();
        assert_eq!(npis, vec!["1111111111", "2222222222"]);
    }

    #[test]
    fn empty_groups_are_reported() {
        let document = table(&[("5", Vec::new())]);
        let resolution = Resolver::new(&document).resolve(&entry(&["5"]));
        assert!(resolution.providers.is_empty());
        assert_eq!(
            resolution.issues,
            vec![ResolutionError::EmptyGroup(ReferenceId::new("5"))]
        );
    }

    #[test]
    fn known_provider_restriction() {
        let document = table(&[(
            "1",
            vec![
                identity("1111111111", "12-3456789"),
                identity("2222222222", "12-3456789"),
            ],
        )]);
        let known: HashSet<String> = ["2222222222".to_string()].into_iter().collect();
        let restricted = Resolver::new(&document)
            .restricted_to(&known)
            .resolve(&entry(&["1"]));
        assert_eq!(restricted.providers.len(), 1);
        assert_eq!(restricted.providers[0].npi, "2222222222");

        let nobody = HashSet::new();
        let unrestricted = Resolver::new(&document)
            .restricted_to(&nobody)
            .resolve(&entry(&["1"]));
        assert_eq!(unrestricted.providers.len(), 2);
    }

    #[test]
    fn definition_order_does_not_matter() {
        let references = r#""provider_references": [
            {"provider_group_id": 123, "provider_groups": [
                {"npi": ["1111111111", "2222222222"], "tin": {"type": "ein", "value": "12-3456789"}}]}
        ]"#;
        let in_network = r#""in_network": [{"billing_code": "97110", "billing_code_type": "CPT",
            "negotiated_rates": [{"provider_references": [123],
                "negotiated_prices": [{"negotiated_rate": 45.0, "negotiated_type": "negotiated"}]}]}]"#;

        let mut outcomes = Vec::new();
        for doc in [
            format!("{{{references}, {in_network}}}"),
            format!("{{{in_network}, {references}}}"),
        ] {
            let mut collector = DocumentCollector::new(filter());
            decode_document(doc.as_bytes(), &mut collector).unwrap();
            let resolver = Resolver::new(&collector.references);
            let resolved: Vec<Resolution> =
                collector.entries.iter().map(|e| resolver.resolve(e)).collect();
            outcomes.push(resolved);
        }
        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(outcomes[0][0].providers.len(), 2);
    }

    #[test]
    fn cited_remote_skips_inline_and_uncited_ids() {
        let doc = r#"{"in_network": [{"billing_code": "97110", "negotiated_rates": [
                {"provider_references": [1, 2, 2], "negotiated_prices": [{"negotiated_rate": 10}]}]}],
            "provider_references": [
                {"provider_group_id": 1, "provider_groups": [{"npi": [1111111111]}]},
                {"provider_group_id": 2, "location": "https://example.com/2.json"},
                {"provider_group_id": 3, "location": "https://example.com/3.json"}
            ]}"#;
        let mut collector = DocumentCollector::new(filter());
        decode_document(doc.as_bytes(), &mut collector).unwrap();
        assert_eq!(
            collector.cited_remote(),
            vec![(
                ReferenceId::new("2"),
                "https://example.com/2.json".to_string()
            )]
        );
    }

    #[test]
    fn shutdown_flag_stops_collection() {
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut collector = DocumentCollector::new(filter()).with_shutdown(shutdown);
        let doc = r#"{"in_network": [{"billing_code": "97110"}]}"#;
        let err = decode_document(doc.as_bytes(), &mut collector).unwrap_err();
        assert!(matches!(err, crate::error::DecodeError::Aborted));
    }

    #[test]
    fn standalone_file_is_filed_under_requested_id() {
        let doc = r#"{"provider_groups": [{"npi": [4444444444], "tin": {"type": "ein", "value": "1"}}]}"#;
        let mut collector = ReferenceFileCollector::for_group(ReferenceId::new("720.5"));
        decode_document(doc.as_bytes(), &mut collector).unwrap();
        let providers = collector.table.get(&ReferenceId::new("720.5")).unwrap();
        assert_eq!(providers.len(), 1);
    }
}
