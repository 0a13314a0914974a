//! Document lists for a payer: the payer's table-of-contents index plus any
//! directly configured files.

use std::collections::HashSet;
use std::io::Read;

use serde::Deserialize;

use crate::error::{DecodeError, IngestError};
use crate::fetch::{Fetcher, Location, for_each_document};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDescriptor {
    pub url: String,
    pub description: Option<String>,
}

/// Where one payer publishes its in-network files.
#[derive(Debug, Clone, Default)]
pub struct IndexSource {
    pub payer_name: String,
    pub index_url: Option<String>,
    pub files: Vec<String>,
    pub description_filter: Vec<String>,
    pub max_files: Option<usize>,
}

impl IndexSource {
    pub async fn list_documents(
        &self,
        fetcher: &Fetcher,
    ) -> Result<Vec<DocumentDescriptor>, IngestError> {
        let mut documents = Vec::new();

        if let Some(index_url) = self.index_url.as_deref() {
            tracing::info!("[{}] fetching index {index_url}", self.payer_name);
            let stream = fetcher.open(index_url).await?;
            let filter = self.description_filter.clone();
            let source = stream.source().to_string();
            let listed = tokio::task::spawn_blocking(move || {
                let mut listed = Vec::new();
                for_each_document(stream, &source, |_, reader| {
                    listed.extend(parse_index(reader, &filter)?);
                    Ok(())
                })?;
                Ok::<_, DecodeError>(listed)
            })
            .await
            .map_err(|err| IngestError::Worker(err.to_string()))??;
            tracing::info!(
                "[{}] index lists {} in-network files",
                self.payer_name,
                listed.len()
            );
            documents.extend(listed);
        }

        for file in &self.files {
            let url = file.trim();
            if url.is_empty() {
                continue;
            }
            Location::parse(url)?;
            documents.push(DocumentDescriptor {
                url: url.to_string(),
                description: None,
            });
        }

        let mut documents = dedup_documents(documents);
        if let Some(limit) = self.max_files {
            documents.truncate(limit);
        }
        Ok(documents)
    }
}

#[derive(Deserialize)]
struct TableOfContents {
    #[serde(default)]
    reporting_structure: Option<Vec<ReportingStructure>>,
    #[serde(default)]
    in_network_files: Option<Vec<FileReference>>,
}

#[derive(Deserialize)]
struct ReportingStructure {
    #[serde(default)]
    in_network_files: Option<Vec<FileReference>>,
}

#[derive(Deserialize)]
struct FileReference {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

/// Extracts in-network file locations from a table-of-contents document.
///
/// Locations nested under `reporting_structure` take precedence; top-level
/// `in_network_files` are only used when the nested form yields nothing.
/// Only `http(s)` locations are kept. A non-empty `description_filter`
/// keeps entries whose description contains one of its substrings.
pub fn parse_index<R: Read>(
    reader: R,
    description_filter: &[String],
) -> Result<Vec<DocumentDescriptor>, DecodeError> {
    let toc: TableOfContents = serde_json::from_reader(std::io::BufReader::new(reader))
        .map_err(DecodeError::from_json)?;

    let mut references: Vec<FileReference> = toc
        .reporting_structure
        .unwrap_or_default()
        .into_iter()
        .flat_map(|rs| rs.in_network_files.unwrap_or_default())
        .collect();
    if references.is_empty() {
        references = toc.in_network_files.unwrap_or_default();
    }

    let wanted: Vec<String> = description_filter
        .iter()
        .map(|needle| needle.trim().to_ascii_lowercase())
        .filter(|needle| !needle.is_empty())
        .collect();

    let documents = references
        .into_iter()
        .filter_map(|reference| {
            let url = reference.location?.trim().to_string();
            if !Location::parse(&url).is_ok_and(|location| location.is_remote()) {
                return None;
            }
            let description = reference.description.map(|d| d.trim().to_string());
            if !wanted.is_empty() {
                let haystack = description.as_deref().unwrap_or("").to_ascii_lowercase();
                if !wanted.iter().any(|needle| haystack.contains(needle)) {
                    return None;
                }
            }
            Some(DocumentDescriptor { url, description })
        })
        .collect();
    Ok(dedup_documents(documents))
}

fn dedup_documents(documents: Vec<DocumentDescriptor>) -> Vec<DocumentDescriptor> {
    let mut seen = HashSet::new();
    documents
        .into_iter()
        .filter(|doc| seen.insert(doc.url.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"{
        "reporting_entity_name": "Example Health",
        "reporting_structure": [
            {"reporting_plans": [{"plan_name": "Gold"}],
             "in_network_files": [
                {"description": "National PPO", "location": "https://example.com/national.json.gz"},
                {"description": "Local HMO", "location": "https://example.com/local.json.gz"}
             ],
             "allowed_amount_file": {"location": "https://example.com/allowed.json"}},
            {"in_network_files": [
                {"description": "National PPO", "location": "https://example.com/national.json.gz"},
                {"description": "Bad", "location": "s3://bucket/file.json"},
                {"description": "No location"}
            ]}
        ],
        "in_network_files": [{"description": "top", "location": "https://example.com/top.json"}]
    }"#;

    fn urls(docs: &[DocumentDescriptor]) -> Vec<&str> {
        docs.iter().map(|d| d.url.as_str()).collect()
    }

    #[test]
    fn nested_files_are_listed_once_in_order() {
        let docs = parse_index(INDEX.as_bytes(), &[]).unwrap();
        assert_eq!(
            urls(&docs),
            vec![
                "https://example.com/national.json.gz",
                "https://example.com/local.json.gz"
            ]
        );
        assert_eq!(docs[0].description.as_deref(), Some("National PPO"));
    }

    #[test]
    fn description_filter_is_case_insensitive() {
        let docs = parse_index(INDEX.as_bytes(), &["local".to_string()]).unwrap();
        assert_eq!(urls(&docs), vec!["https://example.com/local.json.gz"]);
    }

    #[test]
    fn top_level_files_are_a_fallback() {
        let index = r#"{"in_network_files": [
            {"location": "https://example.com/a.json"},
            {"location": "https://example.com/a.json"},
            {"location": "https://example.com/b.json"}
        ]}"#;
        let docs = parse_index(index.as_bytes(), &[]).unwrap();
        assert_eq!(
            urls(&docs),
            vec!["https://example.com/a.json", "https://example.com/b.json"]
        );
    }

    #[test]
    fn malformed_index_is_a_decode_error() {
        let err = parse_index(r#"{"in_network_files": [}"#.as_bytes(), &[]).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[tokio::test]
    async fn direct_files_are_appended_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("index.json");
        std::fs::write(&index_path, INDEX).unwrap();

        let source = IndexSource {
            payer_name: "Example Health".to_string(),
            index_url: Some(index_path.display().to_string()),
            files: vec![
                "https://example.com/local.json.gz".to_string(),
                "data/extra.json".to_string(),
            ],
            description_filter: Vec::new(),
            max_files: Some(3),
        };
        let fetcher = Fetcher::new(1).unwrap();
        let docs = source.list_documents(&fetcher).await.unwrap();
        assert_eq!(
            urls(&docs),
            vec![
                "https://example.com/national.json.gz",
                "https://example.com/local.json.gz",
                "data/extra.json"
            ]
        );
    }
}
