use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::filter::{AllowedCode, CodeFilter};
use crate::source::IndexSource;

pub const DEFAULT_CONFIG_PATH: &str = "config/tic.toml";
pub const DEFAULT_DATABASE_PATH: &str = "data/rates.duckdb";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub codes: Vec<CodeConfig>,
    #[serde(default)]
    pub payers: Vec<PayerConfig>,
    #[serde(default)]
    pub geography: GeographyConfig,
    #[serde(default)]
    pub providers: ProviderFilterConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default)]
    pub restrict_to_known_providers: bool,
    #[serde(default = "default_true")]
    pub follow_remote_references: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            restrict_to_known_providers: false,
            follow_remote_references: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeConfig {
    pub code: String,
    #[serde(default)]
    pub code_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PayerConfig {
    pub name: String,
    #[serde(default)]
    pub index_url: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    /// Separately published provider-reference files loaded before each document.
    #[serde(default)]
    pub reference_files: Vec<String>,
    #[serde(default)]
    pub description_filter: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub max_files: Option<usize>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl PayerConfig {
    pub fn source(&self, max_files_override: Option<usize>) -> IndexSource {
        IndexSource {
            payer_name: self.name.clone(),
            index_url: self
                .index_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string),
            files: self.files.clone(),
            description_filter: self.description_filter.clone(),
            max_files: max_files_override.or(self.max_files),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeographyConfig {
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default)]
    pub zip_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderFilterConfig {
    #[serde(default)]
    pub taxonomy_codes: Vec<String>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

fn default_workers() -> usize {
    2
}

fn default_batch_size() -> usize {
    5000
}

fn default_max_retries() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.codes.iter().all(|c| c.code.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "at least one [[codes]] entry with a non-empty code is required".to_string(),
            ));
        }
        if self.ingest.workers == 0 {
            return Err(ConfigError::Invalid("ingest.workers must be at least 1".to_string()));
        }
        if self.ingest.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "ingest.batch_size must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for payer in &self.payers {
            let name = payer.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Invalid("payer name must not be empty".to_string()));
            }
            if !names.insert(name.to_ascii_lowercase()) {
                return Err(ConfigError::Invalid(format!("duplicate payer name '{name}'")));
            }
            let has_index = payer
                .index_url
                .as_deref()
                .is_some_and(|url| !url.trim().is_empty());
            let has_files = payer.files.iter().any(|f| !f.trim().is_empty());
            if payer.enabled && !has_index && !has_files {
                return Err(ConfigError::Invalid(format!(
                    "payer '{name}' needs an index_url or at least one file"
                )));
            }
        }
        Ok(())
    }

    pub fn code_filter(&self) -> CodeFilter {
        CodeFilter::new(self.codes.iter().map(|c| AllowedCode {
            code: c.code.clone(),
            code_type: c
                .code_type
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            label: c.label.clone(),
        }))
    }

    /// Enabled payers, or the named ones (case-insensitive) when `selected` is non-empty.
    /// Explicitly named payers are returned even when disabled.
    pub fn select_payers(&self, selected: &[String]) -> Result<Vec<&PayerConfig>, ConfigError> {
        if selected.is_empty() {
            return Ok(self.payers.iter().filter(|p| p.enabled).collect());
        }
        let mut out = Vec::new();
        for wanted in selected {
            let payer = self
                .find_payer(wanted)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown payer '{wanted}'")))?;
            if !out.iter().any(|p: &&PayerConfig| std::ptr::eq(*p, payer)) {
                out.push(payer);
            }
        }
        Ok(out)
    }

    pub fn find_payer(&self, name: &str) -> Option<&PayerConfig> {
        let name = name.trim();
        self.payers
            .iter()
            .find(|p| p.name.trim().eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[database]
path = "data/test.duckdb"

[ingest]
workers = 4

[[codes]]
code = "97110"
label = "Therapeutic exercise"

[[codes]]
code = "97140"
code_type = "CPT"
label = "Manual therapy"

[[payers]]
name = "Example Health"
index_url = "https://example.com/index.json"
description_filter = ["National"]

[[payers]]
name = "Local Files"
files = ["data/in-network.json.gz"]
enabled = false

[geography]
states = ["MN"]
zip_prefixes = ["554", "551"]

[providers]
taxonomy_codes = ["225100000X"]
"#;

    fn parse(text: &str) -> Config {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn sample_parses_with_defaults() {
        let config = parse(SAMPLE);
        config.validate().unwrap();
        assert_eq!(config.database.path, PathBuf::from("data/test.duckdb"));
        assert_eq!(config.ingest.workers, 4);
        assert_eq!(config.ingest.batch_size, 5000);
        assert_eq!(config.ingest.max_retries, 3);
        assert!(config.ingest.follow_remote_references);
        assert!(!config.ingest.restrict_to_known_providers);
        assert!(config.payers[0].enabled);
        assert_eq!(config.geography.zip_prefixes, vec!["554", "551"]);

        let filter = config.code_filter();
        assert!(filter.accepts("97110", "HCPCS"));
        assert!(filter.accepts("97140", "CPT"));
        assert!(!filter.accepts("97140", "HCPCS"));
        assert_eq!(filter.label("97140"), Some("Manual therapy"));
    }

    #[test]
    fn empty_file_uses_defaults_but_fails_validation() {
        let config = parse("");
        assert_eq!(config.database.path, PathBuf::from(DEFAULT_DATABASE_PATH));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_payers_are_rejected() {
        let text = format!("{SAMPLE}\n[[payers]]\nname = \"example health\"\nfiles = [\"a.json\"]\n");
        let err = parse(&text).validate().unwrap_err();
        assert!(err.to_string().contains("duplicate payer"));
    }

    #[test]
    fn enabled_payer_without_documents_is_rejected() {
        let text = "[[codes]]\ncode = \"97110\"\n[[payers]]\nname = \"Nothing\"\n";
        assert!(parse(text).validate().is_err());
    }

    #[test]
    fn zero_workers_are_rejected() {
        let text = "[ingest]\nworkers = 0\n[[codes]]\ncode = \"97110\"\n";
        assert!(parse(text).validate().is_err());
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let result: Result<Config, _> = toml::from_str("[ingest]\nworker = 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn payer_selection() {
        let config = parse(SAMPLE);
        let enabled = config.select_payers(&[]).unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "Example Health");

        let named = config
            .select_payers(&["local files".to_string(), "Local Files".to_string()])
            .unwrap();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].name, "Local Files");

        assert!(config.select_payers(&["Nobody".to_string()]).is_err());
    }

    #[test]
    fn source_respects_max_files_override() {
        let config = parse(SAMPLE);
        let source = config.payers[0].source(Some(2));
        assert_eq!(source.max_files, Some(2));
        assert_eq!(source.description_filter, vec!["National"]);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
