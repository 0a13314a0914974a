use std::io;

use thiserror::Error;

use crate::model::ReferenceId;

/// Transport-level failure while retrieving a document or index.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid document location '{0}'")]
    InvalidLocation(String),

    #[error("request failed for {url}: {message}")]
    Request { url: String, message: String },

    #[error("HTTP status {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("failed opening local file {path}: {source}")]
    Local {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("transfer of {url} was interrupted: {message}")]
    Interrupted { url: String, message: String },

    #[error("failed building HTTP client: {0}")]
    Client(String),
}

/// Malformed or unsupported document content.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON at line {line}, column {column}: {message}")]
    Malformed {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("unsupported document structure: {0}")]
    Unsupported(String),

    #[error("failed reading document stream: {0}")]
    Read(#[source] io::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("decoding stopped by shutdown request")]
    Aborted,
}

impl DecodeError {
    pub(crate) fn from_json(err: serde_json::Error) -> Self {
        use serde_json::error::Category;
        match err.classify() {
            Category::Io => Self::Read(io::Error::from(err)),
            Category::Syntax | Category::Eof => Self::Malformed {
                line: err.line(),
                column: err.column(),
                message: err.to_string(),
            },
            Category::Data => Self::Unsupported(err.to_string()),
        }
    }
}

/// Inconsistency between a rate entry and the reference table. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("provider group reference {0} is not defined")]
    UnknownReference(ReferenceId),

    #[error("provider group reference {0} resolves to no provider")]
    EmptyGroup(ReferenceId),
}

/// Persistence layer failure.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{context}: {source}")]
    Database {
        context: String,
        #[source]
        source: duckdb::Error,
    },

    #[error("failed creating database directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("database connection lock is poisoned")]
    Poisoned,

    #[error("unexpected ledger state: {0}")]
    InvalidState(String),
}

pub(crate) trait StorageContext<T> {
    fn storage(self, context: &str) -> Result<T, StorageError>;
}

impl<T> StorageContext<T> for duckdb::Result<T> {
    fn storage(self, context: &str) -> Result<T, StorageError> {
        self.map_err(|source| StorageError::Database {
            context: context.to_string(),
            source,
        })
    }
}

/// Everything that can end the ingestion of one document.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decode(DecodeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("interrupted before completion")]
    Interrupted,

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl IngestError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Decode(_) => "decode",
            Self::Storage(_) => "storage",
            Self::Interrupted => "interrupted",
            Self::Worker(_) => "worker",
        }
    }
}

impl From<DecodeError> for IngestError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Aborted => Self::Interrupted,
            DecodeError::Read(io_err) => match transport_failure(&io_err) {
                Some(fetch) => Self::Fetch(fetch),
                None => Self::Decode(DecodeError::Read(io_err)),
            },
            other => Self::Decode(other),
        }
    }
}

/// Transport errors raised mid-stream travel through the decoder as `io::Error`s
/// wrapping a `FetchError`; recover them so the ledger records a fetch failure.
fn transport_failure(err: &io::Error) -> Option<FetchError> {
    let inner = err.get_ref()?.downcast_ref::<FetchError>()?;
    match inner {
        FetchError::Interrupted { url, message } => Some(FetchError::Interrupted {
            url: url.clone(),
            message: message.clone(),
        }),
        other => Some(FetchError::Request {
            url: String::new(),
            message: other.to_string(),
        }),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed parsing config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_stream_is_reported_as_fetch_failure() {
        let io_err = io::Error::other(FetchError::Interrupted {
            url: "https://example.com/a.json".to_string(),
            message: "connection reset".to_string(),
        });
        let err = IngestError::from(DecodeError::Read(io_err));
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "fetch");
    }

    #[test]
    fn plain_read_error_stays_a_decode_failure() {
        let io_err = io::Error::new(io::ErrorKind::InvalidData, "corrupt deflate stream");
        let err = IngestError::from(DecodeError::Read(io_err));
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn aborted_decode_becomes_interrupted() {
        let err = IngestError::from(DecodeError::Aborted);
        assert!(matches!(err, IngestError::Interrupted));
    }
}
