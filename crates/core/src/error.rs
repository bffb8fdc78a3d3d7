use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file not found in source store: {0}")]
    NotFound(String),

    #[error("invalid source file name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl IngestError {
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Index(error) => error.hint(),
            Self::Model(error) => error.hint(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("knowledge index not found at {0}")]
    Missing(PathBuf),

    #[error("knowledge index at {0} has no manifest (interrupted reset or never trained)")]
    Uninitialized(PathBuf),

    #[error("knowledge index at {path} is corrupt: {details}")]
    Corrupt { path: PathBuf, details: String },

    #[error("knowledge index is being rebuilt, retry shortly")]
    Reindexing,

    #[error("knowledge index was built with embedding model {indexed:?} but {configured:?} is configured")]
    ModelMismatch { indexed: String, configured: String },

    #[error("embedding dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl IndexError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Missing(_) | Self::Uninitialized(_) | Self::Corrupt { .. } => Some(
                "train the system (or reset all knowledge) to build the knowledge index first",
            ),
            Self::Reindexing => Some("a reset is in progress; ask again once it finishes"),
            Self::ModelMismatch { .. } | Self::DimensionMismatch { .. } => Some(
                "use the embedding model the index was built with, or reset all knowledge",
            ),
            Self::Model(error) => error.hint(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{service} is unreachable at {endpoint}: {details}")]
    Unavailable {
        service: String,
        endpoint: String,
        details: String,
    },

    #[error("{service} did not answer within {seconds}s")]
    Timeout { service: String, seconds: u64 },

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl ModelError {
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Unavailable { .. } | Self::Http(_) | Self::BackendResponse { .. } => Some(
                "check that the Ollama service is running and the configured model has been pulled",
            ),
            Self::Timeout { .. } => Some("the local model is slow or stuck; retry the request"),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable { .. } | Self::Http(_))
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("question is empty")]
    EmptyQuestion,

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl QueryError {
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::EmptyQuestion => None,
            Self::Index(error) => error.hint(),
            Self::Model(error) => error.hint(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
