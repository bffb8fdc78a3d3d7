use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_SOURCE_DIR: &str = "source-pdfs";
pub const DEFAULT_INDEX_DIR: &str = "./chroma_db";
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";
pub const DEFAULT_LLM_MODEL: &str = "llama3";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_TOP_K: usize = 4;
pub const DEFAULT_CHUNK_SIZE: usize = 1_000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_FILE_LIST_TTL: Duration = Duration::from_secs(300);

/// Full application configuration. Every collaborator is built from this, so
/// ingestion and querying in the same process always share one embedding model.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RagConfig {
    pub source_dir: PathBuf,
    pub index_dir: PathBuf,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub file_list_ttl: Duration,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub chunking: ChunkingConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from(DEFAULT_SOURCE_DIR),
            index_dir: PathBuf::from(DEFAULT_INDEX_DIR),
            file_list_ttl: DEFAULT_FILE_LIST_TTL,
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            chunking: ChunkingConfig::default(),
        }
    }
}

impl RagConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::Invalid("retrieval.top_k must be at least 1".to_string()));
        }
        if self.chunking.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunking.chunk_size must be positive".to_string()));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        if self.embedding.model.trim().is_empty() {
            return Err(ConfigError::Invalid("embedding.model must not be empty".to_string()));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.model must not be empty".to_string()));
        }
        ollama_base_url(&self.llm.base_url)?;
        ollama_base_url(&self.embedding.ollama_url)?;
        Ok(())
    }
}

/// Parses an Ollama base URL. Accepts the scheme-less `host:port` form used by
/// `OLLAMA_HOST` and always ends the path with `/` so endpoint joins keep any prefix.
pub fn ollama_base_url(raw: &str) -> Result<Url, url::ParseError> {
    let raw = raw.trim();
    let mut url = if raw.contains("://") {
        Url::parse(raw)?
    } else {
        Url::parse(&format!("http://{raw}"))?
    };
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// In-process ONNX sentence-transformer (requires the `local-embeddings` feature).
    Local,
    /// Ollama `/api/embed`.
    Ollama,
    /// Hashed character trigrams; offline and deterministic.
    Ngram,
}

impl Default for EmbeddingProvider {
    fn default() -> Self {
        if cfg!(feature = "local-embeddings") {
            Self::Local
        } else {
            Self::Ngram
        }
    }
}

impl fmt::Display for EmbeddingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Ollama => "ollama",
            Self::Ngram => "ngram",
        };
        f.write_str(name)
    }
}

impl FromStr for EmbeddingProvider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "ollama" => Ok(Self::Ollama),
            "ngram" => Ok(Self::Ngram),
            other => Err(format!(
                "unknown embedding provider {other:?} (expected local, ollama or ngram)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub ollama_url: String,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            batch_size: 32,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    /// No timeout when unset; a hung generation then blocks its request.
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_LLM_MODEL.to_string(),
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_layout() {
        let config = RagConfig::default();
        assert_eq!(config.source_dir, PathBuf::from("source-pdfs"));
        assert_eq!(config.index_dir, PathBuf::from("./chroma_db"));
        assert_eq!(config.embedding.model, "all-MiniLM-L6-v2");
        assert_eq!(config.llm.model, "llama3");
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.chunking.chunk_size, 1_000);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.file_list_ttl, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let mut config = RagConfig::default();
        config.chunking.chunk_overlap = 1_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_ollama_url_is_rejected() {
        let mut config = RagConfig::default();
        config.llm.base_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Url(_))));
    }

    #[test]
    fn scheme_less_ollama_hosts_are_accepted() -> Result<(), Box<dyn std::error::Error>> {
        for (raw, expected) in [
            ("0.0.0.0:11434", "http://0.0.0.0:11434/"),
            ("127.0.0.1:11434", "http://127.0.0.1:11434/"),
            ("localhost:11434", "http://localhost:11434/"),
            ("http://localhost:11434", "http://localhost:11434/"),
            ("https://gpu.internal/ollama", "https://gpu.internal/ollama/"),
        ] {
            assert_eq!(ollama_base_url(raw)?.as_str(), expected);
        }

        let mut config = RagConfig::default();
        config.llm.base_url = "0.0.0.0:11434".to_string();
        config.embedding.ollama_url = "localhost:11434".to_string();
        assert!(config.validate().is_ok());
        Ok(())
    }

    #[test]
    fn ttl_serializes_as_seconds() -> Result<(), Box<dyn std::error::Error>> {
        let config = RagConfig::default();
        let value = serde_json::to_value(&config)?;
        assert_eq!(value["file_list_ttl"], 300);
        assert_eq!(value["llm"]["timeout"], serde_json::Value::Null);

        let parsed: RagConfig = serde_json::from_value(serde_json::json!({
            "file_list_ttl": 5,
            "llm": { "timeout": 30 }
        }))?;
        assert_eq!(parsed.file_list_ttl, Duration::from_secs(5));
        assert_eq!(parsed.llm.timeout, Some(Duration::from_secs(30)));
        assert_eq!(parsed.llm.model, "llama3");
        Ok(())
    }

    #[test]
    fn provider_parses_case_insensitively() {
        assert_eq!("Ollama".parse::<EmbeddingProvider>(), Ok(EmbeddingProvider::Ollama));
        assert!("chroma".parse::<EmbeddingProvider>().is_err());
    }
}
