use crate::config::{ollama_base_url, EmbeddingConfig, EmbeddingProvider};
use crate::error::ModelError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Turns text into fixed-dimension vectors. Ingestion and querying must use
/// the same model; the knowledge index records `model_name` to enforce it.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// Known up front for local models, `None` for remote ones.
    fn dimensions(&self) -> Option<usize>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| ModelError::Embedding("empty embedding response".to_string()))
    }
}

pub async fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, ModelError> {
    info!(provider = %config.provider, model = %config.model, "loading embedding model");
    match config.provider {
        EmbeddingProvider::Ngram => Ok(Arc::new(CharacterNgramEmbedder::default())),
        EmbeddingProvider::Ollama => Ok(Arc::new(OllamaEmbedder::new(
            &config.ollama_url,
            &config.model,
        )?)),
        #[cfg(feature = "local-embeddings")]
        EmbeddingProvider::Local => Ok(Arc::new(
            FastEmbedder::load(&config.model, config.batch_size).await?,
        )),
        #[cfg(not(feature = "local-embeddings"))]
        EmbeddingProvider::Local => Err(ModelError::Embedding(
            "the local embedding provider requires the `local-embeddings` feature".to_string(),
        )),
    }
}

#[derive(Debug, Clone)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
    model: String,
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model: format!("char-trigram-{dimensions}"),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> Option<usize> {
        Some(self.dimensions)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

/// Embeddings served by a local Ollama instance (`POST /api/embed`).
pub struct OllamaEmbedder {
    endpoint: String,
    model: String,
    client: Client,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: impl Into<String>) -> Result<Self, ModelError> {
        let endpoint = ollama_base_url(base_url)?.join("api/embed")?.to_string();
        Ok(Self {
            endpoint,
            model: model.into(),
            client: Client::new(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> Option<usize> {
        None
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = texts.len(), model = %self.model, "requesting ollama embeddings");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(|error| ModelError::Unavailable {
                service: "ollama embeddings".to_string(),
                endpoint: self.endpoint.clone(),
                details: error.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::BackendResponse {
                backend: "ollama".to_string(),
                details: format!("{status}: {body}"),
            });
        }

        let parsed: Value = response.json().await?;
        let vectors = parse_ollama_embeddings(&parsed)?;
        if vectors.len() != texts.len() {
            return Err(ModelError::BackendResponse {
                backend: "ollama".to_string(),
                details: format!("expected {} embeddings, got {}", texts.len(), vectors.len()),
            });
        }
        Ok(vectors)
    }
}

fn parse_ollama_embeddings(value: &Value) -> Result<Vec<Vec<f32>>, ModelError> {
    let embeddings = value
        .pointer("/embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::BackendResponse {
            backend: "ollama".to_string(),
            details: "missing embeddings array".to_string(),
        })?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| {
                    values
                        .iter()
                        .map(|value| value.as_f64().unwrap_or(0.0) as f32)
                        .collect()
                })
                .ok_or_else(|| ModelError::BackendResponse {
                    backend: "ollama".to_string(),
                    details: "embedding is not an array".to_string(),
                })
        })
        .collect()
}

#[cfg(feature = "local-embeddings")]
pub use local::FastEmbedder;

#[cfg(feature = "local-embeddings")]
mod local {
    use super::Embedder;
    use crate::error::ModelError;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Sentence-transformer models run in-process through ONNX Runtime.
    /// Weights are downloaded once and cached by fastembed.
    pub struct FastEmbedder {
        model: Arc<Mutex<fastembed::TextEmbedding>>,
        name: String,
        dimensions: usize,
        batch_size: usize,
    }

    impl FastEmbedder {
        pub async fn load(name: &str, batch_size: usize) -> Result<Self, ModelError> {
            let (model_kind, dimensions) = resolve_model(name)?;
            let model = tokio::task::spawn_blocking(move || {
                fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model_kind).with_show_download_progress(true),
                )
            })
            .await
            .map_err(|error| ModelError::Embedding(error.to_string()))?
            .map_err(|error| {
                ModelError::Embedding(format!("failed to initialize local embedding model: {error}"))
            })?;

            Ok(Self {
                model: Arc::new(Mutex::new(model)),
                name: name.to_string(),
                dimensions,
                batch_size: batch_size.max(1),
            })
        }
    }

    fn resolve_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize), ModelError> {
        match name.to_ascii_lowercase().as_str() {
            "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
                Ok((fastembed::EmbeddingModel::AllMiniLML6V2, 384))
            }
            "bge-small-en-v1.5" => Ok((fastembed::EmbeddingModel::BGESmallENV15, 384)),
            "bge-base-en-v1.5" => Ok((fastembed::EmbeddingModel::BGEBaseENV15, 768)),
            "multilingual-e5-small" => Ok((fastembed::EmbeddingModel::MultilingualE5Small, 384)),
            other => Err(ModelError::Embedding(format!(
                "unknown local embedding model {other:?}; supported: all-MiniLM-L6-v2, \
                 bge-small-en-v1.5, bge-base-en-v1.5, multilingual-e5-small"
            ))),
        }
    }

    #[async_trait]
    impl Embedder for FastEmbedder {
        fn model_name(&self) -> &str {
            &self.name
        }

        fn dimensions(&self) -> Option<usize> {
            Some(self.dimensions)
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }

            let model = Arc::clone(&self.model);
            let texts = texts.to_vec();
            let batch_size = self.batch_size;
            tokio::task::spawn_blocking(move || {
                let mut model = model
                    .lock()
                    .map_err(|_| ModelError::Embedding("embedding model lock poisoned".to_string()))?;
                model
                    .embed(texts, Some(batch_size))
                    .map_err(|error| ModelError::Embedding(error.to_string()))
            })
            .await
            .map_err(|error| ModelError::Embedding(error.to_string()))?
        }
    }
}
