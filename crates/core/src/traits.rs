use crate::error::{IngestError, ModelError};
use crate::ingest::IngestionReport;
use async_trait::async_trait;

/// Text generation backend used to answer questions.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, ModelError>;
}

/// Rebuilds or extends the knowledge index from the current source files.
#[async_trait]
pub trait KnowledgeIngestor: Send + Sync {
    async fn ingest(&self, reset: bool) -> Result<IngestionReport, IngestError>;
}
