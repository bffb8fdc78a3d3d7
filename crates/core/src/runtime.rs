//! Process-wide resources shared by ingestion and querying.
//!
//! The embedding model, the knowledge index and the language-model client are
//! created on first use and reused for the rest of the process. Ingestion and
//! querying both go through the same [`KnowledgeIndex`], so they always embed
//! with the same model.

use crate::admin::AdminWorkflow;
use crate::chunking::RecursiveCharacterSplitter;
use crate::config::RagConfig;
use crate::embeddings::create_embedder;
use crate::error::{ConfigError, IngestError, ModelError, QueryError, StoreError};
use crate::file_store::FileStore;
use crate::index::{index_status, IndexStatus, KnowledgeIndex};
use crate::ingest::{IngestionPipeline, IngestionReport};
use crate::llm::OllamaClient;
use crate::models::{Answer, Notice};
use crate::qa::{respond, RetrievalQa, EMPTY_QUESTION_NOTICE};
use crate::traits::{KnowledgeIngestor, LanguageModel};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeStatus {
    pub index: IndexStatus,
    pub source_files: Vec<String>,
}

pub struct RagRuntime {
    config: RagConfig,
    files: OnceCell<Arc<FileStore>>,
    index: OnceCell<Arc<KnowledgeIndex>>,
    llm: OnceCell<Arc<dyn LanguageModel>>,
}

impl RagRuntime {
    pub fn new(config: RagConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            files: OnceCell::new(),
            index: OnceCell::new(),
            llm: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub async fn file_store(&self) -> Result<Arc<FileStore>, StoreError> {
        self.files
            .get_or_try_init(|| async {
                FileStore::open(&self.config.source_dir, self.config.file_list_ttl).map(Arc::new)
            })
            .await
            .cloned()
    }

    /// Loads the embedding model on first call.
    pub async fn index(&self) -> Result<Arc<KnowledgeIndex>, ModelError> {
        self.index
            .get_or_try_init(|| async {
                let embedder = create_embedder(&self.config.embedding).await?;
                debug!(path = %self.config.index_dir.display(), "opening knowledge index");
                Ok::<_, ModelError>(Arc::new(
                    KnowledgeIndex::new(&self.config.index_dir, embedder)
                        .with_batch_size(self.config.embedding.batch_size),
                ))
            })
            .await
            .cloned()
    }

    pub async fn language_model(&self) -> Result<Arc<dyn LanguageModel>, ModelError> {
        self.llm
            .get_or_try_init(|| async {
                let client = OllamaClient::from_config(&self.config.llm)?;
                Ok::<_, ModelError>(Arc::new(client) as Arc<dyn LanguageModel>)
            })
            .await
            .cloned()
    }

    pub async fn pipeline(&self) -> Result<IngestionPipeline, IngestError> {
        let splitter = RecursiveCharacterSplitter::new(&self.config.chunking)?;
        let index = self.index().await?;
        Ok(IngestionPipeline::new(&self.config.source_dir, index, splitter))
    }

    pub async fn qa(&self) -> Result<RetrievalQa, QueryError> {
        let index = self.index().await?;
        let llm = self.language_model().await?;
        Ok(RetrievalQa::new(index, llm, self.config.retrieval.top_k)
            .with_timeout(self.config.llm.timeout))
    }

    /// One question end to end. Problems, including a model that fails to load,
    /// come back as notices. An empty question never loads a model.
    pub async fn ask(&self, question: &str) -> (Option<Answer>, Vec<Notice>) {
        if question.trim().is_empty() {
            return (None, vec![Notice::warning(EMPTY_QUESTION_NOTICE)]);
        }
        match self.qa().await {
            Ok(qa) => respond(&qa, question).await,
            Err(error) => {
                warn!(%error, "question answering could not be prepared");
                let mut notices = vec![Notice::error(format!(
                    "could not prepare question answering: {error}"
                ))];
                if let Some(hint) = error.hint() {
                    notices.push(Notice::info(hint));
                }
                (None, notices)
            }
        }
    }

    /// The embedding model is only loaded once a training action runs.
    pub async fn admin(self: &Arc<Self>) -> Result<AdminWorkflow, StoreError> {
        let files = self.file_store().await?;
        Ok(AdminWorkflow::new(files, Arc::clone(self) as Arc<dyn KnowledgeIngestor>))
    }

    /// Index state and source files, without loading any model.
    pub async fn status(&self) -> Result<RuntimeStatus, IngestError> {
        let index = index_status(&self.config.index_dir)?;
        let source_files = self.file_store().await?.list()?;
        Ok(RuntimeStatus {
            index,
            source_files,
        })
    }
}

#[async_trait]
impl KnowledgeIngestor for RagRuntime {
    async fn ingest(&self, reset: bool) -> Result<IngestionReport, IngestError> {
        self.pipeline().await?.ingest(reset).await
    }
}
