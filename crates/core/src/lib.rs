pub mod admin;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod file_store;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod qa;
pub mod runtime;
pub mod traits;

pub use admin::{AdminSession, AdminWorkflow};
pub use chunking::{RecursiveCharacterSplitter, DEFAULT_SEPARATORS};
pub use config::{
    ChunkingConfig, EmbeddingConfig, EmbeddingProvider, LlmConfig, RagConfig, RetrievalConfig,
};
pub use embeddings::{
    create_embedder, CharacterNgramEmbedder, Embedder, OllamaEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
#[cfg(feature = "local-embeddings")]
pub use embeddings::FastEmbedder;
pub use error::{ConfigError, IndexError, IngestError, ModelError, QueryError, StoreError};
pub use extractor::{extract_page_texts, LopdfExtractor, PdfExtractor};
pub use file_store::{FileStore, ListingCache, UploadOutcome};
pub use index::{index_status, IndexManifest, IndexStatus, IndexWriter, KnowledgeIndex, WriteSummary};
pub use ingest::{
    discover_pdf_files, load_documents, IngestOutcome, IngestionPipeline, IngestionReport,
    LoadedDocuments, SkippedPdf,
};
pub use llm::OllamaClient;
pub use models::{
    Answer, ChunkMetadata, Notice, NoticeLevel, PageDocument, RetrievedChunk, SourceCitation,
    TextChunk,
};
pub use qa::{format_sources, respond, stuff_prompt, RetrievalQa};
pub use runtime::{RagRuntime, RuntimeStatus};
pub use traits::{KnowledgeIngestor, LanguageModel};
