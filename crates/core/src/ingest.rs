use crate::chunking::RecursiveCharacterSplitter;
use crate::error::IngestError;
use crate::extractor::{LopdfExtractor, PdfExtractor};
use crate::index::{KnowledgeIndex, WriteSummary};
use crate::models::PageDocument;
use crate::traits::KnowledgeIngestor;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

/// `.pdf` files directly inside `folder`, sorted. A missing folder yields nothing.
pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug, Clone)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct LoadedDocuments {
    pub pages: Vec<PageDocument>,
    pub files_loaded: usize,
    pub skipped_files: Vec<SkippedPdf>,
}

/// Extracts every PDF in `folder`. Files that fail to load are recorded and skipped.
pub fn load_documents(folder: &Path, extractor: &dyn PdfExtractor) -> LoadedDocuments {
    let mut loaded = LoadedDocuments::default();

    for path in discover_pdf_files(folder) {
        match extractor.extract_pages(&path) {
            Ok(pages) => {
                loaded.files_loaded += 1;
                loaded.pages.extend(pages);
            }
            Err(error) => {
                warn!(path = %path.display(), reason = %error, "skipped pdf");
                loaded.skipped_files.push(SkippedPdf {
                    path,
                    reason: error.to_string(),
                });
            }
        }
    }

    loaded
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Chunks were written to the index.
    Indexed,
    /// A reset found no documents and left a valid empty index.
    EmptyIndexCreated,
    /// No documents and no reset: the index was not touched.
    NothingToIndex,
}

#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub reset: bool,
    pub outcome: IngestOutcome,
    pub files_loaded: usize,
    pub pages_loaded: usize,
    /// Chunks produced by splitting this run's documents.
    pub chunk_count: usize,
    pub index: WriteSummary,
    pub skipped_files: Vec<SkippedPdf>,
}

pub struct IngestionPipeline {
    source_dir: PathBuf,
    index: Arc<KnowledgeIndex>,
    extractor: Arc<dyn PdfExtractor>,
    splitter: RecursiveCharacterSplitter,
}

impl IngestionPipeline {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        index: Arc<KnowledgeIndex>,
        splitter: RecursiveCharacterSplitter,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            index,
            extractor: Arc::new(LopdfExtractor),
            splitter,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn PdfExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn index(&self) -> &Arc<KnowledgeIndex> {
        &self.index
    }

    /// Loads, splits and indexes every source PDF. With `reset` the index is
    /// deleted first and rebuilt from scratch; a failed deletion aborts the run.
    /// The index writer is held for the whole run.
    pub async fn ingest(&self, reset: bool) -> Result<IngestionReport, IngestError> {
        let mut writer = self.index.writer().await;

        if reset {
            info!(path = %self.index.root().display(), "resetting knowledge index");
            writer.reset().await?;
        }

        let folder = self.source_dir.clone();
        let extractor = Arc::clone(&self.extractor);
        let loaded = tokio::task::spawn_blocking(move || load_documents(&folder, extractor.as_ref()))
            .await
            .map_err(|error| IngestError::Io(std::io::Error::other(error)))?;
        if !loaded.skipped_files.is_empty() {
            warn!(
                skipped = loaded.skipped_files.len(),
                folder = %self.source_dir.display(),
                "some pdfs could not be loaded"
            );
        }

        let mut report = IngestionReport {
            reset,
            outcome: IngestOutcome::NothingToIndex,
            files_loaded: loaded.files_loaded,
            pages_loaded: loaded.pages.len(),
            chunk_count: 0,
            index: WriteSummary::default(),
            skipped_files: loaded.skipped_files,
        };

        if loaded.pages.is_empty() {
            if reset {
                report.index = writer.rebuild_from(&[]).await?;
                report.outcome = IngestOutcome::EmptyIndexCreated;
            }
            info!(reset, outcome = ?report.outcome, "no documents to index");
            return Ok(report);
        }

        let chunks = self.splitter.split_documents(&loaded.pages);
        report.chunk_count = chunks.len();
        report.index = if reset {
            writer.rebuild_from(&chunks).await?
        } else {
            writer.append(&chunks).await?
        };
        report.outcome = IngestOutcome::Indexed;

        info!(
            reset,
            files = report.files_loaded,
            pages = report.pages_loaded,
            chunks = report.chunk_count,
            written = report.index.written,
            "knowledge index updated"
        );
        Ok(report)
    }
}

#[async_trait]
impl KnowledgeIngestor for IngestionPipeline {
    async fn ingest(&self, reset: bool) -> Result<IngestionReport, IngestError> {
        IngestionPipeline::ingest(self, reset).await
    }
}
