//! Persisted vector index for the knowledge base.
//!
//! Layout of the index directory:
//!
//! * `manifest.json` describes the index (embedding model, dimensions, chunk
//!   count, generation). A directory without it is an uninitialized index.
//! * `chunks.jsonl` holds one record per chunk: id, text, metadata, vector.
//!
//! Both files are replaced through a synced temp file and a rename, so a
//! process restart observes either the previous or the new content. Writers
//! are serialized through [`IndexWriter`]; readers never block on a writer
//! and are turned away while a reset is in flight.

use crate::embeddings::Embedder;
use crate::error::{IndexError, ModelError};
use crate::models::{ChunkMetadata, RetrievedChunk, TextChunk};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const CHUNKS_FILE: &str = "chunks.jsonl";
const FORMAT_VERSION: u32 = 1;
const DEFAULT_EMBED_BATCH: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexManifest {
    pub format_version: u32,
    pub embedding_model: String,
    pub dimensions: Option<usize>,
    pub chunk_count: usize,
    pub generation: Uuid,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexStatus {
    Missing,
    Uninitialized,
    Ready(IndexManifest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    id: String,
    text: String,
    metadata: ChunkMetadata,
    embedding: Vec<f32>,
}

#[derive(Debug)]
struct LoadedIndex {
    generation: Uuid,
    records: Vec<IndexRecord>,
}

/// Result of a write through [`IndexWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteSummary {
    /// Chunks newly stored by this call.
    pub written: usize,
    /// Chunks skipped because the index already held identical content.
    /// Always 0 for a rebuild.
    pub unchanged: usize,
    /// Chunks in the index after the call.
    pub total: usize,
}

/// Reads the state of the index directory at `root` without loading any model.
pub fn index_status(root: &Path) -> Result<IndexStatus, IndexError> {
    match read_manifest(root) {
        Ok(manifest) => Ok(IndexStatus::Ready(manifest)),
        Err(IndexError::Missing(_)) => Ok(IndexStatus::Missing),
        Err(IndexError::Uninitialized(_)) => Ok(IndexStatus::Uninitialized),
        Err(error) => Err(error),
    }
}

pub struct KnowledgeIndex {
    root: PathBuf,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    writer: Mutex<()>,
    resetting: AtomicBool,
    cache: RwLock<Option<LoadedIndex>>,
}

impl KnowledgeIndex {
    pub fn new(root: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            root: root.into(),
            embedder,
            batch_size: DEFAULT_EMBED_BATCH,
            writer: Mutex::new(()),
            resetting: AtomicBool::new(false),
            cache: RwLock::new(None),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn status(&self) -> Result<IndexStatus, IndexError> {
        index_status(&self.root)
    }

    /// Waits for exclusive write access. Only one writer exists at a time.
    pub async fn writer(&self) -> IndexWriter<'_> {
        IndexWriter {
            index: self,
            _guard: self.writer.lock().await,
        }
    }

    pub async fn reset(&self) -> Result<(), IndexError> {
        self.writer().await.reset().await
    }

    pub async fn rebuild_from(&self, chunks: &[TextChunk]) -> Result<WriteSummary, IndexError> {
        self.writer().await.rebuild_from(chunks).await
    }

    pub async fn append(&self, chunks: &[TextChunk]) -> Result<WriteSummary, IndexError> {
        self.writer().await.append(chunks).await
    }

    /// Returns the `k` stored chunks most similar to `embedding`, best first.
    pub async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<RetrievedChunk>, IndexError> {
        if self.resetting.load(Ordering::SeqCst) {
            return Err(IndexError::Reindexing);
        }

        let manifest = read_manifest(&self.root)?;
        self.check_model(&manifest)?;
        if manifest.chunk_count == 0 || k == 0 {
            return Ok(Vec::new());
        }
        if let Some(expected) = manifest.dimensions {
            if expected != embedding.len() {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                });
            }
        }

        self.ensure_loaded(&manifest).await?;
        let cache = self.cache.read().await;
        let Some(loaded) = cache.as_ref() else {
            return Ok(Vec::new());
        };

        let mut scored = loaded
            .records
            .iter()
            .map(|record| (cosine_similarity(embedding, &record.embedding), record))
            .collect::<Vec<_>>();
        scored.sort_by(|left, right| right.0.total_cmp(&left.0));

        let hits = scored
            .into_iter()
            .take(k)
            .map(|(score, record)| RetrievedChunk {
                chunk_id: record.id.clone(),
                text: record.text.clone(),
                metadata: record.metadata.clone(),
                score,
            })
            .collect::<Vec<_>>();
        debug!(k, returned = hits.len(), "knowledge index query");
        Ok(hits)
    }

    fn check_model(&self, manifest: &IndexManifest) -> Result<(), IndexError> {
        if manifest.embedding_model != self.embedder.model_name() {
            return Err(IndexError::ModelMismatch {
                indexed: manifest.embedding_model.clone(),
                configured: self.embedder.model_name().to_string(),
            });
        }
        Ok(())
    }

    /// Loads `chunks.jsonl` into memory unless the cached copy has the same generation.
    async fn ensure_loaded(&self, manifest: &IndexManifest) -> Result<(), IndexError> {
        {
            let cache = self.cache.read().await;
            if cache
                .as_ref()
                .is_some_and(|loaded| loaded.generation == manifest.generation)
            {
                return Ok(());
            }
        }

        let mut cache = self.cache.write().await;
        if cache
            .as_ref()
            .is_some_and(|loaded| loaded.generation == manifest.generation)
        {
            return Ok(());
        }

        let records = read_records(&self.root, manifest.chunk_count)?;
        info!(
            generation = %manifest.generation,
            chunks = records.len(),
            "loaded knowledge index"
        );
        *cache = Some(LoadedIndex {
            generation: manifest.generation,
            records,
        });
        Ok(())
    }

    async fn embed_chunks(&self, chunks: &[TextChunk]) -> Result<Vec<IndexRecord>, IndexError> {
        let mut records = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts = batch.iter().map(|chunk| chunk.text.clone()).collect::<Vec<_>>();
            let vectors = self.embedder.embed_batch(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(IndexError::Model(ModelError::Embedding(format!(
                    "embedding count {} doesn't match chunk count {}",
                    vectors.len(),
                    batch.len()
                ))));
            }
            records.extend(batch.iter().zip(vectors).map(|(chunk, embedding)| IndexRecord {
                id: chunk_id(chunk),
                text: chunk.text.clone(),
                metadata: chunk.metadata.clone(),
                embedding,
            }));
        }
        Ok(records)
    }
}

/// Exclusive write access to a [`KnowledgeIndex`]. Dropping the writer ends
/// any reset window it opened.
pub struct IndexWriter<'a> {
    index: &'a KnowledgeIndex,
    _guard: MutexGuard<'a, ()>,
}

impl IndexWriter<'_> {
    /// Deletes the whole index directory and recreates it empty. Queries fail
    /// with [`IndexError::Reindexing`] until `rebuild_from` completes or the
    /// writer is dropped; after that an unrebuilt index reports `Uninitialized`.
    pub async fn reset(&mut self) -> Result<(), IndexError> {
        let root = &self.index.root;
        self.index.resetting.store(true, Ordering::SeqCst);
        *self.index.cache.write().await = None;

        if root.exists() {
            fs::remove_dir_all(root).map_err(|error| IndexError::io(root, error))?;
            info!(path = %root.display(), "deleted knowledge index");
        }
        fs::create_dir_all(root).map_err(|error| IndexError::io(root, error))?;
        Ok(())
    }

    /// Replaces the index content with `chunks`. An empty slice still leaves a
    /// valid, queryable index behind.
    pub async fn rebuild_from(&mut self, chunks: &[TextChunk]) -> Result<WriteSummary, IndexError> {
        let records = dedupe(self.index.embed_chunks(chunks).await?);
        let summary = WriteSummary {
            written: records.len(),
            unchanged: 0,
            total: records.len(),
        };
        self.persist(records).await?;
        self.index.resetting.store(false, Ordering::SeqCst);
        info!(chunks = summary.total, "rebuilt knowledge index");
        Ok(summary)
    }

    /// Adds `chunks` to the existing content. Chunks already stored with the
    /// same source, page, offset and text are left alone.
    pub async fn append(&mut self, chunks: &[TextChunk]) -> Result<WriteSummary, IndexError> {
        let manifest = match read_manifest(&self.index.root) {
            Ok(manifest) => Some(manifest),
            Err(IndexError::Missing(_)) | Err(IndexError::Uninitialized(_)) => None,
            Err(error) => return Err(error),
        };

        let mut existing = match &manifest {
            Some(manifest) => {
                self.index.check_model(manifest)?;
                self.index.ensure_loaded(manifest).await?;
                self.index
                    .cache
                    .read()
                    .await
                    .as_ref()
                    .map(|loaded| loaded.records.clone())
                    .unwrap_or_default()
            }
            None => Vec::new(),
        };

        if chunks.is_empty() && manifest.is_some() {
            return Ok(WriteSummary {
                total: existing.len(),
                ..WriteSummary::default()
            });
        }

        let known = existing
            .iter()
            .map(|record| record.id.clone())
            .collect::<HashSet<_>>();
        let fresh = chunks
            .iter()
            .filter(|chunk| !known.contains(&chunk_id(chunk)))
            .cloned()
            .collect::<Vec<_>>();
        let records = dedupe(self.index.embed_chunks(&fresh).await?);

        if let (Some(expected), Some(first)) = (
            manifest.as_ref().and_then(|manifest| manifest.dimensions),
            records.first(),
        ) {
            if first.embedding.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: first.embedding.len(),
                });
            }
        }

        let summary = WriteSummary {
            written: records.len(),
            unchanged: chunks.len() - fresh.len(),
            total: existing.len() + records.len(),
        };
        if records.is_empty() && manifest.is_some() {
            return Ok(summary);
        }

        existing.extend(records);
        self.persist(existing).await?;
        info!(
            written = summary.written,
            unchanged = summary.unchanged,
            total = summary.total,
            "appended to knowledge index"
        );
        Ok(summary)
    }

    async fn persist(&mut self, records: Vec<IndexRecord>) -> Result<(), IndexError> {
        let root = &self.index.root;
        fs::create_dir_all(root).map_err(|error| IndexError::io(root, error))?;

        let dimensions = records
            .first()
            .map(|record| record.embedding.len())
            .or_else(|| self.index.embedder.dimensions());
        let manifest = IndexManifest {
            format_version: FORMAT_VERSION,
            embedding_model: self.index.embedder.model_name().to_string(),
            dimensions,
            chunk_count: records.len(),
            generation: Uuid::new_v4(),
            updated_at: Utc::now(),
        };

        write_atomically(&root.join(CHUNKS_FILE), |writer| {
            for record in &records {
                serde_json::to_writer(&mut *writer, record)?;
                writer.write_all(b"\n")?;
            }
            Ok(())
        })?;
        write_atomically(&root.join(MANIFEST_FILE), |writer| {
            serde_json::to_writer_pretty(&mut *writer, &manifest)?;
            writer.write_all(b"\n")
        })?;
        sync_dir(root);

        *self.index.cache.write().await = Some(LoadedIndex {
            generation: manifest.generation,
            records,
        });
        Ok(())
    }
}

impl Drop for IndexWriter<'_> {
    fn drop(&mut self) {
        self.index.resetting.store(false, Ordering::SeqCst);
    }
}

fn chunk_id(chunk: &TextChunk) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chunk.metadata.source.as_deref().unwrap_or_default().as_bytes());
    hasher.update(chunk.metadata.page.map(i64::from).unwrap_or(-1).to_le_bytes());
    hasher.update((chunk.start_index as u64).to_le_bytes());
    hasher.update(chunk.text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn dedupe(records: Vec<IndexRecord>) -> Vec<IndexRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.id.clone()))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

fn read_manifest(root: &Path) -> Result<IndexManifest, IndexError> {
    if !root.is_dir() {
        return Err(IndexError::Missing(root.to_path_buf()));
    }
    let path = root.join(MANIFEST_FILE);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(IndexError::Uninitialized(root.to_path_buf()));
        }
        Err(error) => return Err(IndexError::io(&path, error)),
    };
    let manifest: IndexManifest =
        serde_json::from_slice(&raw).map_err(|error| IndexError::Corrupt {
            path: path.clone(),
            details: error.to_string(),
        })?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(IndexError::Corrupt {
            path,
            details: format!("unsupported format version {}", manifest.format_version),
        });
    }
    Ok(manifest)
}

fn read_records(root: &Path, expected: usize) -> Result<Vec<IndexRecord>, IndexError> {
    let path = root.join(CHUNKS_FILE);
    let corrupt = |details: String| IndexError::Corrupt {
        path: path.clone(),
        details,
    };

    let file = match fs::File::open(&path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound && expected == 0 => {
            return Ok(Vec::new());
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(corrupt(format!("manifest lists {expected} chunks but {CHUNKS_FILE} is missing")));
        }
        Err(error) => return Err(IndexError::io(&path, error)),
    };

    let mut records = Vec::with_capacity(expected);
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|error| IndexError::io(&path, error))?;
        if line.trim().is_empty() {
            continue;
        }
        if records.len() == expected {
            warn!(path = %path.display(), "ignoring records beyond the manifest chunk count");
            break;
        }
        let record = serde_json::from_str::<IndexRecord>(&line)
            .map_err(|error| corrupt(format!("line {}: {error}", line_no + 1)))?;
        records.push(record);
    }

    if records.len() < expected {
        return Err(corrupt(format!(
            "manifest lists {expected} chunks but only {} were found",
            records.len()
        )));
    }
    Ok(records)
}

fn write_atomically(
    path: &Path,
    write: impl FnOnce(&mut BufWriter<fs::File>) -> std::io::Result<()>,
) -> Result<(), IndexError> {
    let tmp = path.with_extension("tmp");
    let file = fs::File::create(&tmp).map_err(|error| IndexError::io(&tmp, error))?;
    let mut writer = BufWriter::new(file);
    write(&mut writer).map_err(|error| IndexError::io(&tmp, error))?;
    let file = writer
        .into_inner()
        .map_err(|error| IndexError::io(&tmp, error.into_error()))?;
    file.sync_all().map_err(|error| IndexError::io(&tmp, error))?;
    fs::rename(&tmp, path).map_err(|error| IndexError::io(path, error))?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(error) = fs::File::open(dir).and_then(|handle| handle.sync_all()) {
        warn!(path = %dir.display(), %error, "could not sync index directory");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use tempfile::tempdir;

    fn chunk(text: &str, source: &str, page: u32) -> TextChunk {
        TextChunk {
            text: text.to_string(),
            metadata: ChunkMetadata {
                source: Some(source.to_string()),
                page: Some(page),
            },
            start_index: 0,
        }
    }

    fn ngram_index(root: &Path) -> KnowledgeIndex {
        KnowledgeIndex::new(root, Arc::new(CharacterNgramEmbedder::default()))
    }

    #[tokio::test]
    async fn missing_directory_is_reported_as_missing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = ngram_index(&dir.path().join("chroma_db"));

        assert_eq!(index.status()?, IndexStatus::Missing);
        assert!(matches!(index.query(&[0.0; 128], 4).await, Err(IndexError::Missing(_))));
        Ok(())
    }

    #[tokio::test]
    async fn empty_rebuild_is_queryable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = ngram_index(&dir.path().join("chroma_db"));

        let summary = index.rebuild_from(&[]).await?;

        assert_eq!(summary.total, 0);
        assert!(matches!(index.status()?, IndexStatus::Ready(manifest) if manifest.chunk_count == 0));
        assert!(index.query(&[0.1; 128], 4).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn query_ranks_by_similarity_and_respects_k() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = ngram_index(dir.path());
        index
            .rebuild_from(&[
                chunk("ibuprofen dosage for adults is 400mg", "a.pdf", 0),
                chunk("store the tablets in a dry place", "b.pdf", 2),
                chunk("paracetamol should not exceed 4g per day", "c.pdf", 5),
            ])
            .await?;

        let query = index.embedder().embed("ibuprofen dosage for adults").await?;
        let hits = index.query(&query, 2).await?;

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata.source.as_deref(), Some("a.pdf"));
        assert!(hits[0].score >= hits[1].score);
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_counts_nothing_as_unchanged() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = ngram_index(dir.path());
        index.rebuild_from(&[chunk("repeated", "a.pdf", 0)]).await?;

        let summary = index
            .rebuild_from(&[chunk("repeated", "a.pdf", 0), chunk("repeated", "a.pdf", 0)])
            .await?;

        assert_eq!(summary, WriteSummary { written: 1, unchanged: 0, total: 1 });
        Ok(())
    }

    #[tokio::test]
    async fn content_survives_reopening() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        ngram_index(dir.path())
            .rebuild_from(&[chunk("persisted knowledge", "a.pdf", 1)])
            .await?;

        let reopened = ngram_index(dir.path());
        let query = reopened.embedder().embed("persisted knowledge").await?;
        let hits = reopened.query(&query, 4).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.page, Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn append_keeps_prior_content_and_skips_known_chunks() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = ngram_index(dir.path());
        index.rebuild_from(&[chunk("first", "a.pdf", 0)]).await?;

        let summary = index
            .append(&[chunk("first", "a.pdf", 0), chunk("second", "b.pdf", 0)])
            .await?;

        assert_eq!(summary, WriteSummary { written: 1, unchanged: 1, total: 2 });
        assert!(matches!(index.status()?, IndexStatus::Ready(manifest) if manifest.chunk_count == 2));
        Ok(())
    }

    #[tokio::test]
    async fn append_to_missing_index_initializes_it() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = ngram_index(&dir.path().join("fresh"));
        let summary = index.append(&[chunk("only", "a.pdf", 0)]).await?;
        assert_eq!(summary.total, 1);
        assert!(matches!(index.status()?, IndexStatus::Ready(_)));
        Ok(())
    }

    #[tokio::test]
    async fn reset_leaves_an_uninitialized_index_until_rebuilt() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let index = ngram_index(dir.path());
        index.rebuild_from(&[chunk("old", "a.pdf", 0)]).await?;

        {
            let mut writer = index.writer().await;
            writer.reset().await?;
            assert!(matches!(index.query(&[0.0; 128], 4).await, Err(IndexError::Reindexing)));
        }

        assert_eq!(index.status()?, IndexStatus::Uninitialized);
        assert!(matches!(index.query(&[0.0; 128], 4).await, Err(IndexError::Uninitialized(_))));
        Ok(())
    }

    #[tokio::test]
    async fn other_embedding_model_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        ngram_index(dir.path()).rebuild_from(&[chunk("text", "a.pdf", 0)]).await?;

        let other = KnowledgeIndex::new(dir.path(), Arc::new(CharacterNgramEmbedder::new(64)));
        assert!(matches!(
            other.query(&[0.0; 64], 4).await,
            Err(IndexError::ModelMismatch { .. })
        ));
        assert!(matches!(
            other.append(&[chunk("more", "b.pdf", 0)]).await,
            Err(IndexError::ModelMismatch { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn garbage_manifest_is_reported_as_corrupt() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join(MANIFEST_FILE), b"{ not json")?;
        let index = ngram_index(dir.path());
        assert!(matches!(index.query(&[0.0; 128], 4).await, Err(IndexError::Corrupt { .. })));
        Ok(())
    }
}
