use crate::error::IngestError;
use crate::models::{ChunkMetadata, PageDocument};
use lopdf::Document;
use std::path::Path;

pub trait PdfExtractor: Send + Sync {
    /// Returns one record per page that carries text, with zero-based page numbers.
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageDocument>, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageDocument>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;
        let source = path.to_string_lossy().to_string();

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageDocument {
                    text,
                    metadata: ChunkMetadata {
                        source: Some(source.clone()),
                        page: Some(page_no.saturating_sub(1)),
                    },
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

pub fn extract_page_texts(path: &Path) -> Result<Vec<PageDocument>, IngestError> {
    LopdfExtractor.extract_pages(path)
}
