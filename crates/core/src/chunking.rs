use crate::config::{self, ChunkingConfig};
use crate::error::IngestError;
use crate::models::{PageDocument, TextChunk};
use regex::Regex;
use std::collections::VecDeque;
use tracing::warn;

/// Paragraph, line, word, then single characters.
pub const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone)]
enum Separator {
    Pattern(Regex),
    Characters,
}

impl Separator {
    fn matches(&self, text: &str) -> bool {
        match self {
            Self::Pattern(pattern) => pattern.is_match(text),
            Self::Characters => true,
        }
    }

    /// Splits `text` keeping each separator at the start of the piece that follows it.
    fn split<'t>(&self, text: &'t str) -> Vec<&'t str> {
        match self {
            Self::Characters => text
                .char_indices()
                .map(|(start, ch)| &text[start..start + ch.len_utf8()])
                .collect(),
            Self::Pattern(pattern) => {
                let mut pieces = Vec::new();
                let mut cursor = 0;
                for found in pattern.find_iter(text) {
                    if found.start() > cursor {
                        pieces.push(&text[cursor..found.start()]);
                    }
                    cursor = found.start();
                }
                if cursor < text.len() {
                    pieces.push(&text[cursor..]);
                }
                pieces.retain(|piece| !piece.is_empty());
                pieces
            }
        }
    }
}

/// Splits text into overlapping chunks, preferring the earliest separator in the
/// list that occurs in the text and recursing with the remaining separators for
/// pieces that are still too long. Lengths are measured in characters.
#[derive(Debug, Clone)]
pub struct RecursiveCharacterSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<Separator>,
}

impl Default for RecursiveCharacterSplitter {
    fn default() -> Self {
        Self {
            chunk_size: config::DEFAULT_CHUNK_SIZE,
            chunk_overlap: config::DEFAULT_CHUNK_OVERLAP,
            separators: DEFAULT_SEPARATORS.iter().map(|sep| literal(sep)).collect(),
        }
    }
}

fn literal(separator: &str) -> Separator {
    if separator.is_empty() {
        Separator::Characters
    } else {
        // An escaped literal is always a valid pattern.
        match Regex::new(&regex::escape(separator)) {
            Ok(pattern) => Separator::Pattern(pattern),
            Err(_) => Separator::Characters,
        }
    }
}

impl RecursiveCharacterSplitter {
    pub fn new(config: &ChunkingConfig) -> Result<Self, IngestError> {
        Self::with_separators(config, &DEFAULT_SEPARATORS)
    }

    pub fn with_separators(config: &ChunkingConfig, separators: &[&str]) -> Result<Self, IngestError> {
        if config.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk size must be positive".to_string(),
            ));
        }
        if config.chunk_overlap >= config.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than chunk size {}",
                config.chunk_overlap, config.chunk_size
            )));
        }
        if separators.is_empty() {
            return Err(IngestError::InvalidChunkConfig(
                "at least one separator is required".to_string(),
            ));
        }

        let separators = separators
            .iter()
            .map(|separator| {
                if separator.is_empty() {
                    Ok(Separator::Characters)
                } else {
                    Ok(Separator::Pattern(Regex::new(&regex::escape(separator))?))
                }
            })
            .collect::<Result<Vec<_>, IngestError>>()?;

        Ok(Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            separators,
        })
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &self.separators)
    }

    /// Splits every page separately; chunks inherit their page's metadata.
    pub fn split_documents(&self, pages: &[PageDocument]) -> Vec<TextChunk> {
        let mut chunks = Vec::new();
        for page in pages {
            let mut index = 0usize;
            let mut previous_len = 0usize;
            for text in self.split_text(&page.text) {
                let search_from = (index + previous_len).saturating_sub(self.chunk_overlap);
                index = find_char_offset(&page.text, &text, search_from)
                    .or_else(|| find_char_offset(&page.text, &text, 0))
                    .unwrap_or(search_from);
                previous_len = char_len(&text);
                chunks.push(TextChunk {
                    text,
                    metadata: page.metadata.clone(),
                    start_index: index,
                });
            }
        }
        chunks
    }

    fn split_recursive(&self, text: &str, separators: &[Separator]) -> Vec<String> {
        let (separator, remaining) = match separators
            .iter()
            .position(|separator| separator.matches(text))
        {
            Some(position) => (&separators[position], &separators[position + 1..]),
            None => match separators.last() {
                Some(last) => (last, &separators[separators.len()..]),
                None => return vec![text.to_string()],
            },
        };

        let mut final_chunks = Vec::new();
        let mut good_splits: Vec<&str> = Vec::new();

        for piece in separator.split(text) {
            if char_len(piece) < self.chunk_size {
                good_splits.push(piece);
                continue;
            }

            if !good_splits.is_empty() {
                final_chunks.extend(self.merge_splits(&good_splits));
                good_splits.clear();
            }

            if remaining.is_empty() {
                final_chunks.push(piece.to_string());
            } else {
                final_chunks.extend(self.split_recursive(piece, remaining));
            }
        }

        if !good_splits.is_empty() {
            final_chunks.extend(self.merge_splits(&good_splits));
        }

        final_chunks
    }

    /// Greedily packs pieces into chunks of at most `chunk_size` characters and
    /// carries up to `chunk_overlap` characters of trailing pieces into the next one.
    fn merge_splits(&self, splits: &[&str]) -> Vec<String> {
        let mut docs = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for split in splits {
            let len = char_len(split);

            if total + len > self.chunk_size {
                if total > self.chunk_size {
                    warn!(
                        chunk_len = total,
                        chunk_size = self.chunk_size,
                        "created a chunk longer than the configured size"
                    );
                }

                if !current.is_empty() {
                    if let Some(doc) = join_pieces(&current) {
                        docs.push(doc);
                    }

                    while total > self.chunk_overlap || (total + len > self.chunk_size && total > 0) {
                        match current.pop_front() {
                            Some(front) => total -= char_len(front),
                            None => break,
                        }
                    }
                }
            }

            current.push_back(split);
            total += len;
        }

        if let Some(doc) = join_pieces(&current) {
            docs.push(doc);
        }

        docs
    }
}

fn join_pieces(pieces: &VecDeque<&str>) -> Option<String> {
    let joined = pieces.iter().copied().collect::<String>();
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn find_char_offset(haystack: &str, needle: &str, from_char: usize) -> Option<usize> {
    let from_byte = haystack
        .char_indices()
        .nth(from_char)
        .map(|(byte, _)| byte)
        .unwrap_or(haystack.len());
    haystack[from_byte..]
        .find(needle)
        .map(|byte| char_len(&haystack[..from_byte + byte]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn char_slice(text: &str, start: usize, end: usize) -> String {
        text.chars().skip(start).take(end - start).collect()
    }

    #[test]
    fn unbroken_text_falls_back_to_hard_character_cuts() {
        let splitter = RecursiveCharacterSplitter::default();
        let text = "a".repeat(2_500);

        let chunks = splitter.split_documents(&[PageDocument {
            text: text.clone(),
            metadata: ChunkMetadata::default(),
        }]);

        let lengths = chunks.iter().map(|chunk| char_len(&chunk.text)).collect::<Vec<_>>();
        let starts = chunks.iter().map(|chunk| chunk.start_index).collect::<Vec<_>>();
        assert_eq!(lengths, vec![1_000, 1_000, 900]);
        assert_eq!(starts, vec![0, 800, 1_600]);
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let splitter = RecursiveCharacterSplitter::default();
        let chunks = splitter.split_text("  Ibuprofen 400mg every 8 hours.  ");
        assert_eq!(chunks, vec!["Ibuprofen 400mg every 8 hours.".to_string()]);
    }

    #[test]
    fn paragraphs_are_preferred_over_words() {
        let splitter = RecursiveCharacterSplitter::default();
        let first = "alpha ".repeat(100);
        let second = "omega ".repeat(100);
        let text = format!("{}\n\n{}", first.trim(), second.trim());

        let chunks = splitter.split_text(&text);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], first.trim());
        assert_eq!(chunks[1], second.trim());
    }

    #[test]
    fn overlapping_chunks_reconstruct_the_page() {
        let splitter = RecursiveCharacterSplitter::default();
        let text = (0..300)
            .map(|index| format!("token{index:04}"))
            .collect::<Vec<_>>()
            .join(" ");
        let total = char_len(&text);

        let chunks = splitter.split_documents(&[PageDocument {
            text: text.clone(),
            metadata: ChunkMetadata::default(),
        }]);
        assert!(chunks.len() > 2);

        let mut rebuilt = String::new();
        let mut covered_until = 0usize;
        for chunk in &chunks {
            let len = char_len(&chunk.text);
            assert!(len <= 1_000);
            assert_eq!(char_slice(&text, chunk.start_index, chunk.start_index + len), chunk.text);
            if covered_until > 0 {
                assert!(chunk.start_index < covered_until, "consecutive chunks must overlap");
            }
            let end = chunk.start_index + len;
            rebuilt.push_str(&char_slice(&text, covered_until.max(chunk.start_index), end));
            covered_until = end;
        }

        assert_eq!(chunks[0].start_index, 0);
        assert_eq!(covered_until, total);
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn chunks_inherit_page_metadata() {
        let splitter = RecursiveCharacterSplitter::default();
        let metadata = ChunkMetadata {
            source: Some("source-pdfs/a.pdf".to_string()),
            page: Some(3),
        };
        let pages = vec![
            PageDocument {
                text: "Dosage information".to_string(),
                metadata: metadata.clone(),
            },
            PageDocument {
                text: "   ".to_string(),
                metadata: ChunkMetadata::default(),
            },
        ];

        let chunks = splitter.split_documents(&pages);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata, metadata);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let config = ChunkingConfig {
            chunk_size: 100,
            chunk_overlap: 100,
        };
        assert!(matches!(
            RecursiveCharacterSplitter::new(&config),
            Err(IngestError::InvalidChunkConfig(_))
        ));
    }
}
