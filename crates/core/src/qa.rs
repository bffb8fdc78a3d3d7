use crate::error::{ModelError, QueryError};
use crate::index::KnowledgeIndex;
use crate::models::{Answer, Notice, RetrievedChunk, SourceCitation};
use crate::traits::LanguageModel;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) const EMPTY_QUESTION_NOTICE: &str = "please enter a question";

const PROMPT_PREAMBLE: &str = "Use the following pieces of context to answer the question at the end. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.";

/// Puts every retrieved chunk and the question into a single prompt.
pub fn stuff_prompt(chunks: &[RetrievedChunk], question: &str) -> String {
    let context = chunks
        .iter()
        .map(|chunk| chunk.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{PROMPT_PREAMBLE}\n\n{context}\n\nQuestion: {question}\nHelpful Answer:")
}

pub struct RetrievalQa {
    index: Arc<KnowledgeIndex>,
    llm: Arc<dyn LanguageModel>,
    top_k: usize,
    timeout: Option<Duration>,
}

impl RetrievalQa {
    pub fn new(index: Arc<KnowledgeIndex>, llm: Arc<dyn LanguageModel>, top_k: usize) -> Self {
        Self {
            index,
            llm,
            top_k: top_k.max(1),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Embeds the question with the index's own embedder, retrieves the top
    /// `k` chunks and asks the language model once with all of them.
    pub async fn answer(&self, question: &str) -> Result<Answer, QueryError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(QueryError::EmptyQuestion);
        }

        let embedding = self.index.embedder().embed(question).await?;
        let chunks = self.index.query(&embedding, self.top_k).await?;
        debug!(retrieved = chunks.len(), "retrieved context for question");

        let prompt = stuff_prompt(&chunks, question);
        let text = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.llm.generate(&prompt))
                .await
                .map_err(|_| ModelError::Timeout {
                    service: self.llm.model_name().to_string(),
                    seconds: limit.as_secs(),
                })??,
            None => self.llm.generate(&prompt).await?,
        };

        let sources = chunks
            .iter()
            .map(|chunk| SourceCitation::from_metadata(&chunk.metadata))
            .collect::<Vec<_>>();
        info!(
            model = %self.llm.model_name(),
            sources = sources.len(),
            "answered question"
        );

        Ok(Answer {
            text: text.trim().to_string(),
            sources,
        })
    }
}

/// Numbered citation lines, e.g. `1. File: leaflet.pdf, Page: 2`.
pub fn format_sources(sources: &[SourceCitation]) -> Vec<String> {
    sources
        .iter()
        .enumerate()
        .map(|(position, source)| format!("{}. {source}", position + 1))
        .collect()
}

/// Query boundary used by the interactive surfaces: errors become notices.
pub async fn respond(qa: &RetrievalQa, question: &str) -> (Option<Answer>, Vec<Notice>) {
    match qa.answer(question).await {
        Ok(answer) => {
            let notices = if answer.sources.is_empty() {
                vec![Notice::info("no specific source found for this answer")]
            } else {
                Vec::new()
            };
            (Some(answer), notices)
        }
        Err(QueryError::EmptyQuestion) => (None, vec![Notice::warning(EMPTY_QUESTION_NOTICE)]),
        Err(error) => {
            warn!(%error, "question could not be answered");
            let mut notices = vec![Notice::error(format!("could not answer: {error}"))];
            if let Some(hint) = error.hint() {
                notices.push(Notice::info(hint));
            }
            (None, notices)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::embeddings::{CharacterNgramEmbedder, Embedder};
    use crate::error::ModelError;
    use crate::traits::LanguageModel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Returns a fixed reply and records every prompt it receives.
    #[derive(Default)]
    pub(crate) struct RecordingModel {
        pub(crate) reply: String,
        pub(crate) delay: Option<Duration>,
        pub(crate) prompts: Mutex<Vec<String>>,
    }

    impl RecordingModel {
        pub(crate) fn replying(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                ..Self::default()
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.prompts.lock().map(|prompts| prompts.len()).unwrap_or(0)
        }
    }

    #[async_trait]
    impl LanguageModel for RecordingModel {
        fn model_name(&self) -> &str {
            "recording"
        }

        async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(prompt.to_string());
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.reply.clone())
        }
    }

    /// Character n-gram embedder that counts calls.
    #[derive(Default)]
    pub(crate) struct CountingEmbedder {
        inner: CharacterNgramEmbedder,
        pub(crate) calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }

        fn dimensions(&self) -> Option<usize> {
            self.inner.dimensions()
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }
    }
}
