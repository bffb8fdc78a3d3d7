//! Administrative workflow: source file management and the two training actions.
//!
//! Every method reports its outcome as [`Notice`]s and never returns an error;
//! failures are surfaced to the user and the workflow stays usable.

use crate::error::{IngestError, StoreError};
use crate::file_store::FileStore;
use crate::ingest::{IngestOutcome, IngestionReport};
use crate::models::Notice;
use crate::traits::KnowledgeIngestor;
use std::sync::Arc;
use tracing::{error, info};

const RETRAIN_REMINDER: &str =
    "after uploading, deleting or resetting, train the system so the knowledge base reflects the change";

/// Per-session interaction state. Lives only as long as the interactive session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AdminSession {
    confirm_reset_active: bool,
}

impl AdminSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_armed(&self) -> bool {
        self.confirm_reset_active
    }
}

pub struct AdminWorkflow {
    files: Arc<FileStore>,
    ingestor: Arc<dyn KnowledgeIngestor>,
}

impl AdminWorkflow {
    pub fn new(files: Arc<FileStore>, ingestor: Arc<dyn KnowledgeIngestor>) -> Self {
        Self { files, ingestor }
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    /// Stores each `(name, bytes)` pair, replacing same-named files.
    pub fn upload_files(&self, uploads: &[(String, Vec<u8>)]) -> Vec<Notice> {
        let mut notices = Vec::new();
        for (name, bytes) in uploads {
            match self.files.upload(name, bytes) {
                Ok(outcome) => {
                    if outcome.replaced {
                        notices.push(Notice::warning(format!(
                            "file '{name}' already existed and was replaced"
                        )));
                    }
                    notices.push(Notice::success(format!("file '{name}' uploaded")));
                }
                Err(error) => notices.push(store_failure("upload", name, &error)),
            }
        }
        if !uploads.is_empty() {
            self.files.invalidate_listing();
            notices.push(Notice::info(RETRAIN_REMINDER));
        }
        notices
    }

    pub fn list_files(&self) -> Result<Vec<String>, Notice> {
        self.files.list().map_err(|error| {
            error!(%error, "listing source files failed");
            Notice::error(format!("could not list source files: {error}"))
        })
    }

    pub fn delete_file(&self, name: &str) -> Vec<Notice> {
        let result = self.files.delete(name);
        self.files.invalidate_listing();
        match result {
            Ok(()) => vec![
                Notice::success(format!("'{name}' deleted")),
                Notice::info(RETRAIN_REMINDER),
            ],
            Err(error) => vec![store_failure("delete", name, &error)],
        }
    }

    /// "Train with current data": indexes current files on top of existing knowledge.
    pub async fn train(&self) -> Vec<Notice> {
        let result = self.ingestor.ingest(false).await;
        self.files.invalidate_listing();
        ingestion_notices(result)
    }

    /// First step of "reset all knowledge": arms the confirmation.
    pub fn request_reset(&self, session: &mut AdminSession) -> Vec<Notice> {
        session.confirm_reset_active = true;
        info!("knowledge reset armed");
        vec![Notice::warning(
            "are you sure? this deletes all current knowledge; confirm or cancel",
        )]
    }

    /// Second step: performs the full reset and reindex, then disarms.
    pub async fn confirm_reset(&self, session: &mut AdminSession) -> Vec<Notice> {
        if !session.confirm_reset_active {
            return vec![Notice::info("no reset is pending; request a reset first")];
        }
        session.confirm_reset_active = false;

        let result = self.ingestor.ingest(true).await;
        self.files.invalidate_listing();
        let succeeded = result.is_ok();
        let mut notices = ingestion_notices(result);
        if succeeded {
            notices.push(Notice::success("system knowledge reset and retrained"));
        }
        notices
    }

    pub fn cancel_reset(&self, session: &mut AdminSession) -> Vec<Notice> {
        let was_armed = session.confirm_reset_active;
        session.confirm_reset_active = false;
        if was_armed {
            info!("knowledge reset cancelled");
            vec![Notice::info("reset cancelled")]
        } else {
            vec![Notice::info("no reset is pending")]
        }
    }
}

fn store_failure(action: &str, name: &str, error: &StoreError) -> Notice {
    error!(action, file = %name, %error, "source file action failed");
    match error {
        StoreError::NotFound(_) => Notice::error(format!("could not {action} '{name}': file not found")),
        other => Notice::error(format!("could not {action} '{name}': {other}")),
    }
}

fn ingestion_notices(result: Result<IngestionReport, IngestError>) -> Vec<Notice> {
    let report = match result {
        Ok(report) => report,
        Err(error) => {
            error!(%error, "ingestion failed");
            let mut notices = vec![Notice::error(format!("knowledge base update failed: {error}"))];
            if let Some(hint) = error.hint() {
                notices.push(Notice::warning(hint));
            }
            return notices;
        }
    };

    let mut notices = report
        .skipped_files
        .iter()
        .map(|skipped| {
            let name = skipped
                .path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| skipped.path.display().to_string());
            Notice::warning(format!("could not load PDF '{name}': {}", skipped.reason))
        })
        .collect::<Vec<_>>();

    match report.outcome {
        IngestOutcome::Indexed => notices.push(Notice::success(format!(
            "knowledge base updated with {} text chunks",
            report.chunk_count
        ))),
        IngestOutcome::EmptyIndexCreated | IngestOutcome::NothingToIndex => notices.push(
            Notice::warning("no valid PDF documents found to index; add PDFs to get started"),
        ),
    }
    notices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::WriteSummary;
    use crate::models::NoticeLevel;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingIngestor {
        calls: Mutex<Vec<bool>>,
        fail: bool,
    }

    impl RecordingIngestor {
        fn calls(&self) -> Vec<bool> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl KnowledgeIngestor for RecordingIngestor {
        async fn ingest(&self, reset: bool) -> Result<IngestionReport, IngestError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(reset);
            }
            if self.fail {
                return Err(IngestError::PdfParse("boom".to_string()));
            }
            Ok(IngestionReport {
                reset,
                outcome: IngestOutcome::Indexed,
                files_loaded: 1,
                pages_loaded: 1,
                chunk_count: 3,
                index: WriteSummary {
                    written: 3,
                    unchanged: 0,
                    total: 3,
                },
                skipped_files: Vec::new(),
            })
        }
    }

    fn workflow(
        dir: &std::path::Path,
        ingestor: Arc<RecordingIngestor>,
    ) -> Result<AdminWorkflow, Box<dyn std::error::Error>> {
        let files = Arc::new(FileStore::open(dir, Duration::from_secs(300))?);
        Ok(AdminWorkflow::new(files, ingestor))
    }

    fn has_level(notices: &[Notice], level: NoticeLevel) -> bool {
        notices.iter().any(|notice| notice.level == level)
    }

    #[tokio::test]
    async fn arming_alone_does_not_reset() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let ingestor = Arc::new(RecordingIngestor::default());
        let admin = workflow(dir.path(), ingestor.clone())?;
        let mut session = AdminSession::new();

        let notices = admin.request_reset(&mut session);

        assert!(session.reset_armed());
        assert!(has_level(&notices, NoticeLevel::Warning));
        assert!(ingestor.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn cancel_disarms_without_resetting_and_can_rearm() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let ingestor = Arc::new(RecordingIngestor::default());
        let admin = workflow(dir.path(), ingestor.clone())?;
        let mut session = AdminSession::new();

        admin.request_reset(&mut session);
        admin.cancel_reset(&mut session);
        assert!(!session.reset_armed());
        assert!(ingestor.calls().is_empty());

        admin.request_reset(&mut session);
        assert!(session.reset_armed());
        Ok(())
    }

    #[tokio::test]
    async fn confirm_resets_exactly_once() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let ingestor = Arc::new(RecordingIngestor::default());
        let admin = workflow(dir.path(), ingestor.clone())?;
        let mut session = AdminSession::new();

        admin.request_reset(&mut session);
        let notices = admin.confirm_reset(&mut session).await;
        let again = admin.confirm_reset(&mut session).await;

        assert_eq!(ingestor.calls(), vec![true]);
        assert!(!session.reset_armed());
        assert!(has_level(&notices, NoticeLevel::Success));
        assert!(!has_level(&again, NoticeLevel::Success));
        Ok(())
    }

    #[tokio::test]
    async fn failed_reset_is_reported_and_disarmed() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let ingestor = Arc::new(RecordingIngestor {
            fail: true,
            ..RecordingIngestor::default()
        });
        let admin = workflow(dir.path(), ingestor.clone())?;
        let mut session = AdminSession::new();

        admin.request_reset(&mut session);
        let notices = admin.confirm_reset(&mut session).await;

        assert!(has_level(&notices, NoticeLevel::Error));
        assert!(!has_level(&notices, NoticeLevel::Success));
        assert!(!session.reset_armed());
        Ok(())
    }

    #[tokio::test]
    async fn train_appends_without_reset() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let ingestor = Arc::new(RecordingIngestor::default());
        let admin = workflow(dir.path(), ingestor.clone())?;

        let notices = admin.train().await;

        assert_eq!(ingestor.calls(), vec![false]);
        assert!(notices.iter().any(|notice| notice.message.contains("3 text chunks")));
        Ok(())
    }

    #[test]
    fn upload_and_delete_refresh_the_listing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let admin = workflow(dir.path(), Arc::new(RecordingIngestor::default()))?;
        assert!(admin.list_files().map_err(|notice| notice.message)?.is_empty());

        let notices = admin.upload_files(&[("guide.pdf".to_string(), b"%PDF".to_vec())]);
        assert!(has_level(&notices, NoticeLevel::Success));
        assert_eq!(admin.list_files().map_err(|notice| notice.message)?, vec!["guide.pdf"]);

        let replaced = admin.upload_files(&[("guide.pdf".to_string(), b"%PDF".to_vec())]);
        assert!(has_level(&replaced, NoticeLevel::Warning));

        admin.delete_file("guide.pdf");
        assert!(admin.list_files().map_err(|notice| notice.message)?.is_empty());

        let missing = admin.delete_file("guide.pdf");
        assert!(has_level(&missing, NoticeLevel::Error));
        Ok(())
    }
}
