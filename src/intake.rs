//! Upload handling: the collaborator that feeds archives into the store.
//!
//! Mirrors what an upload endpoint does: reject unknown archive types up
//! front, create the job, write the bytes into the job directory and only
//! then mark the job `uploaded` so a worker can claim it.

use std::path::Path;
use std::sync::Arc;

use crate::error::{BuildbotError, JobError};
use crate::extract::ArchiveExtractor;
use crate::state_machine::{Job, JobState, extension_of};
use crate::store::JobStore;

pub struct Intake {
    store: Arc<JobStore>,
    extractor: ArchiveExtractor,
}

impl Intake {
    pub fn new(store: Arc<JobStore>, extractor: ArchiveExtractor) -> Self {
        Self { store, extractor }
    }

    /// Submits the archive at `source`, copying it into a fresh job.
    pub async fn submit_file(&self, source: &Path) -> Result<Job, BuildbotError> {
        let extension = extension_of(source).unwrap_or_default();
        self.extractor.check_extension(&extension)?;

        let job = self.store.create(&extension)?;
        tokio::fs::copy(source, job.archive_path()).await?;
        self.mark_uploaded(job)
    }

    fn mark_uploaded(&self, job: Job) -> Result<Job, BuildbotError> {
        self.store.transition(&job.name, JobState::Uploaded)?;
        tracing::info!(job = %job.name, archive = %job.archive_path().display(), "Archive uploaded");
        Ok(self.store.get(&job.name)?)
    }
}

/// Whether `err` means the upload was rejected for its archive type.
pub fn is_unsupported(err: &BuildbotError) -> bool {
    matches!(err, BuildbotError::Job(JobError::UnsupportedFormat { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractLimits;

    fn intake(root: &Path) -> (Arc<JobStore>, Intake) {
        let store = Arc::new(JobStore::new(root).unwrap());
        let extractor = ArchiveExtractor::new(
            &["zip".to_string()],
            ExtractLimits {
                max_total_bytes: 1024,
                max_entries: 8,
            },
        );
        (Arc::clone(&store), Intake::new(store, extractor))
    }

    #[tokio::test]
    async fn submit_file_copies_archive_and_marks_uploaded() {
        let base = tempfile::tempdir().unwrap();
        let source = base.path().join("hw1.ZIP");
        std::fs::write(&source, b"PK fake").unwrap();
        let (_store, intake) = intake(&base.path().join("jobs"));

        let job = intake.submit_file(&source).await.unwrap();
        assert_eq!(job.state, JobState::Uploaded);
        assert_eq!(job.archive_extension, "zip");
        assert_eq!(std::fs::read(job.archive_path()).unwrap(), b"PK fake");
    }

    #[tokio::test]
    async fn disallowed_extension_creates_no_job() {
        let base = tempfile::tempdir().unwrap();
        let source = base.path().join("hw1.rar");
        std::fs::write(&source, b"Rar!").unwrap();
        let (store, intake) = intake(&base.path().join("jobs"));

        let err = intake.submit_file(&source).await.unwrap_err();
        assert!(is_unsupported(&err));
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn missing_extension_is_unsupported() {
        let base = tempfile::tempdir().unwrap();
        let source = base.path().join("archive");
        std::fs::write(&source, b"data").unwrap();
        let (_store, intake) = intake(&base.path().join("jobs"));

        assert!(is_unsupported(&intake.submit_file(&source).await.unwrap_err()));
    }

    #[tokio::test]
    async fn failed_copy_leaves_job_uploading() {
        let base = tempfile::tempdir().unwrap();
        let (store, intake) = intake(&base.path().join("jobs"));

        let err = intake
            .submit_file(&base.path().join("missing.zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildbotError::Io(_)));

        let jobs = store.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Uploading);
        assert!(store.claim().is_none());
    }
}
