use std::path::Path;

use thiserror::Error;

use crate::state_machine::JobState;

#[derive(Debug, Error)]
pub enum BuildbotError {
    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Errors returned synchronously by [`JobStore`](crate::store::JobStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Could not generate a unique job name after {attempts} attempts")]
    DuplicateName { attempts: u32 },

    #[error("Invalid transition for job {name}: {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: JobState,
        to: JobState,
    },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures raised while a worker processes one job.
///
/// These never leave the worker loop: each one ends the affected job in
/// `failed` and is written to its build log.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("archive type `{extension}` is not accepted")]
    UnsupportedFormat { extension: String },

    #[error("archive entry `{entry}` escapes the job directory")]
    PathTraversal { entry: String },

    #[error("{0}")]
    Extraction(String),

    #[error("compiler exited with {}", exit_label(.code))]
    BuildFailure { code: Option<i32> },

    #[error("build exceeded the {}s timeout and was killed", .limit.as_secs_f64())]
    Timeout { limit: std::time::Duration },

    #[error("{0}")]
    Environment(String),

    #[error("build aborted by shutdown")]
    Aborted,
}

impl JobError {
    /// Stable name of the failure class, written to build logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::UnsupportedFormat { .. } => "UnsupportedFormatError",
            JobError::PathTraversal { .. } => "PathTraversalError",
            JobError::Extraction(_) => "ExtractionError",
            JobError::BuildFailure { .. } => "BuildFailure",
            JobError::Timeout { .. } => "TimeoutError",
            JobError::Environment(_) => "EnvironmentError",
            JobError::Aborted => "AbortedError",
        }
    }

    pub(crate) fn extraction(context: &str, err: impl std::fmt::Display) -> Self {
        JobError::Extraction(format!("{context}: {err}"))
    }

    pub(crate) fn environment(path: &Path, err: impl std::fmt::Display) -> Self {
        JobError::Environment(format!("{}: {err}", path.display()))
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn job_error_kinds_are_stable() {
        let err = JobError::UnsupportedFormat {
            extension: "rar".into(),
        };
        assert_eq!(err.kind(), "UnsupportedFormatError");
        assert_eq!(err.to_string(), "archive type `rar` is not accepted");

        assert_eq!(JobError::Aborted.kind(), "AbortedError");
        assert_eq!(
            JobError::Timeout {
                limit: Duration::from_millis(1500)
            }
            .kind(),
            "TimeoutError"
        );
    }

    #[test]
    fn build_failure_display() {
        assert_eq!(
            JobError::BuildFailure { code: Some(2) }.to_string(),
            "compiler exited with exit code 2"
        );
        assert_eq!(
            JobError::BuildFailure { code: None }.to_string(),
            "compiler exited with no exit code (killed by signal)"
        );
    }

    #[test]
    fn invalid_transition_display() {
        let err = StoreError::InvalidTransition {
            name: "job-1".into(),
            from: JobState::Done,
            to: JobState::Building,
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition for job job-1: done -> building"
        );
    }
}
