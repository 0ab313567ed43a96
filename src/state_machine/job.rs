use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobState;

/// Stem of the uploaded archive inside a job directory.
pub const ARCHIVE_NAME: &str = "code";

/// File name of the captured compiler output inside a job directory.
pub const LOG_NAME: &str = "build.log";

/// A single submission: one uploaded archive and its build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub state: JobState,
    pub started: DateTime<Utc>,
    pub directory: PathBuf,
    pub archive_extension: String,
}

impl Job {
    pub fn new(name: String, root: &Path, archive_extension: &str, started: DateTime<Utc>) -> Self {
        Self {
            directory: root.join(&name),
            name,
            state: JobState::Uploading,
            started,
            archive_extension: normalize_extension(archive_extension),
        }
    }

    /// Where the collaborator stores the uploaded bytes: `<dir>/code.<ext>`.
    pub fn archive_path(&self) -> PathBuf {
        self.directory
            .join(format!("{ARCHIVE_NAME}.{}", self.archive_extension))
    }

    pub fn log_path(&self) -> PathBuf {
        self.directory.join(LOG_NAME)
    }
}

/// Generates a candidate job name: UTC timestamp plus a random suffix.
pub fn generate_name(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

/// Lowercases an extension and strips a leading dot (`.ZIP` → `zip`).
pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Extension of an uploaded file name, as recorded on the job.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(normalize_extension)
        .filter(|ext| !ext.is_empty())
}
