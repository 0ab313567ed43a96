use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The five states of a build job.
///
/// Each job flows through: uploading → uploaded → building → done | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Uploading,
    Uploaded,
    Building,
    Done,
    Failed,
}

impl JobState {
    /// Whether `next` is an edge of the state graph leaving `self`.
    ///
    /// - `Uploading` may only become `Uploaded`.
    /// - `Uploaded` may only become `Building` (through a claim).
    /// - `Building` ends in either `Done` or `Failed`.
    /// - `Done` and `Failed` are terminal.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Uploading, JobState::Uploaded)
                | (JobState::Uploaded, JobState::Building)
                | (JobState::Building, JobState::Done)
                | (JobState::Building, JobState::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Uploading => "uploading",
            JobState::Uploaded => "uploaded",
            JobState::Building => "building",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

    pub const ALL: [JobState; 5] = [
        JobState::Uploading,
        JobState::Uploaded,
        JobState::Building,
        JobState::Done,
        JobState::Failed,
    ];
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}
