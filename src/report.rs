//! Read-only views over the store: CSV export, single job records and the
//! files kept in a job directory.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{BuildbotError, JobError};
use crate::extract::contained_path;
use crate::state_machine::Job;

/// Writes `name,started,state` rows, `started` as fractional Unix seconds.
pub fn write_csv<W: Write>(jobs: &[Job], mut out: W) -> io::Result<()> {
    writeln!(out, "name,started,state")?;
    for job in jobs {
        writeln!(out, "{},{},{}", job.name, unix_seconds(job.started), job.state)?;
    }
    out.flush()
}

fn unix_seconds(ts: DateTime<Utc>) -> String {
    format!("{}.{:06}", ts.timestamp(), ts.timestamp_subsec_micros())
}

/// Every file under a job directory, relative to it and sorted.
/// Files whose name starts with a dot are skipped.
pub fn job_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        for entry in fs::read_dir(dir.join(&relative))? {
            let entry = entry?;
            let path = relative.join(entry.file_name());
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
            } else if !entry.file_name().to_string_lossy().starts_with('.') {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Writes one job record as pretty-printed JSON.
pub fn write_job<W: Write>(job: &Job, mut out: W) -> Result<(), BuildbotError> {
    serde_json::to_writer_pretty(&mut out, job)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

/// Copies `relative` from the job directory `dir` to `out`.
///
/// The path must stay inside `dir`; `..` climbing out or absolute paths are
/// refused the same way archive entries are.
pub fn copy_job_file<W: Write>(dir: &Path, relative: &str, mut out: W) -> Result<u64, BuildbotError> {
    let path = contained_path(dir, relative).ok_or_else(|| JobError::PathTraversal {
        entry: relative.to_string(),
    })?;
    let mut file = File::open(&path)?;
    let copied = io::copy(&mut file, &mut out)?;
    out.flush()?;
    Ok(copied)
}
