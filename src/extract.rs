//! Safe unpacking of uploaded archives into a job directory.
//!
//! Every entry is validated before anything touches the disk, so a rejected
//! archive leaves no partially written files behind it.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use crate::error::JobError;
use crate::state_machine::{Job, normalize_extension};

/// Archive formats this crate knows how to unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
}

impl ArchiveFormat {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match normalize_extension(extension).as_str() {
            "zip" => Some(ArchiveFormat::Zip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractLimits {
    pub max_total_bytes: u64,
    pub max_entries: usize,
}

/// What an extraction produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtractSummary {
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    allowed_extensions: Vec<String>,
    limits: ExtractLimits,
}

impl ArchiveExtractor {
    pub fn new(allowed_extensions: &[String], limits: ExtractLimits) -> Self {
        Self {
            allowed_extensions: allowed_extensions
                .iter()
                .map(|ext| normalize_extension(ext))
                .collect(),
            limits,
        }
    }

    /// Accepts `extension` only if it is allowed and decodable.
    pub fn check_extension(&self, extension: &str) -> Result<ArchiveFormat, JobError> {
        let extension = normalize_extension(extension);
        let unsupported = || JobError::UnsupportedFormat {
            extension: extension.clone(),
        };
        if !self.allowed_extensions.contains(&extension) {
            return Err(unsupported());
        }
        ArchiveFormat::from_extension(&extension).ok_or_else(unsupported)
    }

    /// Unpacks the job's archive into its directory.
    pub fn extract(&self, job: &Job) -> Result<ExtractSummary, JobError> {
        match self.check_extension(&job.archive_extension)? {
            ArchiveFormat::Zip => self.extract_zip(&job.archive_path(), &job.directory),
        }
    }

    fn extract_zip(&self, archive: &Path, dest: &Path) -> Result<ExtractSummary, JobError> {
        let file = File::open(archive).map_err(|e| JobError::extraction("cannot open archive", e))?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| JobError::extraction("unreadable archive", e))?;

        if zip.len() > self.limits.max_entries {
            return Err(JobError::Extraction(format!(
                "archive has {} entries, limit is {}",
                zip.len(),
                self.limits.max_entries
            )));
        }

        // Validation pass: nothing is written until every entry checks out.
        let mut plan = Vec::with_capacity(zip.len());
        let mut declared: u64 = 0;
        for index in 0..zip.len() {
            let entry = zip
                .by_index(index)
                .map_err(|e| JobError::extraction("corrupt archive entry", e))?;
            let target = contained_path(dest, entry.name()).ok_or_else(|| JobError::PathTraversal {
                entry: entry.name().to_string(),
            })?;
            if target == archive {
                return Err(JobError::Extraction(format!(
                    "entry `{}` would overwrite the uploaded archive",
                    entry.name()
                )));
            }
            declared = declared.saturating_add(entry.size());
            if declared > self.limits.max_total_bytes {
                return Err(self.too_large());
            }
            plan.push(PlannedEntry {
                index,
                target,
                is_dir: entry.is_dir(),
                mode: entry.unix_mode(),
            });
        }

        let mut summary = ExtractSummary::default();
        for planned in plan {
            if planned.is_dir {
                fs::create_dir_all(&planned.target)
                    .map_err(|e| JobError::extraction("cannot create directory", e))?;
                continue;
            }
            if let Some(parent) = planned.target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| JobError::extraction("cannot create directory", e))?;
            }

            let entry = zip
                .by_index(planned.index)
                .map_err(|e| JobError::extraction("corrupt archive entry", e))?;
            let remaining = self.limits.max_total_bytes - summary.bytes;
            let mut out = File::create(&planned.target)
                .map_err(|e| JobError::extraction("cannot create file", e))?;
            // Declared sizes can lie; cap what is actually inflated.
            let written = io::copy(&mut entry.take(remaining + 1), &mut out)
                .map_err(|e| JobError::extraction("cannot inflate entry", e))?;
            if written > remaining {
                drop(out);
                let _ = fs::remove_file(&planned.target);
                return Err(self.too_large());
            }
            summary.bytes += written;
            summary.files += 1;

            if let Some(mode) = planned.mode {
                set_mode(&planned.target, mode)
                    .map_err(|e| JobError::extraction("cannot set permissions", e))?;
            }
        }

        Ok(summary)
    }

    fn too_large(&self) -> JobError {
        JobError::Extraction(format!(
            "archive expands beyond the {} byte limit",
            self.limits.max_total_bytes
        ))
    }
}

struct PlannedEntry {
    index: usize,
    target: PathBuf,
    is_dir: bool,
    mode: Option<u32>,
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Resolves a relative name (archive entry or user path) under `root`, or
/// `None` if it would escape.
pub(crate) fn contained_path(root: &Path, entry: &str) -> Option<PathBuf> {
    let normalized = entry.replace('\\', "/");
    let mut relative = PathBuf::new();
    let mut depth = 0usize;

    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => {
                relative.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                relative.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(root.join(relative))
}
