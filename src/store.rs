//! Concurrency-safe registry of jobs.
//!
//! [`JobStore`] owns every state change and the claim protocol. The whole
//! registry sits behind one mutex: job volume is low and this keeps
//! [`JobStore::claim`] trivially exclusive.
//!
//! The store is a single-process component. Two processes pointed at the same
//! root each keep their own in-memory copy and would happily claim the same
//! job; nothing here coordinates across processes.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::error::StoreError;
use crate::state_machine::{Job, JobState, generate_name};

/// Number of fresh names tried before [`JobStore::create`] gives up.
const NAME_ATTEMPTS: u32 = 8;

/// File name of the JSON snapshot kept under the store root.
pub const SNAPSHOT_NAME: &str = "jobs.json";

/// Optional backing storage for the in-memory registry.
pub trait Persistence: Send + Sync {
    fn load(&self) -> io::Result<Vec<Job>>;
    fn save(&self, jobs: &[Job]) -> io::Result<()>;
}

/// Persists the registry as a JSON array, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_root(root: &Path) -> Self {
        Self::new(root.join(SNAPSHOT_NAME))
    }
}

impl Persistence for JsonFile {
    fn load(&self) -> io::Result<Vec<Job>> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(io::Error::other),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn save(&self, jobs: &[Job]) -> io::Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, jobs).map_err(io::Error::other)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)
    }
}

pub struct JobStore {
    root: PathBuf,
    jobs: Mutex<HashMap<String, Job>>,
    persistence: Option<Box<dyn Persistence>>,
    // Bumped under the `jobs` lock on every change that gets persisted.
    revision: AtomicU64,
    // Revision last written; serializes saves outside the `jobs` lock.
    saved: Mutex<u64>,
}

/// Registry contents captured under the lock, written after it is released.
struct Snapshot {
    revision: u64,
    jobs: Vec<Job>,
}

impl JobStore {
    /// Memory-only store whose job directories live under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            jobs: Mutex::new(HashMap::new()),
            persistence: None,
            revision: AtomicU64::new(0),
            saved: Mutex::new(0),
        })
    }

    /// Store backed by `persistence`, reloading whatever it already holds.
    ///
    /// Jobs found in `building` are left there; nothing requeues them.
    pub fn with_persistence(
        root: impl Into<PathBuf>,
        persistence: Box<dyn Persistence>,
    ) -> Result<Self, StoreError> {
        let mut store = Self::new(root)?;
        let loaded = persistence.load()?;
        let stuck = loaded
            .iter()
            .filter(|job| job.state == JobState::Building)
            .count();
        if stuck > 0 {
            tracing::warn!(stuck, "Jobs left in building by a previous run will not be resumed");
        }
        store.jobs = Mutex::new(
            loaded
                .into_iter()
                .map(|job| (job.name.clone(), job))
                .collect(),
        );
        store.persistence = Some(persistence);
        Ok(store)
    }

    /// Store persisted to `<root>/jobs.json`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let persistence = JsonFile::in_root(&root);
        Self::with_persistence(root, Box::new(persistence))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registers a new job in `uploading` and creates its directory.
    pub fn create(&self, extension: &str) -> Result<Job, StoreError> {
        let mut jobs = self.lock();

        for attempt in 1..=NAME_ATTEMPTS {
            let now = Utc::now();
            let name = generate_name(now);
            if jobs.contains_key(&name) {
                tracing::debug!(name = %name, attempt, "Job name collision in registry");
                continue;
            }

            let job = Job::new(name, &self.root, extension, now);
            match fs::create_dir(&job.directory) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(name = %job.name, attempt, "Job directory already exists");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            tracing::info!(job = %job.name, extension = %job.archive_extension, "Job created");
            jobs.insert(job.name.clone(), job.clone());
            let snapshot = self.snapshot(&jobs);
            drop(jobs);
            self.persist(snapshot);
            return Ok(job);
        }

        Err(StoreError::DuplicateName {
            attempts: NAME_ATTEMPTS,
        })
    }

    /// Moves `name` to `to` if that is an edge of the state graph.
    pub fn transition(&self, name: &str, to: JobState) -> Result<(), StoreError> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        if !job.state.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                name: name.to_string(),
                from: job.state,
                to,
            });
        }

        tracing::debug!(job = name, from = %job.state, to = %to, "Job transition");
        job.state = to;
        let snapshot = self.snapshot(&jobs);
        drop(jobs);
        self.persist(snapshot);
        Ok(())
    }

    /// Takes the oldest `uploaded` job and moves it to `building`.
    ///
    /// Returns `None` when nothing is waiting.
    pub fn claim(&self) -> Option<Job> {
        let mut jobs = self.lock();
        let job = jobs
            .values_mut()
            .filter(|job| job.state == JobState::Uploaded)
            .min_by(|a, b| a.started.cmp(&b.started).then_with(|| a.name.cmp(&b.name)))?;

        job.state = JobState::Building;
        let claimed = job.clone();
        let snapshot = self.snapshot(&jobs);
        drop(jobs);
        self.persist(snapshot);
        Some(claimed)
    }

    pub fn get(&self, name: &str) -> Result<Job, StoreError> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Snapshot of every job, oldest first.
    pub fn list(&self) -> Vec<Job> {
        sorted(&self.lock())
    }

    /// Directory reserved for `name`.
    pub fn job_dir(&self, name: &str) -> Result<PathBuf, StoreError> {
        self.get(name).map(|job| job.directory)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Called with the `jobs` lock held.
    fn snapshot(&self, jobs: &HashMap<String, Job>) -> Option<Snapshot> {
        self.persistence.as_ref()?;
        Some(Snapshot {
            revision: self.revision.fetch_add(1, Ordering::Relaxed) + 1,
            jobs: sorted(jobs),
        })
    }

    /// Writes `snapshot` unless a newer one already reached the backend.
    ///
    /// Runs without the `jobs` lock, so readers never wait on a save. The
    /// in-memory map stays authoritative when a save fails.
    fn persist(&self, snapshot: Option<Snapshot>) {
        let (Some(persistence), Some(snapshot)) = (&self.persistence, snapshot) else {
            return;
        };

        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        if snapshot.revision <= *saved {
            return;
        }
        match persistence.save(&snapshot.jobs) {
            Ok(()) => *saved = snapshot.revision,
            Err(e) => tracing::warn!(error = %e, "Failed to persist job registry"),
        }
    }
}

fn sorted(jobs: &HashMap<String, Job>) -> Vec<Job> {
    let mut list: Vec<Job> = jobs.values().cloned().collect();
    list.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.name.cmp(&b.name)));
    list
}
