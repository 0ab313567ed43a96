use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::extract::ArchiveExtractor;
use crate::runner::BuildRunner;
use crate::state_machine::{Job, JobState};
use crate::store::JobStore;

/// What happens to in-flight builds when the pool is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Let every in-flight job run to completion.
    #[default]
    Graceful,
    /// Kill running compilers; their jobs end in `failed`.
    Kill,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of concurrent workers (at least one).
    pub workers: usize,
    /// How long an idle worker waits before trying to claim again.
    pub poll_interval: Duration,
}

/// Shared by every worker: the store and the two processing steps.
struct Pipeline {
    store: Arc<JobStore>,
    extractor: ArchiveExtractor,
    runner: BuildRunner,
}

/// N workers claiming uploaded jobs and driving them to a terminal state.
///
/// Built once by the composition root; [`WorkerPool::start`] and
/// [`WorkerPool::shutdown`] bound its lifetime.
pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    settings: PoolSettings,
    stop: CancellationToken,
    abort: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<JobStore>,
        extractor: ArchiveExtractor,
        runner: BuildRunner,
        settings: PoolSettings,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                store,
                extractor,
                runner,
            }),
            settings,
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// Spawns the workers. Calling it on a running pool does nothing.
    pub fn start(&mut self) {
        if !self.workers.is_empty() || self.stop.is_cancelled() {
            return;
        }

        let count = self.settings.workers.max(1);
        tracing::info!(
            workers = count,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Worker pool starting"
        );

        self.workers = (0..count)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&self.pipeline),
                    self.stop.clone(),
                    self.abort.clone(),
                    self.settings.poll_interval,
                ))
            })
            .collect();
    }

    /// Token that kills running compilers when cancelled, even while a
    /// graceful [`WorkerPool::shutdown`] is draining.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Stops claiming, settles in-flight jobs according to `mode` and waits
    /// for every worker to exit.
    pub async fn shutdown(mut self, mode: ShutdownMode) {
        tracing::info!(?mode, "Worker pool shutting down");
        self.stop.cancel();
        if mode == ShutdownMode::Kill {
            self.abort.cancel();
        }

        for handle in std::mem::take(&mut self.workers) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run_worker(
    id: usize,
    pipeline: Arc<Pipeline>,
    stop: CancellationToken,
    abort: CancellationToken,
    poll_interval: Duration,
) {
    tracing::debug!(worker = id, "Worker started");

    while !stop.is_cancelled() {
        match pipeline.store.claim() {
            Some(job) => {
                tracing::info!(worker = id, job = %job.name, "Job claimed");
                pipeline.process(id, job, &abort).await;
            }
            None => {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    tracing::debug!(worker = id, "Worker stopped");
}

impl Pipeline {
    /// Runs one claimed job to `done` or `failed`. Never returns an error:
    /// whatever goes wrong is recorded on the job.
    async fn process(self: &Arc<Self>, worker: usize, job: Job, abort: &CancellationToken) {
        let name = job.name.clone();
        let log_path = job.log_path();

        let pipeline = Arc::clone(self);
        let abort = abort.clone();
        let steps = tokio::spawn(async move { pipeline.run_steps(&job, &abort).await });

        let (state, failure) = match steps.await {
            Ok(Ok(())) => (JobState::Done, None),
            Ok(Err(e)) => (JobState::Failed, Some((e.kind(), e.to_string()))),
            Err(e) => (JobState::Failed, Some(("WorkerPanic", e.to_string()))),
        };

        if let Some((kind, message)) = &failure {
            tracing::warn!(worker, job = %name, kind, error = %message, "Job failed");
            if let Err(e) = append_failure(&log_path, kind, message).await {
                tracing::error!(job = %name, error = %e, "Could not record failure in build log");
            }
        } else {
            tracing::info!(worker, job = %name, "Job done");
        }

        if let Err(e) = self.store.transition(&name, state) {
            tracing::error!(job = %name, error = %e, "Could not record final job state");
        }
    }

    async fn run_steps(&self, job: &Job, abort: &CancellationToken) -> Result<(), JobError> {
        let extractor = self.extractor.clone();
        let target = job.clone();
        let summary = tokio::task::spawn_blocking(move || extractor.extract(&target))
            .await
            .map_err(|e| JobError::Extraction(format!("extraction task failed: {e}")))??;
        tracing::debug!(job = %job.name, files = summary.files, bytes = summary.bytes, "Archive extracted");

        let report = self.runner.build(job, abort).await?;
        tracing::debug!(
            job = %job.name,
            duration_ms = report.duration.as_millis() as u64,
            log_bytes = report.log_bytes,
            "Build succeeded"
        );
        Ok(())
    }
}

async fn append_failure(log_path: &Path, kind: &str, message: &str) -> std::io::Result<()> {
    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;
    log.write_all(format!("[buildbot] job failed: {kind}: {message}\n").as_bytes())
        .await?;
    log.flush().await
}
