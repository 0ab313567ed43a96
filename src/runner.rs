//! Invocation of the external compiler for one job.
//!
//! [`BuildRunner::build`] spawns the configured compiler inside the job
//! directory, captures stdout and stderr into a single stream and always
//! writes that stream to the job's build log. The compiler runs in its own
//! process group so a timeout or an abort can kill everything it started.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::state_machine::Job;

/// Maximum compiler output kept in the build log (10 MiB).
const MAX_LOG_BYTES: usize = 10 * 1024 * 1024;

/// How long to keep draining pipes after the compiler is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub duration: Duration,
    pub log_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct BuildRunner {
    compiler: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

enum Finish {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Aborted,
}

impl BuildRunner {
    pub fn new(compiler: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            compiler: compiler.into(),
            args,
            timeout,
        }
    }

    /// Compiles the sources extracted into `job.directory`.
    ///
    /// Cancelling `abort` kills the compiler the same way a timeout does.
    pub async fn build(&self, job: &Job, abort: &CancellationToken) -> Result<BuildReport, JobError> {
        let program = resolve_executable(&self.compiler)?;
        let log_path = job.log_path();

        tracing::info!(
            job = %job.name,
            compiler = %program.display(),
            timeout_secs = self.timeout.as_secs_f64(),
            "Starting build"
        );

        let mut cmd = Command::new(&program);
        cmd.args(&self.args)
            .current_dir(&job.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| JobError::environment(&program, e))?;
        let pid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut collector = tokio::spawn(collect_combined(stdout, stderr));

        let finish = tokio::select! {
            status = child.wait() => Finish::Exited(status),
            _ = tokio::time::sleep(self.timeout) => Finish::TimedOut,
            _ = abort.cancelled() => Finish::Aborted,
        };

        if !matches!(finish, Finish::Exited(_)) {
            kill_process_group(pid);
            let _ = child.kill().await;
        }

        let captured = match tokio::time::timeout(DRAIN_GRACE, &mut collector).await {
            Ok(joined) => joined.ok(),
            Err(_) => {
                // Something the compiler started still holds the pipes open.
                tracing::warn!(job = %job.name, "Compiler output still open after exit, killing its process group");
                kill_process_group(pid);
                match tokio::time::timeout(DRAIN_GRACE, &mut collector).await {
                    Ok(joined) => joined.ok(),
                    Err(_) => {
                        collector.abort();
                        None
                    }
                }
            }
        };
        let mut log = captured
            .unwrap_or_else(|| b"[buildbot] compiler output could not be captured\n".to_vec());

        let duration = start.elapsed();
        let result = match finish {
            Finish::Exited(Ok(status)) if status.success() => Ok(()),
            Finish::Exited(Ok(status)) => Err(JobError::BuildFailure {
                code: status.code(),
            }),
            Finish::Exited(Err(e)) => Err(JobError::environment(&program, e)),
            Finish::TimedOut => Err(JobError::Timeout {
                limit: self.timeout,
            }),
            Finish::Aborted => Err(JobError::Aborted),
        };

        if let Err(e) = &result {
            if matches!(e, JobError::Timeout { .. } | JobError::Aborted) {
                log.extend_from_slice(format!("\n[buildbot] {e}\n").as_bytes());
            }
        }

        let log_bytes = log.len();
        tokio::fs::write(&log_path, &log)
            .await
            .map_err(|e| JobError::environment(&log_path, e))?;

        tracing::info!(
            job = %job.name,
            duration_ms = duration.as_millis() as u64,
            ok = result.is_ok(),
            "Build finished"
        );

        result.map(|()| BuildReport {
            duration,
            log_bytes,
        })
    }
}

/// Finds the compiler, refusing anything that cannot be executed.
///
/// Bare names are looked up on `PATH`; anything with a separator is taken
/// relative to the current directory. The result is always absolute, since
/// the compiler runs with the job directory as its working directory.
pub fn resolve_executable(compiler: &Path) -> Result<PathBuf, JobError> {
    let cwd = std::env::current_dir()
        .map_err(|e| JobError::Environment(format!("cannot read current directory: {e}")))?;
    let path = std::env::var_os("PATH").unwrap_or_default();
    resolve_from(compiler, &cwd, &path)
}

fn resolve_from(compiler: &Path, cwd: &Path, path: &OsStr) -> Result<PathBuf, JobError> {
    if compiler.as_os_str().is_empty() {
        return Err(JobError::Environment("no compiler configured".into()));
    }

    if compiler.components().count() > 1 {
        let candidate = cwd.join(compiler);
        return if is_executable(&candidate) {
            Ok(candidate)
        } else {
            Err(JobError::environment(compiler, "not an executable file"))
        };
    }

    std::env::split_paths(path)
        .map(|dir| cwd.join(dir).join(compiler))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| JobError::environment(compiler, "compiler not found on PATH"))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // The child leads its own group (process_group(0)), so its pid is the pgid.
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Reads both pipes until they close, interleaving chunks as they arrive.
async fn collect_combined<O, E>(mut stdout: Option<O>, mut stderr: Option<E>) -> Vec<u8>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut combined = Vec::new();
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let mut truncated = false;

    while stdout.is_some() || stderr.is_some() {
        let chunk = tokio::select! {
            read = read_some(&mut stdout, &mut out_buf), if stdout.is_some() => {
                match read {
                    Ok(n) if n > 0 => Some(&out_buf[..n]),
                    _ => { stdout = None; None }
                }
            }
            read = read_some(&mut stderr, &mut err_buf), if stderr.is_some() => {
                match read {
                    Ok(n) if n > 0 => Some(&err_buf[..n]),
                    _ => { stderr = None; None }
                }
            }
        };

        if let Some(chunk) = chunk {
            let room = MAX_LOG_BYTES.saturating_sub(combined.len());
            if chunk.len() > room {
                truncated = true;
            }
            combined.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    if truncated {
        combined.extend_from_slice(b"\n[buildbot] output truncated\n");
    }
    combined
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state_machine::JobState;
    use chrono::Utc;
    use std::fs;

    /// Writes an executable shell script named `name` into `dir`.
    pub(crate) fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn job_in(base: &Path) -> Job {
        let mut job = Job::new("job-1".into(), &base.join("jobs"), "zip", Utc::now());
        job.state = JobState::Building;
        fs::create_dir_all(&job.directory).unwrap();
        job
    }

    #[tokio::test]
    async fn successful_build_writes_log() {
        let base = tempfile::tempdir().unwrap();
        let job = job_in(base.path());
        let cc = script(base.path(), "cc", "echo compiling; echo note >&2; exit 0");

        let runner = BuildRunner::new(cc, vec![], Duration::from_secs(10));
        let report = runner.build(&job, &CancellationToken::new()).await.unwrap();

        let log = fs::read_to_string(job.log_path()).unwrap();
        assert!(log.contains("compiling"));
        assert!(log.contains("note"));
        assert_eq!(report.log_bytes, log.len());
    }

    #[tokio::test]
    async fn runs_inside_job_directory_with_args() {
        let base = tempfile::tempdir().unwrap();
        let job = job_in(base.path());
        fs::write(job.directory.join("main.sea"), "source").unwrap();
        let cc = script(base.path(), "cc", "pwd; cat \"$1\"");

        let runner = BuildRunner::new(cc, vec!["main.sea".into()], Duration::from_secs(10));
        runner.build(&job, &CancellationToken::new()).await.unwrap();

        let log = fs::read_to_string(job.log_path()).unwrap();
        assert!(log.contains("source"));
        assert!(log.contains("job-1"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_build_failure_with_log() {
        let base = tempfile::tempdir().unwrap();
        let job = job_in(base.path());
        let cc = script(base.path(), "cc", "echo 'main.sea:1: error: expected ;' >&2; exit 3");

        let runner = BuildRunner::new(cc, vec![], Duration::from_secs(10));
        let err = runner.build(&job, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, JobError::BuildFailure { code: Some(3) }));
        let log = fs::read_to_string(job.log_path()).unwrap();
        assert!(log.contains("error: expected ;"));
    }

    #[tokio::test]
    async fn timeout_kills_compiler_and_children() {
        let base = tempfile::tempdir().unwrap();
        let job = job_in(base.path());
        let marker = base.path().join("survivor");
        let cc = script(
            base.path(),
            "cc",
            &format!("echo started; (sleep 2; touch {}) & sleep 30", marker.display()),
        );

        let runner = BuildRunner::new(cc, vec![], Duration::from_millis(300));
        let start = Instant::now();
        let err = runner.build(&job, &CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind(), "TimeoutError");
        assert!(start.elapsed() < Duration::from_secs(3));
        let log = fs::read_to_string(job.log_path()).unwrap();
        assert!(log.contains("started"));
        assert!(log.contains("timeout"));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists(), "background child outlived the timeout");
    }

    #[tokio::test]
    async fn abort_token_kills_compiler() {
        let base = tempfile::tempdir().unwrap();
        let job = job_in(base.path());
        let cc = script(base.path(), "cc", "sleep 30");

        let runner = BuildRunner::new(cc, vec![], Duration::from_secs(60));
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = runner.build(&job, &abort).await.unwrap_err();
        assert!(matches!(err, JobError::Aborted));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(job.log_path().exists());
    }

    #[tokio::test]
    async fn missing_compiler_is_environment_error() {
        let base = tempfile::tempdir().unwrap();
        let job = job_in(base.path());

        let runner = BuildRunner::new(base.path().join("no-such-cc"), vec![], Duration::from_secs(1));
        let err = runner.build(&job, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), "EnvironmentError");
        assert!(!job.log_path().exists());
    }

    #[test]
    fn non_executable_file_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let path = base.path().join("cc");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        assert!(matches!(resolve_executable(&path), Err(JobError::Environment(_))));
    }

    #[tokio::test]
    async fn relative_compiler_paths_resolve_against_the_working_directory() {
        let base = tempfile::tempdir().unwrap();
        let job = job_in(base.path());
        fs::create_dir(base.path().join("tools")).unwrap();
        script(&base.path().join("tools"), "seac", "echo relative ok");

        let resolved = resolve_from(Path::new("tools/seac"), base.path(), OsStr::new("")).unwrap();
        assert_eq!(resolved, base.path().join("tools/seac"));
        assert!(resolved.is_absolute());

        let on_path = resolve_from(Path::new("seac"), base.path(), OsStr::new("tools")).unwrap();
        assert_eq!(on_path, resolved);

        // The job directory is the compiler's cwd; the resolved path must still work there.
        let runner = BuildRunner::new(resolved, vec![], Duration::from_secs(10));
        runner.build(&job, &CancellationToken::new()).await.unwrap();
        assert!(fs::read_to_string(job.log_path()).unwrap().contains("relative ok"));
    }

    #[test]
    fn relative_path_missing_under_cwd_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let err = resolve_from(Path::new("tools/seac"), base.path(), OsStr::new("")).unwrap_err();
        assert_eq!(err.kind(), "EnvironmentError");
    }

    #[test]
    fn bare_names_resolve_on_path() {
        assert!(resolve_executable(Path::new("sh")).unwrap().is_absolute());
        assert!(resolve_executable(Path::new("buildbot-no-such-compiler")).is_err());
        assert!(resolve_executable(Path::new("")).is_err());
    }
}
