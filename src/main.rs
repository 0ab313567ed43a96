mod cli;
mod config;
mod error;
mod extract;
mod intake;
mod pool;
mod report;
mod runner;
mod shutdown;
mod state_machine;
mod store;
mod ui;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use config::BuildbotConfig;
use extract::ArchiveExtractor;
use intake::Intake;
use pool::{ShutdownMode, WorkerPool};
use runner::BuildRunner;
use state_machine::JobState;
use store::JobStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = BuildbotConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    let store = Arc::new(
        JobStore::open(&config.root)
            .with_context(|| format!("opening job store at {}", config.root.display()))?,
    );
    tracing::debug!(root = %store.root().display(), "Job store ready");

    match cli.command {
        Command::Build { archives } => build(&config, store, archives).await,
        Command::Status => {
            ui::print_jobs(&store.list());
            Ok(())
        }
        Command::Show { name } => {
            let job = store.get(&name)?;
            report::write_job(&job, std::io::stdout().lock())?;
            Ok(())
        }
        Command::Export => {
            report::write_csv(&store.list(), std::io::stdout().lock())?;
            Ok(())
        }
        Command::Files { name } => {
            let dir = store.job_dir(&name)?;
            for file in report::job_files(&dir)? {
                println!("{}", file.display());
            }
            Ok(())
        }
        Command::Cat { name, path } => {
            let dir = store.job_dir(&name)?;
            report::copy_job_file(&dir, &path, std::io::stdout().lock())?;
            Ok(())
        }
    }
}

/// Submits every archive, runs the pool until the batch settles and reports.
async fn build(
    config: &BuildbotConfig,
    store: Arc<JobStore>,
    archives: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let extractor = ArchiveExtractor::new(&config.allowed_extensions, config.extract_limits());
    let runner = BuildRunner::new(
        config.compiler.clone(),
        config.compiler_args.clone(),
        config.build_timeout(),
    );
    if let Err(e) = runner::resolve_executable(&config.compiler) {
        tracing::warn!(error = %e, "Compiler unavailable, builds will fail");
    }

    let mut pool = WorkerPool::new(
        Arc::clone(&store),
        extractor.clone(),
        runner,
        config.pool_settings(),
    );
    pool.start();
    let signals = shutdown::listen()?;
    let abort = pool.abort_token();
    let forced = signals.forced.clone();
    tokio::spawn(async move {
        forced.cancelled().await;
        abort.cancel();
    });
    let shutdown = signals.requested;
    let intake = Intake::new(Arc::clone(&store), extractor);

    let mut submitted = Vec::new();
    let mut rejected = 0usize;
    for archive in &archives {
        match intake.submit_file(archive).await {
            Ok(job) => submitted.push(job.name),
            Err(e) => {
                rejected += 1;
                if intake::is_unsupported(&e) {
                    tracing::error!(archive = %archive.display(), error = %e, "Archive rejected");
                } else {
                    tracing::error!(archive = %archive.display(), error = %e, "Upload failed");
                }
            }
        }
    }

    let progress = ui::BatchProgress::start(submitted.len());
    let mut reported = HashSet::new();
    let jobs = loop {
        let jobs: Vec<_> = submitted
            .iter()
            .filter_map(|name| store.get(name).ok())
            .collect();
        for job in jobs.iter().filter(|job| job.state.is_terminal()) {
            if reported.insert(job.name.clone()) {
                progress.println(ui::job_line(job));
            }
        }
        progress.update(&jobs);
        if jobs.iter().all(|job| job.state.is_terminal()) || shutdown.is_cancelled() {
            break jobs;
        }
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
    };
    progress.finish();

    let interrupted = shutdown.is_cancelled();
    let mode = if interrupted {
        config.shutdown
    } else {
        ShutdownMode::Graceful
    };
    pool.shutdown(mode).await;

    // Pick up the states in-flight jobs settled into during shutdown.
    let jobs: Vec<_> = jobs
        .iter()
        .filter_map(|job| store.get(&job.name).ok())
        .collect();
    ui::print_jobs(&jobs);
    ui::print_summary(&jobs);

    let failed = jobs
        .iter()
        .filter(|job| job.state == JobState::Failed)
        .count();
    if interrupted {
        bail!("interrupted before every job finished");
    }
    if failed > 0 || rejected > 0 {
        bail!("{failed} job(s) failed, {rejected} archive(s) rejected");
    }
    Ok(())
}
