//! Interface de terminal do buildbot: spinner e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de progresso e `console` para
//! estilização com cores. O [`BatchProgress`] acompanha visualmente
//! um lote de jobs até todos chegarem a um estado final.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{Job, JobState};

/// Indicador visual de progresso para um lote de jobs no terminal.
pub struct BatchProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
}

impl BatchProgress {
    /// Inicia o spinner para `total` jobs.
    pub fn start(total: usize) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("0/{total} jobs finished"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { pb }
    }

    /// Atualiza a mensagem com a contagem por estado.
    pub fn update(&self, jobs: &[Job]) {
        let finished = jobs.iter().filter(|job| job.state.is_terminal()).count();
        let building = jobs
            .iter()
            .filter(|job| job.state == JobState::Building)
            .count();
        self.pb.set_message(format!(
            "{finished}/{} jobs finished, {building} building",
            jobs.len()
        ));
    }

    /// Exibe uma linha acima do spinner sem interrompê-lo.
    pub fn println(&self, line: impl AsRef<str>) {
        self.pb.println(line);
    }

    /// Finaliza e remove o spinner.
    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

/// Estilo de cor para cada estado: verde para done, vermelho para failed,
/// amarelo para os estados intermediários.
fn state_style(state: JobState) -> Style {
    match state {
        JobState::Done => Style::new().green().bold(),
        JobState::Failed => Style::new().red().bold(),
        _ => Style::new().yellow(),
    }
}

/// Linha de um job na tabela: nome, início e estado colorido.
pub fn job_line(job: &Job) -> String {
    format!(
        "{:<26} {:<20} {}",
        job.name,
        job.started.format("%Y-%m-%d %H:%M:%S"),
        state_style(job.state).apply_to(job.state)
    )
}

/// Imprime a tabela de jobs (nome, início, estado) com estados coloridos.
pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }

    let header = Style::new().bold();
    println!(
        "{}",
        header.apply_to(format!("{:<26} {:<20} {}", "NAME", "STARTED", "STATE"))
    );
    for job in jobs {
        println!("{}", job_line(job));
    }
}

/// Imprime o resumo final de um lote: quantos concluíram e quantos falharam.
pub fn print_summary(jobs: &[Job]) {
    let done = jobs.iter().filter(|job| job.state == JobState::Done).count();
    let failed = jobs.iter().filter(|job| job.state == JobState::Failed).count();
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();

    println!();
    println!("  {} {done} done", green.apply_to("✓"));
    if failed > 0 {
        println!("  {} {failed} failed", red.apply_to("✗"));
        for job in jobs.iter().filter(|job| job.state == JobState::Failed) {
            println!("    see {}", job.log_path().display());
        }
    }
}
