//! Interface de linha de comando do buildbot baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (build, status,
//! show, export, files, cat) e flags globais (--config, --workers, --timeout,
//! --compiler, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::BuildbotConfig;

/// buildbot: compila arquivos enviados e acompanha cada submissão.
#[derive(Debug, Parser)]
#[command(name = "buildbot", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./buildbot.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Número de workers concorrentes.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Timeout de cada build, em segundos.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Executável do compilador.
    #[arg(long, global = true)]
    pub compiler: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Envia os arquivos e compila cada um até o estado final.
    Build {
        /// Arquivos de código (ex.: hw1.zip).
        #[arg(required = true)]
        archives: Vec<PathBuf>,
    },

    /// Mostra todos os jobs registrados.
    Status,

    /// Mostra o registro de um job em JSON.
    Show {
        /// Nome do job.
        name: String,
    },

    /// Exporta os jobs em CSV (name, started, state) na saída padrão.
    Export,

    /// Lista os arquivos de um job.
    Files {
        /// Nome do job.
        name: String,
    },

    /// Imprime um arquivo de um job (ex.: build.log).
    Cat {
        /// Nome do job.
        name: String,

        /// Caminho relativo ao diretório do job.
        path: String,
    },
}

impl Cli {
    /// Flags da CLI têm precedência sobre o arquivo e o ambiente.
    pub fn apply_overrides(&self, config: &mut BuildbotConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(timeout) = self.timeout {
            config.build_timeout_secs = timeout;
        }
        if let Some(compiler) = &self.compiler {
            config.compiler = compiler.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_build_subcommand() {
        let cli = Cli::parse_from(["buildbot", "build", "hw1.zip", "hw2.zip"]);
        match cli.command {
            Command::Build { archives } => {
                assert_eq!(archives, vec![PathBuf::from("hw1.zip"), PathBuf::from("hw2.zip")]);
            }
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn build_requires_an_archive() {
        assert!(Cli::try_parse_from(["buildbot", "build"]).is_err());
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "buildbot",
            "--workers",
            "4",
            "--timeout",
            "30",
            "--compiler",
            "/usr/bin/seac",
            "--verbose",
            "status",
        ]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Status));

        let mut config = BuildbotConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.workers, 4);
        assert_eq!(config.build_timeout_secs, 30);
        assert_eq!(config.compiler, PathBuf::from("/usr/bin/seac"));
    }

    #[test]
    fn cli_parses_files_subcommand() {
        let cli = Cli::parse_from(["buildbot", "files", "20260101-000000-abcd1234"]);
        match cli.command {
            Command::Files { name } => assert_eq!(name, "20260101-000000-abcd1234"),
            _ => panic!("expected Files command"),
        }
    }

    #[test]
    fn cli_parses_show_and_cat_subcommands() {
        let cli = Cli::parse_from(["buildbot", "show", "20260101-000000-abcd1234"]);
        assert!(matches!(cli.command, Command::Show { ref name } if name == "20260101-000000-abcd1234"));

        let cli = Cli::parse_from(["buildbot", "cat", "20260101-000000-abcd1234", "build.log"]);
        match cli.command {
            Command::Cat { name, path } => {
                assert_eq!(name, "20260101-000000-abcd1234");
                assert_eq!(path, "build.log");
            }
            _ => panic!("expected Cat command"),
        }
        assert!(Cli::try_parse_from(["buildbot", "cat", "20260101-000000-abcd1234"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
