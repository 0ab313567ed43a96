//! Configuração do buildbot carregada a partir de `buildbot.toml`.
//!
//! A struct [`BuildbotConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `BUILDBOT_COMPILER` e `BUILDBOT_ROOT` têm
//! precedência sobre o arquivo.

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BuildbotError;
use crate::extract::ExtractLimits;
use crate::pool::{PoolSettings, ShutdownMode};

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "buildbot.toml";

/// Configuração de nível superior carregada de `buildbot.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildbotConfig {
    /// Diretório onde cada job recebe `<root>/<nome>/`.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Número de workers concorrentes.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Extensões de arquivo aceitas no upload.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Executável do compilador.
    #[serde(default = "default_compiler")]
    pub compiler: PathBuf,

    /// Argumentos extras passados ao compilador.
    #[serde(default)]
    pub compiler_args: Vec<String>,

    /// Tempo máximo de um build, em segundos.
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,

    /// Intervalo de espera de um worker ocioso, em milissegundos.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Tamanho máximo extraído de um arquivo, em bytes.
    #[serde(default = "default_max_extracted_bytes")]
    pub max_extracted_bytes: u64,

    /// Número máximo de entradas de um arquivo.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// O que fazer com builds em andamento no desligamento.
    #[serde(default)]
    pub shutdown: ShutdownMode,
}

// Valor padrão para o diretório raiz: "jobs".
fn default_root() -> PathBuf {
    PathBuf::from("jobs")
}

// Valor padrão para o número de workers: 2.
fn default_workers() -> usize {
    2
}

// Valor padrão para as extensões aceitas: apenas zip.
fn default_allowed_extensions() -> Vec<String> {
    vec!["zip".to_string()]
}

// Valor padrão para o compilador: "seac".
fn default_compiler() -> PathBuf {
    PathBuf::from("seac")
}

// Valor padrão para o timeout de build: 120s.
fn default_build_timeout_secs() -> u64 {
    120
}

// Valor padrão para o intervalo de polling: 250ms.
fn default_poll_interval_ms() -> u64 {
    250
}

// Valor padrão para o tamanho extraído: 64 MiB.
fn default_max_extracted_bytes() -> u64 {
    64 * 1024 * 1024
}

// Valor padrão para o número de entradas: 1024.
fn default_max_entries() -> usize {
    1024
}

impl Default for BuildbotConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            workers: default_workers(),
            allowed_extensions: default_allowed_extensions(),
            compiler: default_compiler(),
            compiler_args: Vec::new(),
            build_timeout_secs: default_build_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_extracted_bytes: default_max_extracted_bytes(),
            max_entries: default_max_entries(),
            shutdown: ShutdownMode::default(),
        }
    }
}

impl BuildbotConfig {
    /// Carrega a configuração de `path`, ou de `buildbot.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(CONFIG_FILE));
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<BuildbotConfig>(&contents).map_err(BuildbotError::from)?
        } else {
            Self::default()
        };

        Ok(config.with_env(|key| std::env::var(key).ok()))
    }

    /// Aplica as variáveis de ambiente; elas têm precedência sobre o arquivo.
    fn with_env(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(compiler) = var("BUILDBOT_COMPILER").filter(|v| !v.is_empty()) {
            self.compiler = PathBuf::from(compiler);
        }
        if let Some(root) = var("BUILDBOT_ROOT").filter(|v| !v.is_empty()) {
            self.root = PathBuf::from(root);
        }
        self
    }

    /// Rejeita combinações que deixariam o pool inutilizável.
    pub fn validate(&self) -> Result<(), BuildbotError> {
        if self.workers == 0 {
            return Err(BuildbotError::Config("workers must be at least 1".into()));
        }
        if self.build_timeout_secs == 0 {
            return Err(BuildbotError::Config("build_timeout_secs must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(BuildbotError::Config("poll_interval_ms must be positive".into()));
        }
        if self.allowed_extensions.is_empty() {
            return Err(BuildbotError::Config("allowed_extensions must not be empty".into()));
        }
        Ok(())
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn extract_limits(&self) -> ExtractLimits {
        ExtractLimits {
            max_total_bytes: self.max_extracted_bytes,
            max_entries: self.max_entries,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            workers: self.workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}
