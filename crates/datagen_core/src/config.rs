//! Configuração unificada via TOML + variáveis de ambiente do runtime edge.
//!
//! O `config.toml` fica ao lado do executável (ou em `DATAGEN_CONFIG`). As
//! variáveis injetadas pelo runtime (`IOTEDGE_MODULEID`, `UpstreamProtocol`)
//! têm precedência sobre o arquivo.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::emission::DEFAULT_OUTPUT;
use crate::twin::{DEFAULT_SAMPLING_RATE_MS, SAMPLING_RATE_MAX_MS, SAMPLING_RATE_MIN_MS};

/// Identidade do módulo, injetada pelo runtime.
pub const ENV_MODULE_ID: &str = "IOTEDGE_MODULEID";
/// Protocolo de transporte: "AMQP" ou "MQTT".
pub const ENV_UPSTREAM_PROTOCOL: &str = "UpstreamProtocol";
/// Nível de log: fatal, error, warn, info, debug, verbose.
pub const ENV_LOG_LEVEL: &str = "RuntimeLogLevel";
/// Caminho alternativo do `config.toml`.
pub const ENV_CONFIG_PATH: &str = "DATAGEN_CONFIG";

/// Erros ao ler ou gravar o arquivo de configuração.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Erro ao ler {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Erro ao parsear {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Erro ao serializar configuração: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Erro ao gravar {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Configuração do módulo gerador.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Identidade gravada em cada envelope (vazio = variável de ambiente)
    pub device_id: String,
    /// Nome da saída usada para a telemetria
    pub output_name: String,
    /// "AMQP", "MQTT" ou vazio (padrão MQTT)
    pub upstream_protocol: String,
    /// Intervalo inicial, antes do primeiro desired (ms)
    pub sampling_rate_ms: u32,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            output_name: DEFAULT_OUTPUT.into(),
            upstream_protocol: String::new(),
            sampling_rate_ms: DEFAULT_SAMPLING_RATE_MS,
        }
    }
}

/// Configuração do link com o hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Endereço UDP do hub
    pub addr: String,
    /// IP local para bind (vazio = auto)
    pub bind_ip: String,
    /// Falhas consecutivas até o link desistir (RetryExpired)
    pub retry_budget: u32,
    /// Tempo máximo de espera por respostas do hub (ms)
    pub response_timeout_ms: u64,
    /// Intervalo entre heartbeats depois do `open` (ms)
    pub heartbeat_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5005".into(),
            bind_ip: String::new(),
            retry_budget: 5,
            response_timeout_ms: 5000,
            heartbeat_interval_ms: 10_000,
        }
    }
}

/// Configuração raiz do aplicativo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub module: ModuleConfig,
    pub hub: HubConfig,
}

impl AppConfig {
    /// Lê o `config.toml`.
    ///
    /// Arquivo ausente → `Ok(None)`; arquivo ilegível ou malformado é erro,
    /// nunca um fallback silencioso para os padrões.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuração carregada de {}", path.display());
        Ok(Some(config))
    }

    /// Carrega o arquivo ou, se não existir, grava e devolve os padrões.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if let Some(config) = Self::load(path)? {
            return Ok(config);
        }
        info!("{} não encontrado, usando configuração padrão", path.display());
        let config = Self::default();
        // Falha ao gravar não impede o módulo de subir
        if let Err(e) = config.save(path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// `DATAGEN_CONFIG`, se definida; senão `config.toml` ao lado do executável.
    pub fn default_path() -> PathBuf {
        if let Some(path) = std::env::var_os(ENV_CONFIG_PATH).filter(|p| !p.is_empty()) {
            return PathBuf::from(path);
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("config.toml")))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Aplica as variáveis do processo.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Aplica overrides a partir de um lookup arbitrário (testável).
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup(ENV_MODULE_ID).filter(|v| !v.is_empty()) {
            self.module.device_id = id;
        }
        if let Some(protocol) = lookup(ENV_UPSTREAM_PROTOCOL).filter(|v| !v.is_empty()) {
            self.module.upstream_protocol = protocol;
        }
    }

    /// Endereço do hub já parseado.
    pub fn hub_addr(&self) -> Result<SocketAddr, String> {
        self.hub
            .addr
            .parse()
            .map_err(|e| format!("Endereço do hub inválido '{}': {e}", self.hub.addr))
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.module.device_id.trim().is_empty() {
            errors.push(format!(
                "Identidade do módulo vazia (defina {ENV_MODULE_ID} ou module.device_id)"
            ));
        }
        if self.module.output_name.trim().is_empty() {
            errors.push("Nome da saída não pode ser vazio".into());
        }
        if !(SAMPLING_RATE_MIN_MS..=SAMPLING_RATE_MAX_MS).contains(&self.module.sampling_rate_ms) {
            errors.push(format!(
                "Intervalo de amostragem inválido: {} ({SAMPLING_RATE_MIN_MS}–{SAMPLING_RATE_MAX_MS} ms)",
                self.module.sampling_rate_ms
            ));
        }
        if let Err(e) = self.hub_addr() {
            errors.push(e);
        }
        if self.hub.retry_budget == 0 {
            errors.push("retry_budget do hub não pode ser 0".into());
        }
        if self.hub.response_timeout_ms == 0 {
            errors.push("response_timeout_ms do hub não pode ser 0".into());
        }
        if self.hub.heartbeat_interval_ms == 0 {
            errors.push("heartbeat_interval_ms do hub não pode ser 0".into());
        }

        errors
    }
}

/// Converte o `RuntimeLogLevel` para uma diretiva do `EnvFilter`.
///
/// Valores desconhecidos caem em `info`.
pub fn log_directive(level: Option<&str>) -> &'static str {
    match level.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
        Some("fatal") | Some("error") => "error",
        Some("warn") => "warn",
        Some("debug") => "debug",
        Some("verbose") => "trace",
        _ => "info",
    }
}
