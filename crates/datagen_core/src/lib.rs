//! # Datagen Core
//!
//! Núcleo do módulo gerador de dados: modelo de sensor simulado,
//! sincronização da configuração remota, ciclo de vida da conexão e o loop
//! que emite a telemetria para o hub.
//!
//! ## Módulos
//! - [`sensor`] – Random walk de temperatura/umidade com anomalias
//! - [`twin`] – Merge do documento desired e eco do reported
//! - [`lifecycle`] – Classificação de eventos de conexão e protocolo
//! - [`emission`] – Loop de emissão e sinal de encerramento
//! - [`types`] – Envelope de telemetria e mensagem de saída
//! - [`upstream`] – Contrato com a conexão até o hub
//! - [`protocol`] – Frames do link UDP com magic byte
//! - [`config`] – Configuração via TOML + ambiente

pub mod sensor;
pub mod twin;
pub mod lifecycle;
pub mod emission;
pub mod types;
pub mod upstream;
pub mod protocol;
pub mod config;

// Re-exports convenientes
pub use config::AppConfig;
pub use emission::{EmissionLoop, LoopState, Shutdown, ShutdownListener};
pub use lifecycle::{Action, ConnectionEvent, ConnectionMonitor, TransportProtocol};
pub use sensor::SensorModel;
pub use twin::ConfigSynchronizer;
pub use upstream::{Upstream, UpstreamError};
