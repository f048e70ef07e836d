//! Ciclo de vida da conexão com o hub.
//!
//! O transporte cuida das próprias reconexões. Aqui só se decide entre
//! seguir rodando ou derrubar o processo para o supervisor reiniciar.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::emission::Shutdown;
use crate::upstream::ConnectionStatusHandler;

/// Código de saída quando a conexão não tem mais recuperação.
pub const FATAL_EXIT_CODE: i32 = 1;

// ──────────────────────────────────────────────
// Eventos de conexão
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Disabled,
    Suspended,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Disabled => "Disabled",
            ConnectionStatus::Suspended => "Suspended",
        };
        f.write_str(s)
    }
}

/// Motivo da mudança de status. `Other` cobre motivos desconhecidos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionChangeReason {
    ConnectionOk,
    ExpiredSasToken,
    DeviceDisabled,
    BadCredential,
    RetryExpired,
    NoNetwork,
    CommunicationError,
    ClientClose,
    Other(String),
}

impl fmt::Display for ConnectionChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionChangeReason::ConnectionOk => f.write_str("ConnectionOk"),
            ConnectionChangeReason::ExpiredSasToken => f.write_str("ExpiredSasToken"),
            ConnectionChangeReason::DeviceDisabled => f.write_str("DeviceDisabled"),
            ConnectionChangeReason::BadCredential => f.write_str("BadCredential"),
            ConnectionChangeReason::RetryExpired => f.write_str("RetryExpired"),
            ConnectionChangeReason::NoNetwork => f.write_str("NoNetwork"),
            ConnectionChangeReason::CommunicationError => f.write_str("CommunicationError"),
            ConnectionChangeReason::ClientClose => f.write_str("ClientClose"),
            ConnectionChangeReason::Other(s) => write!(f, "Other({s})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub status: ConnectionStatus,
    pub reason: ConnectionChangeReason,
}

impl ConnectionEvent {
    pub fn new(status: ConnectionStatus, reason: ConnectionChangeReason) -> Self {
        Self { status, reason }
    }
}

/// Decisão tomada para um evento.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Terminate,
}

/// `Terminate` somente quando o transporte esgotou as tentativas.
pub fn classify(event: &ConnectionEvent) -> Action {
    match event.reason {
        ConnectionChangeReason::RetryExpired => Action::Terminate,
        _ => Action::Continue,
    }
}

// ──────────────────────────────────────────────
// Monitor
// ──────────────────────────────────────────────

type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

fn exit_process(code: i32) {
    std::process::exit(code)
}

/// Aplica a decisão de [`classify`]: loga e, se fatal, encerra o processo.
pub struct ConnectionMonitor {
    shutdown: Shutdown,
    exit: ExitHook,
}

impl ConnectionMonitor {
    pub fn new(shutdown: Shutdown) -> Self {
        Self::with_exit_hook(shutdown, Arc::new(exit_process))
    }

    pub fn with_exit_hook(shutdown: Shutdown, exit: ExitHook) -> Self {
        Self { shutdown, exit }
    }

    pub fn handle(&self, event: &ConnectionEvent) -> Action {
        info!(
            "Conexão do módulo mudou. Novo status={} Motivo={}",
            event.status, event.reason
        );

        let action = classify(event);
        if action == Action::Terminate {
            error!("Conexão não pode ser restabelecida. Encerrando o módulo");
            self.shutdown.trigger();
            (self.exit)(FATAL_EXIT_CODE);
        }
        action
    }

    /// Handler pronto para [`crate::upstream::Upstream::set_connection_status_handler`].
    pub fn into_handler(self) -> ConnectionStatusHandler {
        let monitor = Arc::new(self);
        Arc::new(move |event: ConnectionEvent| {
            monitor.handle(&event);
        })
    }
}

// ──────────────────────────────────────────────
// Protocolo de transporte
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Mqtt,
    Amqp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Mqtt => f.write_str("MQTT"),
            TransportProtocol::Amqp => f.write_str("AMQP"),
        }
    }
}

impl TransportProtocol {
    /// Escolhe o protocolo a partir do valor configurado (sem diferenciar caixa).
    ///
    /// Vazio usa o padrão; valor desconhecido usa o padrão com warning.
    pub fn select(raw: Option<&str>) -> Self {
        let default = TransportProtocol::default();
        let Some(value) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
            return default;
        };

        match value.to_ascii_uppercase().as_str() {
            "AMQP" => TransportProtocol::Amqp,
            "MQTT" => TransportProtocol::Mqtt,
            _ => {
                warn!("Ignorando UpstreamProtocol desconhecido={value}. Usando padrão={default}");
                default
            }
        }
    }
}
