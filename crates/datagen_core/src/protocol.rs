//! Protocolo do link com o hub (datagramas UDP).
//!
//! Formato do frame:
//!
//! ```text
//! ┌──────────┬─────────┬───────────────────┐
//! │ Magic(1) │ Ver.(1) │ Frame JSON (N)    │
//! └──────────┴─────────┴───────────────────┘
//! ```
//!
//! - Magic byte `0x44` ('D') identifica pacotes do gerador
//! - Versão do protocolo (1 byte)
//! - Frame JSON com tag `type` (ver [`HubFrame`])

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lifecycle::TransportProtocol;
use crate::types::OutboundMessage;

/// Magic byte que identifica pacotes do link com o hub.
pub const MAGIC_BYTE: u8 = 0x44; // 'D'

/// Versão atual do protocolo.
pub const PROTOCOL_VERSION: u8 = 1;

/// Tamanho do header (magic + version).
const HEADER_SIZE: usize = 2;

/// Tamanho máximo de pacote UDP seguro (sem fragmentação).
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// Erros do protocolo.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Pacote muito curto ({0} bytes, mínimo {HEADER_SIZE})")]
    TooShort(usize),

    #[error("Magic byte inválido: 0x{0:02X} (esperado 0x{MAGIC_BYTE:02X})")]
    InvalidMagic(u8),

    #[error("Versão incompatível: {0} (suportada: {PROTOCOL_VERSION})")]
    VersionMismatch(u8),

    #[error("Frame grande demais ({0} bytes, máximo {MAX_UDP_PAYLOAD})")]
    TooLarge(usize),

    #[error("Erro de serialização: {0}")]
    Serialize(String),

    #[error("Erro de deserialização: {0}")]
    Deserialize(String),
}

/// Frames trocados entre módulo e hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    /// Módulo → hub: abertura da conexão.
    Hello {
        device_id: String,
        protocol: TransportProtocol,
    },
    /// Hub → módulo: conexão aceita.
    HelloAck,
    /// Módulo → hub: uma mensagem de telemetria.
    Telemetry {
        output: String,
        message: OutboundMessage,
    },
    /// Módulo → hub: documento reported.
    Reported { properties: Value },
    /// Módulo → hub: pede o documento desired completo.
    DesiredRequest,
    /// Hub → módulo: resposta ao `DesiredRequest`.
    DesiredSnapshot { properties: Value },
    /// Hub → módulo: desired alterado pelo operador.
    DesiredPatch { properties: Value },
    /// Módulo → hub: pedido de sinal de vida.
    Heartbeat,
    /// Hub → módulo: resposta ao `Heartbeat`.
    HeartbeatAck,
}

/// Codifica um [`HubFrame`] para transmissão UDP.
///
/// Retorna bytes no formato: `[MAGIC][VERSION][json...]`
pub fn encode_frame(frame: &HubFrame) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(frame).map_err(|e| ProtocolError::Serialize(e.to_string()))?;

    let total = HEADER_SIZE + body.len();
    if total > MAX_UDP_PAYLOAD {
        return Err(ProtocolError::TooLarge(total));
    }

    let mut packet = Vec::with_capacity(total);
    packet.push(MAGIC_BYTE);
    packet.push(PROTOCOL_VERSION);
    packet.extend_from_slice(&body);

    Ok(packet)
}

/// Decodifica bytes recebidos via UDP em [`HubFrame`].
///
/// Valida magic byte e versão antes de deserializar.
pub fn decode_frame(data: &[u8]) -> Result<HubFrame, ProtocolError> {
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::TooShort(data.len()));
    }

    let magic = data[0];
    if magic != MAGIC_BYTE {
        return Err(ProtocolError::InvalidMagic(magic));
    }

    let version = data[1];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(version));
    }

    serde_json::from_slice(&data[HEADER_SIZE..])
        .map_err(|e| ProtocolError::Deserialize(e.to_string()))
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
