//! Contrato com a conexão duplex até o hub.
//!
//! O núcleo só conhece estas operações; socket, protocolo e política de
//! reconexão ficam com a implementação concreta.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::lifecycle::ConnectionEvent;
use crate::protocol::ProtocolError;
use crate::twin::ReportedDocument;
use crate::types::OutboundMessage;

/// Erros de entrega para o hub.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Erro de I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hub não respondeu em {0} ms")]
    Timeout(u64),

    #[error("Conexão ainda não foi aberta")]
    NotOpen,

    #[error("Erro de protocolo: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Callback para documentos desired empurrados pelo hub.
pub type DesiredConfigHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback para mudanças de status da conexão.
pub type ConnectionStatusHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Conexão gerenciada com o hub.
///
/// Os handlers são chamados a partir das tasks internas do transporte,
/// concorrentes ao loop de emissão.
pub trait Upstream: Send + Sync + 'static {
    /// Abre a conexão (handshake inicial).
    fn open(&self) -> impl Future<Output = Result<(), UpstreamError>> + Send;

    /// Envia uma mensagem de telemetria para a saída nomeada.
    fn send_event(
        &self,
        output: &str,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<(), UpstreamError>> + Send;

    /// Busca o documento desired completo.
    fn get_desired_config(&self) -> impl Future<Output = Result<Value, UpstreamError>> + Send;

    fn set_desired_config_handler(&self, handler: DesiredConfigHandler);

    /// Publica o documento reported.
    fn update_reported_config(
        &self,
        doc: &ReportedDocument,
    ) -> impl Future<Output = Result<(), UpstreamError>> + Send;

    fn set_connection_status_handler(&self, handler: ConnectionStatusHandler);

    /// Fecha a conexão; o transporte reporta `Disabled`/`ClientClose`.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

// ──────────────────────────────────────────────
// Upstream em memória para testes
// ──────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Grava tudo o que o núcleo envia; falhas podem ser ligadas por teste.
    #[derive(Default)]
    pub struct MemoryUpstream {
        pub sent: Mutex<Vec<(String, OutboundMessage)>>,
        pub reported: Mutex<Vec<ReportedDocument>>,
        pub desired: Mutex<Value>,
        pub desired_handler: Mutex<Option<DesiredConfigHandler>>,
        pub status_handler: Mutex<Option<ConnectionStatusHandler>>,
        pub fail_sends: AtomicBool,
        pub fail_reports: AtomicBool,
    }

    impl MemoryUpstream {
        pub fn sent_sequences(&self) -> Vec<u64> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, m)| m.sequence())
                .collect()
        }

        pub fn reported_rates(&self) -> Vec<u32> {
            self.reported
                .lock()
                .unwrap()
                .iter()
                .map(|d| d.sampling_rate)
                .collect()
        }

        /// Simula uma mudança de status reportada pelo transporte.
        pub fn emit_status(&self, event: ConnectionEvent) {
            let handler = self.status_handler.lock().unwrap().clone();
            if let Some(h) = handler {
                h(event);
            }
        }

        /// Simula um push do hub.
        pub fn push_desired(&self, doc: Value) {
            let handler = self.desired_handler.lock().unwrap().clone();
            if let Some(h) = handler {
                h(doc);
            }
        }
    }

    impl Upstream for MemoryUpstream {
        async fn open(&self) -> Result<(), UpstreamError> {
            Ok(())
        }

        async fn send_event(
            &self,
            output: &str,
            message: OutboundMessage,
        ) -> Result<(), UpstreamError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(UpstreamError::Timeout(10));
            }
            self.sent.lock().unwrap().push((output.to_owned(), message));
            Ok(())
        }

        async fn get_desired_config(&self) -> Result<Value, UpstreamError> {
            Ok(self.desired.lock().unwrap().clone())
        }

        fn set_desired_config_handler(&self, handler: DesiredConfigHandler) {
            *self.desired_handler.lock().unwrap() = Some(handler);
        }

        async fn update_reported_config(
            &self,
            doc: &ReportedDocument,
        ) -> Result<(), UpstreamError> {
            if self.fail_reports.load(Ordering::SeqCst) {
                return Err(UpstreamError::NotOpen);
            }
            self.reported.lock().unwrap().push(*doc);
            Ok(())
        }

        fn set_connection_status_handler(&self, handler: ConnectionStatusHandler) {
            *self.status_handler.lock().unwrap() = Some(handler);
        }

        async fn close(&self) {}
    }
}
