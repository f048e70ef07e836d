//! Loop de emissão – gera, envia e dorme até o cancelamento.

use chrono::Utc;
use rand::rngs::StdRng;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::sensor::{SensorDraws, SensorModel};
use crate::twin::ConfigSynchronizer;
use crate::types::{OutboundMessage, SequenceCounter, TelemetryEnvelope};
use crate::upstream::Upstream;

/// Saída padrão usada nas mensagens de telemetria.
pub const DEFAULT_OUTPUT: &str = "output1";

// ──────────────────────────────────────────────
// Sinal de encerramento
// ──────────────────────────────────────────────

/// Flag de cancelamento compartilhada (Ctrl+C, SIGTERM ou conexão fatal).
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Lado que espera pelo cancelamento.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve quando o cancelamento for disparado.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Todos os `Shutdown` foram descartados: nunca haverá cancelamento
            std::future::pending::<()>().await;
        }
    }
}

// ──────────────────────────────────────────────
// Loop
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopped,
}

pub struct EmissionLoop<U, D = StdRng> {
    device_id: String,
    output: String,
    sensor: SensorModel<D>,
    sequence: SequenceCounter,
    config: Arc<ConfigSynchronizer>,
    upstream: Arc<U>,
    state: LoopState,
}

impl<U: Upstream, D: SensorDraws> EmissionLoop<U, D> {
    pub fn new(
        device_id: impl Into<String>,
        sensor: SensorModel<D>,
        config: Arc<ConfigSynchronizer>,
        upstream: Arc<U>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            output: DEFAULT_OUTPUT.to_owned(),
            sensor,
            sequence: SequenceCounter::new(),
            config,
            upstream,
            state: LoopState::Running,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_sequence(mut self, sequence: SequenceCounter) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn sequence(&self) -> &SequenceCounter {
        &self.sequence
    }

    /// Roda até o cancelamento. Envio e espera são interrompíveis.
    ///
    /// Uma mudança de intervalo vale a partir do próximo tick.
    pub async fn run(&mut self, mut shutdown: ShutdownListener) -> LoopState {
        while self.state == LoopState::Running && !shutdown.is_cancelled() {
            if let Some((count, message)) = self.next_message() {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    result = self.upstream.send_event(&self.output, message) => match result {
                        Ok(()) => debug!("Mensagem {count} enviada"),
                        Err(e) => warn!("Falha ao enviar mensagem {count}: {e}"),
                    },
                }
            }

            let interval = self.config.interval();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.state = LoopState::Stopped;
        info!("Loop de emissão parado após {} mensagens", self.sequence.current());
        self.state
    }

    fn next_message(&mut self) -> Option<(u64, OutboundMessage)> {
        let count = self.sequence.next();
        let reading = self.sensor.next();
        let envelope = TelemetryEnvelope::new(&self.device_id, Utc::now(), reading, count);

        match envelope.to_message() {
            Ok(message) => {
                info!("Enviando mensagem: Contador: {count}, Corpo: [{}]", message.body);
                Some((count, message))
            }
            Err(e) => {
                error!("Erro ao serializar envelope {count}: {e}");
                None
            }
        }
    }
}
