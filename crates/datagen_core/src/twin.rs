//! Sincronização da configuração remota (desired → reported).
//!
//! A única propriedade ajustável é `samplingrate` (ms). Valores inválidos
//! no documento desired são ignorados em silêncio; o valor efetivo é sempre
//! ecoado de volta no documento reported.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::upstream::{Upstream, UpstreamError};

/// Chave reconhecida nos documentos desired/reported.
pub const SAMPLING_RATE_KEY: &str = "samplingrate";

/// Faixa aceita: 1 ms até 1 minuto.
pub const SAMPLING_RATE_MIN_MS: u32 = 1;
pub const SAMPLING_RATE_MAX_MS: u32 = 60_000;

pub const DEFAULT_SAMPLING_RATE_MS: u32 = 1000;

/// Documento reported devolvido ao hub.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportedDocument {
    #[serde(rename = "samplingrate")]
    pub sampling_rate: u32,
}

/// Extrai `samplingrate` se for inteiro JSON dentro da faixa.
pub fn desired_sampling_rate(desired: &Value) -> Option<u32> {
    let raw = desired.get(SAMPLING_RATE_KEY)?.as_i64()?;
    u32::try_from(raw).ok().filter(|v| is_valid_sampling_rate(*v))
}

pub fn is_valid_sampling_rate(ms: u32) -> bool {
    (SAMPLING_RATE_MIN_MS..=SAMPLING_RATE_MAX_MS).contains(&ms)
}

/// Dono do intervalo de amostragem.
///
/// Escrito pelos callbacks de configuração, lido pelo loop a cada tick.
#[derive(Debug)]
pub struct ConfigSynchronizer {
    sampling_rate_ms: AtomicU32,
}

impl Default for ConfigSynchronizer {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLING_RATE_MS)
    }
}

impl ConfigSynchronizer {
    /// Valor inicial fora da faixa cai no padrão.
    pub fn new(initial_ms: u32) -> Self {
        let initial = if is_valid_sampling_rate(initial_ms) {
            initial_ms
        } else {
            warn!(
                "Intervalo inicial inválido: {initial_ms} ms. Usando padrão={DEFAULT_SAMPLING_RATE_MS} ms"
            );
            DEFAULT_SAMPLING_RATE_MS
        };
        Self {
            sampling_rate_ms: AtomicU32::new(initial),
        }
    }

    pub fn sampling_rate_ms(&self) -> u32 {
        self.sampling_rate_ms.load(Ordering::SeqCst)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.sampling_rate_ms()))
    }

    /// Aplica o documento desired e devolve o intervalo efetivo.
    pub fn merge(&self, desired: &Value) -> u32 {
        if let Some(rate) = desired_sampling_rate(desired) {
            let previous = self.sampling_rate_ms.swap(rate, Ordering::SeqCst);
            if previous != rate {
                info!("Ajustando samplingRate para {rate} ms");
            }
            rate
        } else {
            self.sampling_rate_ms()
        }
    }

    pub fn reported(&self) -> ReportedDocument {
        ReportedDocument {
            sampling_rate: self.sampling_rate_ms(),
        }
    }

    /// Merge + exatamente um envio do documento reported.
    ///
    /// A falha de entrega é devolvida ao chamador.
    pub async fn synchronize<U: Upstream>(
        &self,
        desired: &Value,
        upstream: &U,
    ) -> Result<u32, UpstreamError> {
        debug!("Desired recebido: {desired}");
        let effective = self.merge(desired);
        upstream
            .update_reported_config(&ReportedDocument {
                sampling_rate: effective,
            })
            .await?;
        Ok(effective)
    }

    /// Registra o sincronizador como handler de pushes do hub.
    ///
    /// O merge roda no próprio callback, na ordem de chegada. Os ecos vão
    /// para uma única task, que os envia na mesma ordem; erros de entrega só
    /// são logados.
    pub fn attach<U: Upstream>(self: &Arc<Self>, upstream: &Arc<U>) {
        let (tx, rx) = mpsc::unbounded_channel();
        // Weak: o handler (e com ele o `tx`) fica guardado no próprio upstream
        tokio::spawn(report_pending(rx, Arc::downgrade(upstream)));

        let sync = Arc::clone(self);
        upstream.set_desired_config_handler(Arc::new(move |desired: Value| {
            info!("Mudança de propriedade desired recebida");
            debug!("Desired recebido: {desired}");
            let effective = sync.merge(&desired);
            if tx.send(ReportedDocument { sampling_rate: effective }).is_err() {
                warn!("Task de eco encerrada, reported {effective} ms não enviado");
            }
        }));
    }
}

/// Drena os ecos pendentes até o upstream sumir.
async fn report_pending<U: Upstream>(
    mut rx: mpsc::UnboundedReceiver<ReportedDocument>,
    link: Weak<U>,
) {
    while let Some(doc) = rx.recv().await {
        let Some(link) = link.upgrade() else {
            break;
        };
        if let Err(e) = link.update_reported_config(&doc).await {
            warn!("Falha ao reportar configuração: {e}");
        }
    }
}
