//! Envelope de telemetria e mensagem de saída para o hub.
//!
//! O corpo JSON carrega apenas `deviceId`, `deviceTime`, `temperature` e
//! `humidity`; o número de sequência viaja como propriedade da mensagem.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::sensor::Reading;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_ENCODING_UTF8: &str = "UTF-8";

/// Nome da propriedade que carrega o contador do envelope.
pub const SEQUENCE_PROPERTY: &str = "sequence";

// ──────────────────────────────────────────────
// Envelope
// ──────────────────────────────────────────────

/// Uma leitura pronta para envio. Imutável depois de construída.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEnvelope {
    pub device_id: String,
    /// RFC3339 em UTC (ex: `2026-10-18T12:00:00.123456Z`)
    pub device_time: String,
    pub temperature: f64,
    pub humidity: i32,
    #[serde(skip)]
    pub sequence: u64,
}

impl TelemetryEnvelope {
    pub fn new(device_id: &str, at: DateTime<Utc>, reading: Reading, sequence: u64) -> Self {
        Self {
            device_id: device_id.to_owned(),
            device_time: at.to_rfc3339_opts(SecondsFormat::Micros, true),
            temperature: reading.temperature,
            humidity: reading.humidity,
            sequence,
        }
    }

    /// Serializa o corpo e monta a mensagem com content-type/encoding.
    pub fn to_message(&self) -> Result<OutboundMessage, serde_json::Error> {
        let body = serde_json::to_string(self)?;
        let mut properties = BTreeMap::new();
        properties.insert(SEQUENCE_PROPERTY.to_owned(), self.sequence.to_string());

        Ok(OutboundMessage {
            body,
            content_type: CONTENT_TYPE_JSON.to_owned(),
            content_encoding: CONTENT_ENCODING_UTF8.to_owned(),
            properties,
        })
    }
}

// ──────────────────────────────────────────────
// Mensagem
// ──────────────────────────────────────────────

/// Mensagem entregue ao transporte; o dono passa a ser o transporte.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub body: String,
    pub content_type: String,
    pub content_encoding: String,
    pub properties: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn sequence(&self) -> Option<u64> {
        self.properties.get(SEQUENCE_PROPERTY)?.parse().ok()
    }
}

// ──────────────────────────────────────────────
// Contador de sequência
// ──────────────────────────────────────────────

/// Contador monotônico compartilhável; o primeiro valor é 1.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter(Arc<AtomicU64>);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
