//! # Datagen Module
//!
//! Módulo edge que gera leituras simuladas de temperatura/umidade e as
//! envia ao hub. O intervalo de amostragem vem do documento desired e é
//! ecoado no reported.
//!
//! Se o link esgotar as tentativas de reconexão o processo sai com código 1
//! e o supervisor (edge agent) o reinicia.
//!
//! ## Uso
//! ```bash
//! IOTEDGE_MODULEID=datagen UpstreamProtocol=MQTT RuntimeLogLevel=debug datagen
//! ```

mod udp_link;

use datagen_core::config::{AppConfig, ENV_LOG_LEVEL, log_directive};
use datagen_core::{
    ConfigSynchronizer, ConnectionMonitor, EmissionLoop, SensorModel, Shutdown, TransportProtocol,
    Upstream,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use udp_link::UdpHubLink;

#[tokio::main]
async fn main() -> ExitCode {
    // ── Logging ──
    let runtime_level = std::env::var(ENV_LOG_LEVEL).ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_directive(runtime_level.as_deref()).into()),
        )
        .init();

    info!("Módulo iniciando...");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), String> {
    // ── Carregar config ──
    let mut config =
        AppConfig::load_or_init(&AppConfig::default_path()).map_err(|e| e.to_string())?;

    config.apply_env();
    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("Configuração inválida: {e}");
        }
        return Err(format!("{} erro(s) de configuração", errors.len()));
    }

    let module = &config.module;
    let protocol = TransportProtocol::select(Some(module.upstream_protocol.as_str()));
    let hub_addr = config.hub_addr()?;

    // ── Link com o hub ──
    let shutdown = Shutdown::new();
    let link = UdpHubLink::bind(&config.hub, hub_addr, &module.device_id, protocol)
        .await
        .map_err(|e| format!("Falha ao criar socket UDP: {e}"))?;
    let link = Arc::new(link);

    link.set_connection_status_handler(ConnectionMonitor::new(shutdown.clone()).into_handler());
    link.open()
        .await
        .map_err(|e| format!("Falha ao abrir link com o hub {hub_addr}: {e}"))?;
    info!("Cliente do módulo inicializado usando {protocol}");

    // ── Configuração remota ──
    let synchronizer = Arc::new(ConfigSynchronizer::new(module.sampling_rate_ms));
    let desired = link
        .get_desired_config()
        .await
        .map_err(|e| format!("Falha ao buscar desired inicial: {e}"))?;
    synchronizer
        .synchronize(&desired, link.as_ref())
        .await
        .map_err(|e| format!("Falha ao reportar configuração inicial: {e}"))?;
    synchronizer.attach(&link);

    // ── Encerramento ──
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.trigger();
    });

    // ── Loop principal ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   ⚡ DATAGEN – ATIVO (Rust)");
    println!("══════════════════════════════════════════════");
    println!("  Módulo:    {}", module.device_id);
    println!("  Hub:       {hub_addr} ({protocol})");
    println!("  Intervalo: {} ms", synchronizer.sampling_rate_ms());
    println!("══════════════════════════════════════════════");
    println!();

    let mut emission = EmissionLoop::new(
        module.device_id.clone(),
        SensorModel::from_entropy(),
        Arc::clone(&synchronizer),
        Arc::clone(&link),
    )
    .with_output(module.output_name.clone());
    emission.run(shutdown.subscribe()).await;

    link.close().await;
    info!("Módulo encerrado");
    Ok(())
}

/// Espera Ctrl+C ou SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Falha ao instalar handler de Ctrl+C");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Falha ao instalar handler de sinal")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Sinal de encerramento recebido");
}
