//! Link UDP com o hub – implementação concreta de [`Upstream`].
//!
//! Uma task de recepção escuta o socket e despacha respostas/pushes do hub.
//! Depois do `open`, uma task de heartbeat pede sinal de vida ao hub a cada
//! `heartbeat_interval_ms`. Heartbeats sem resposta, erros de envio e erros de
//! recepção consomem o `retry_budget`; ao esgotá-lo o link reporta
//! `RetryExpired`.

use datagen_core::config::HubConfig;
use datagen_core::lifecycle::{ConnectionChangeReason, ConnectionEvent, ConnectionStatus};
use datagen_core::protocol::{HubFrame, ProtocolError, decode_frame, encode_frame};
use datagen_core::twin::ReportedDocument;
use datagen_core::types::OutboundMessage;
use datagen_core::upstream::{ConnectionStatusHandler, DesiredConfigHandler, Upstream, UpstreamError};
use datagen_core::TransportProtocol;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

type Pending<T> = Mutex<Option<oneshot::Sender<T>>>;

/// Pausa após erro de recepção, para não girar em falso.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Último status reportado + contador de falhas consecutivas.
#[derive(Debug, Default)]
struct Health {
    last: Option<ConnectionEvent>,
    failures: u32,
}

/// Socket, handlers e estado compartilhados entre o link e suas tasks.
struct LinkCore {
    socket: UdpSocket,
    hub: SocketAddr,
    retry_budget: u32,
    response_timeout: Duration,
    desired_handler: Mutex<Option<DesiredConfigHandler>>,
    status_handler: Mutex<Option<ConnectionStatusHandler>>,
    pending_hello: Pending<()>,
    pending_heartbeat: Pending<()>,
    pending_desired: Pending<Value>,
    health: Mutex<Health>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn answer<T>(slot: &Pending<T>, value: T, what: &str) {
    match lock(slot).take() {
        Some(tx) => {
            let _ = tx.send(value);
        }
        None => debug!("{what} sem requisição pendente, ignorando"),
    }
}

impl LinkCore {
    fn dispatch(&self, frame: HubFrame) {
        match frame {
            HubFrame::HelloAck => answer(&self.pending_hello, (), "HelloAck"),
            HubFrame::HeartbeatAck => answer(&self.pending_heartbeat, (), "HeartbeatAck"),
            HubFrame::DesiredSnapshot { properties } => {
                answer(&self.pending_desired, properties, "Snapshot desired")
            }
            HubFrame::DesiredPatch { properties } => {
                let handler = lock(&self.desired_handler).clone();
                match handler {
                    Some(h) => h(properties),
                    None => debug!("Desired recebido sem handler registrado"),
                }
            }
            other => debug!("Frame inesperado do hub: {other:?}"),
        }
    }

    /// Registra o resultado de uma operação e emite o evento se o status mudou.
    fn record(&self, ok: bool) {
        let event = {
            let mut health = lock(&self.health);
            let next = if ok {
                health.failures = 0;
                ConnectionEvent::new(ConnectionStatus::Connected, ConnectionChangeReason::ConnectionOk)
            } else {
                health.failures = health.failures.saturating_add(1);
                let reason = if health.failures >= self.retry_budget {
                    ConnectionChangeReason::RetryExpired
                } else {
                    ConnectionChangeReason::CommunicationError
                };
                ConnectionEvent::new(ConnectionStatus::Disconnected, reason)
            };
            Self::transition(&mut health, next)
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn transition(health: &mut Health, next: ConnectionEvent) -> Option<ConnectionEvent> {
        if health.last.as_ref() == Some(&next) {
            return None;
        }
        health.last = Some(next.clone());
        Some(next)
    }

    fn emit(&self, event: ConnectionEvent) {
        let handler = lock(&self.status_handler).clone();
        match handler {
            Some(h) => h(event),
            None => debug!("Status {} ({}) sem handler registrado", event.status, event.reason),
        }
    }

    async fn transmit(&self, frame: &HubFrame) -> Result<(), UpstreamError> {
        let packet = encode_frame(frame)?;
        self.socket.send_to(&packet, self.hub).await?;
        Ok(())
    }

    /// Envio sem resposta.
    ///
    /// `send_to` num socket UDP não prova que o hub está vivo: só a falha
    /// entra na contagem de saúde.
    async fn deliver(&self, frame: &HubFrame) -> Result<(), UpstreamError> {
        let result = self.transmit(frame).await;
        if result.is_err() {
            self.record(false);
        }
        result
    }

    /// Envio que espera uma resposta do hub no `slot` indicado.
    async fn request<T>(
        &self,
        frame: &HubFrame,
        slot: fn(&LinkCore) -> &Pending<T>,
    ) -> Result<T, UpstreamError> {
        let (tx, rx) = oneshot::channel();
        *lock(slot(self)) = Some(tx);

        let result = match self.transmit(frame).await {
            Ok(()) => match tokio::time::timeout(self.response_timeout, rx).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(UpstreamError::NotOpen),
                Err(_) => Err(UpstreamError::Timeout(self.response_timeout.as_millis() as u64)),
            },
            Err(e) => Err(e),
        };

        if result.is_err() {
            lock(slot(self)).take();
        }
        self.record(result.is_ok());
        result
    }
}

/// Conexão UDP com o hub.
pub struct UdpHubLink {
    core: Arc<LinkCore>,
    device_id: String,
    protocol: TransportProtocol,
    heartbeat_interval: Duration,
    opened: AtomicBool,
    receiver: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl UdpHubLink {
    /// Cria o socket local; nada é enviado até [`Upstream::open`].
    pub async fn bind(
        config: &HubConfig,
        hub: SocketAddr,
        device_id: &str,
        protocol: TransportProtocol,
    ) -> std::io::Result<Self> {
        let bind_addr = if config.bind_ip.is_empty() {
            if hub.is_ipv6() { "[::]:0".to_string() } else { "0.0.0.0:0".to_string() }
        } else {
            format!("{}:0", config.bind_ip)
        };
        let socket = UdpSocket::bind(bind_addr.as_str()).await?;
        debug!("Socket do link em {}", socket.local_addr()?);

        let core = LinkCore {
            socket,
            hub,
            retry_budget: config.retry_budget.max(1),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            desired_handler: Mutex::new(None),
            status_handler: Mutex::new(None),
            pending_hello: Mutex::new(None),
            pending_heartbeat: Mutex::new(None),
            pending_desired: Mutex::new(None),
            health: Mutex::new(Health::default()),
        };

        Ok(Self {
            core: Arc::new(core),
            device_id: device_id.to_owned(),
            protocol,
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            opened: AtomicBool::new(false),
            receiver: Mutex::new(None),
            heartbeat: Mutex::new(None),
        })
    }

    fn ensure_open(&self) -> Result<(), UpstreamError> {
        if self.opened.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(UpstreamError::NotOpen)
        }
    }

    fn start_receiver(&self) {
        let mut slot = lock(&self.receiver);
        if slot.is_none() {
            *slot = Some(tokio::spawn(receive_loop(Arc::clone(&self.core))));
        }
    }

    fn start_heartbeat(&self) {
        let mut slot = lock(&self.heartbeat);
        if slot.is_none() {
            *slot = Some(tokio::spawn(heartbeat_loop(
                Arc::clone(&self.core),
                self.heartbeat_interval,
            )));
        }
    }
}

impl Upstream for UdpHubLink {
    async fn open(&self) -> Result<(), UpstreamError> {
        self.start_receiver();
        let hello = HubFrame::Hello {
            device_id: self.device_id.clone(),
            protocol: self.protocol,
        };
        self.core.request(&hello, |c| &c.pending_hello).await?;
        self.opened.store(true, Ordering::SeqCst);
        self.start_heartbeat();
        info!("Link com o hub {} aberto usando {}", self.core.hub, self.protocol);
        Ok(())
    }

    async fn send_event(&self, output: &str, message: OutboundMessage) -> Result<(), UpstreamError> {
        self.ensure_open()?;
        self.core
            .deliver(&HubFrame::Telemetry {
                output: output.to_owned(),
                message,
            })
            .await
    }

    async fn get_desired_config(&self) -> Result<Value, UpstreamError> {
        self.ensure_open()?;
        self.core
            .request(&HubFrame::DesiredRequest, |c| &c.pending_desired)
            .await
    }

    fn set_desired_config_handler(&self, handler: DesiredConfigHandler) {
        *lock(&self.core.desired_handler) = Some(handler);
    }

    async fn update_reported_config(&self, doc: &ReportedDocument) -> Result<(), UpstreamError> {
        self.ensure_open()?;
        let properties = serde_json::to_value(doc)
            .map_err(|e| UpstreamError::Protocol(ProtocolError::Serialize(e.to_string())))?;
        self.core.deliver(&HubFrame::Reported { properties }).await
    }

    fn set_connection_status_handler(&self, handler: ConnectionStatusHandler) {
        *lock(&self.core.status_handler) = Some(handler);
    }

    async fn close(&self) {
        for slot in [&self.heartbeat, &self.receiver] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
        if !self.opened.swap(false, Ordering::SeqCst) {
            return;
        }

        let closed = ConnectionEvent::new(ConnectionStatus::Disabled, ConnectionChangeReason::ClientClose);
        let event = LinkCore::transition(&mut lock(&self.core.health), closed);
        if let Some(event) = event {
            self.core.emit(event);
        }
        info!("Link com o hub {} fechado", self.core.hub);
    }
}

async fn receive_loop(core: Arc<LinkCore>) {
    let hub = core.hub;
    let mut buf = vec![0u8; 65536];
    loop {
        match core.socket.recv_from(&mut buf).await {
            Ok((size, addr)) => {
                // Só o hub configurado fala com o módulo
                if addr != hub {
                    debug!("Ignorando pacote de {addr} (esperado: {hub})");
                    continue;
                }
                match decode_frame(&buf[..size]) {
                    Ok(frame) => core.dispatch(frame),
                    Err(e) => debug!("Pacote inválido de {addr}: {e}"),
                }
            }
            Err(e) => {
                warn!("Erro ao receber UDP: {e}");
                core.record(false);
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Pede sinal de vida ao hub a cada `period`; a falta de resposta conta como falha.
async fn heartbeat_loop(core: Arc<LinkCore>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = core.request(&HubFrame::Heartbeat, |c| &c.pending_heartbeat).await {
            debug!("Heartbeat sem resposta do hub {}: {e}", core.hub);
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Hub falso em loopback.
    struct FakeHub {
        socket: UdpSocket,
    }

    impl FakeHub {
        async fn start() -> Self {
            Self {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        async fn recv(&self) -> (HubFrame, SocketAddr) {
            let mut buf = vec![0u8; 65536];
            let (size, from) = self.socket.recv_from(&mut buf).await.unwrap();
            (decode_frame(&buf[..size]).unwrap(), from)
        }

        async fn send(&self, frame: &HubFrame, to: SocketAddr) {
            self.socket
                .send_to(&encode_frame(frame).unwrap(), to)
                .await
                .unwrap();
        }

        /// Responde ao `hello` e devolve o frame recebido.
        async fn accept(&self) -> (HubFrame, SocketAddr) {
            let (hello, from) = self.recv().await;
            self.send(&HubFrame::HelloAck, from).await;
            (hello, from)
        }
    }

    /// Heartbeat longo o bastante para não aparecer nos testes comuns.
    const QUIET_HEARTBEAT_MS: u64 = 60_000;

    fn hub_config(timeout_ms: u64, retry_budget: u32, heartbeat_ms: u64) -> HubConfig {
        HubConfig {
            addr: String::new(),
            bind_ip: "127.0.0.1".into(),
            retry_budget,
            response_timeout_ms: timeout_ms,
            heartbeat_interval_ms: heartbeat_ms,
        }
    }

    async fn link_with_heartbeat(
        hub: SocketAddr,
        timeout_ms: u64,
        retry_budget: u32,
        heartbeat_ms: u64,
    ) -> Arc<UdpHubLink> {
        let link = UdpHubLink::bind(
            &hub_config(timeout_ms, retry_budget, heartbeat_ms),
            hub,
            "datagen-test",
            TransportProtocol::Amqp,
        )
        .await
        .unwrap();
        Arc::new(link)
    }

    async fn link_to(hub: SocketAddr, timeout_ms: u64, retry_budget: u32) -> Arc<UdpHubLink> {
        link_with_heartbeat(hub, timeout_ms, retry_budget, QUIET_HEARTBEAT_MS).await
    }

    fn telemetry(sequence: u64) -> OutboundMessage {
        OutboundMessage {
            body: r#"{"deviceId":"datagen-test"}"#.into(),
            content_type: "application/json".into(),
            content_encoding: "UTF-8".into(),
            properties: [("sequence".to_string(), sequence.to_string())].into(),
        }
    }

    fn recorded_events(link: &UdpHubLink) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        link.set_connection_status_handler(Arc::new(move |e: ConnectionEvent| {
            sink.lock().unwrap().push(e)
        }));
        events
    }

    async fn open_against(hub: &FakeHub, link: &Arc<UdpHubLink>) -> (HubFrame, SocketAddr) {
        let opener = Arc::clone(link);
        let open = tokio::spawn(async move { opener.open().await });
        let accepted = hub.accept().await;
        open.await.unwrap().unwrap();
        accepted
    }

    #[tokio::test]
    async fn open_performs_handshake() {
        let hub = FakeHub::start().await;
        let link = link_to(hub.addr(), 2000, 3).await;
        let events = recorded_events(&link);

        let (hello, _) = open_against(&hub, &link).await;

        assert_eq!(
            hello,
            HubFrame::Hello {
                device_id: "datagen-test".into(),
                protocol: TransportProtocol::Amqp,
            }
        );
        assert_eq!(
            *events.lock().unwrap(),
            vec![ConnectionEvent::new(
                ConnectionStatus::Connected,
                ConnectionChangeReason::ConnectionOk
            )]
        );
    }

    #[tokio::test]
    async fn operations_require_open() {
        let hub = FakeHub::start().await;
        let link = link_to(hub.addr(), 100, 3).await;
        assert!(matches!(
            link.get_desired_config().await,
            Err(UpstreamError::NotOpen)
        ));
        assert!(matches!(
            link.update_reported_config(&ReportedDocument { sampling_rate: 10 })
                .await,
            Err(UpstreamError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn desired_snapshot_answers_request() {
        let hub = FakeHub::start().await;
        let link = link_to(hub.addr(), 2000, 3).await;
        open_against(&hub, &link).await;

        let requester = Arc::clone(&link);
        let fetch = tokio::spawn(async move { requester.get_desired_config().await });

        let (frame, from) = hub.recv().await;
        assert_eq!(frame, HubFrame::DesiredRequest);
        hub.send(
            &HubFrame::DesiredSnapshot {
                properties: json!({ "samplingrate": 500, "$version": 2 }),
            },
            from,
        )
        .await;

        let desired = fetch.await.unwrap().unwrap();
        assert_eq!(desired["samplingrate"], 500);
    }

    #[tokio::test]
    async fn telemetry_and_reported_reach_the_hub() {
        let hub = FakeHub::start().await;
        let link = link_to(hub.addr(), 2000, 3).await;
        open_against(&hub, &link).await;

        let message = telemetry(1);
        link.send_event("output1", message.clone()).await.unwrap();
        link.update_reported_config(&ReportedDocument { sampling_rate: 750 })
            .await
            .unwrap();

        assert_eq!(
            hub.recv().await.0,
            HubFrame::Telemetry {
                output: "output1".into(),
                message,
            }
        );
        assert_eq!(
            hub.recv().await.0,
            HubFrame::Reported {
                properties: json!({ "samplingrate": 750 })
            }
        );
    }

    #[tokio::test]
    async fn pushed_desired_reaches_handler() {
        let hub = FakeHub::start().await;
        let link = link_to(hub.addr(), 2000, 3).await;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        link.set_desired_config_handler(Arc::new(move |doc: Value| {
            let _ = tx.send(doc);
        }));
        let (_, from) = open_against(&hub, &link).await;

        hub.send(
            &HubFrame::DesiredPatch {
                properties: json!({ "samplingrate": 250 }),
            },
            from,
        )
        .await;

        let mut rx = rx;
        let doc = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc, json!({ "samplingrate": 250 }));
    }

    #[tokio::test]
    async fn strangers_are_ignored() {
        let hub = FakeHub::start().await;
        let link = link_to(hub.addr(), 2000, 3).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        link.set_desired_config_handler(Arc::new(move |doc: Value| {
            let _ = tx.send(doc);
        }));
        let (_, from) = open_against(&hub, &link).await;

        let stranger = FakeHub::start().await;
        stranger
            .send(
                &HubFrame::DesiredPatch {
                    properties: json!({ "samplingrate": 5 }),
                },
                from,
            )
            .await;

        let got = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(got.is_err(), "pacote de estranho não deveria chegar ao handler");
    }

    #[tokio::test]
    async fn silent_hub_exhausts_retry_budget() {
        let hub = FakeHub::start().await;
        let link = link_to(hub.addr(), 50, 2).await;
        let events = recorded_events(&link);

        assert!(matches!(link.open().await, Err(UpstreamError::Timeout(50))));
        assert!(matches!(link.open().await, Err(UpstreamError::Timeout(50))));

        let reasons: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.status, e.reason.clone()))
            .collect();
        assert_eq!(
            reasons,
            vec![
                (
                    ConnectionStatus::Disconnected,
                    ConnectionChangeReason::CommunicationError
                ),
                (
                    ConnectionStatus::Disconnected,
                    ConnectionChangeReason::RetryExpired
                ),
            ]
        );
    }

    #[tokio::test]
    async fn dead_hub_is_detected_by_heartbeat() {
        let hub = FakeHub::start().await;
        let link = link_with_heartbeat(hub.addr(), 50, 2, 30).await;
        let events = recorded_events(&link);
        open_against(&hub, &link).await;
        drop(hub);

        // Envios sem resposta continuam "funcionando" num socket UDP
        for seq in 1..=5 {
            link.send_event("output1", telemetry(seq)).await.unwrap();
        }

        let expired = ConnectionEvent::new(
            ConnectionStatus::Disconnected,
            ConnectionChangeReason::RetryExpired,
        );
        for _ in 0..200 {
            if events.lock().unwrap().contains(&expired) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ConnectionEvent::new(
                    ConnectionStatus::Connected,
                    ConnectionChangeReason::ConnectionOk
                ),
                ConnectionEvent::new(
                    ConnectionStatus::Disconnected,
                    ConnectionChangeReason::CommunicationError
                ),
                expired,
            ]
        );
    }

    #[tokio::test]
    async fn answered_heartbeats_keep_link_connected() {
        let hub = Arc::new(FakeHub::start().await);
        let link = link_with_heartbeat(hub.addr(), 1000, 2, 20).await;
        let events = recorded_events(&link);
        open_against(&hub, &link).await;

        let responder = Arc::clone(&hub);
        let beats = tokio::spawn(async move {
            let mut seen = 0;
            while seen < 5 {
                let (frame, from) = responder.recv().await;
                if frame == HubFrame::Heartbeat {
                    responder.send(&HubFrame::HeartbeatAck, from).await;
                    seen += 1;
                }
            }
        });
        tokio::time::timeout(Duration::from_secs(5), beats)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![ConnectionEvent::new(
                ConnectionStatus::Connected,
                ConnectionChangeReason::ConnectionOk
            )]
        );
        link.close().await;
    }

    #[tokio::test]
    async fn close_reports_client_close() {
        let hub = FakeHub::start().await;
        let link = link_to(hub.addr(), 2000, 3).await;
        let events = recorded_events(&link);
        open_against(&hub, &link).await;

        link.close().await;

        let last = events.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.status, ConnectionStatus::Disabled);
        assert_eq!(last.reason, ConnectionChangeReason::ClientClose);
        assert!(matches!(
            link.send_event("output1", telemetry(2)).await,
            Err(UpstreamError::NotOpen)
        ));
    }
}
