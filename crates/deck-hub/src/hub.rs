use crate::{
    registry::Registry,
    supervisor::{Supervisor, SupervisorEvent},
};
use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use deck_core::control_ipc::{
    decode_envelope, encode_text, AckPayload, ConnectedPayload, ErrorPayload, LogMessagePayload,
    LogsPayload, StatusPayload, WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES,
};
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

const SERVER_NAME: &str = "deck-hub";
const CLIENT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub debug: bool,
    pub allow_remote: bool,
    pub stale_after: Option<Duration>,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub status_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            debug: false,
            allow_remote: false,
            stale_after: Some(Duration::from_secs(30)),
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            status_interval: Duration::from_secs(5),
        }
    }
}

struct Client {
    conn_id: String,
    remote: SocketAddr,
    sender: mpsc::Sender<Message>,
    last_seen: AsyncMutex<Instant>,
}

impl Client {
    async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    async fn last_seen(&self) -> Instant {
        *self.last_seen.lock().await
    }

    async fn send_text(&self, text: String) -> bool {
        self.sender.send(Message::Text(text)).await.is_ok()
    }

    async fn close(&self, reason: &str) {
        let _ = self
            .sender
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1008,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

pub struct HubState {
    config: HubConfig,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    registry: Registry,
    supervisor: Supervisor,
}

impl HubState {
    pub fn new(config: HubConfig, registry: Registry, supervisor: Supervisor) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            registry,
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    async fn register_client(&self, client: Arc<Client>) {
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client.clone());
        info!(event = "client_connected", conn_id = %client.conn_id, remote = %client.remote);
    }

    async fn remove_client(&self, client: &Client, reason: &str) {
        let removed = self.clients.write().await.remove(&client.conn_id).is_some();
        if !removed {
            return;
        }
        client.close(reason).await;
        info!(event = "client_disconnected", conn_id = %client.conn_id, reason = reason);
    }

    async fn snapshot_clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().await.values().cloned().collect()
    }

    async fn send(&self, client: &Client, msg: WireMsg, request_id: Option<&str>) -> bool {
        let mut envelope = WireEnvelope::new(msg);
        envelope.request_id = request_id.map(str::to_string);
        let text = match encode_text(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "encode_error", conn_id = %client.conn_id, kind = envelope.msg.kind(), error = %err);
                return false;
            }
        };
        client.send_text(text).await
    }

    async fn broadcast(&self, msg: WireMsg) {
        let envelope = WireEnvelope::new(msg);
        let text = match encode_text(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "encode_error", kind = envelope.msg.kind(), error = %err);
                return;
            }
        };
        for client in self.snapshot_clients().await {
            if !client.send_text(text.clone()).await {
                warn!(event = "send_error", conn_id = %client.conn_id);
                self.remove_client(&client, "send_error").await;
            }
        }
    }

    async fn status_msg(&self) -> WireMsg {
        WireMsg::Status(StatusPayload {
            services: self.registry.snapshot().await,
        })
    }

    async fn broadcast_status(&self) {
        let msg = self.status_msg().await;
        self.broadcast(msg).await;
    }

    /// Re-derives a category's status from the supervisor under the category lock.
    async fn refresh_status(&self, category: &str) -> bool {
        let Some(cell) = self.registry.cell(category) else {
            return false;
        };
        let mut state = cell.lock().await;
        let status = self.supervisor.status(category).await;
        if !state.set_status(status) {
            return false;
        }
        info!(
            event = "status_change",
            category,
            running = state.status.running,
            status = %state.status.status,
            process_count = state.status.process_count
        );
        true
    }

    async fn send_error(&self, client: &Client, code: &str, message: &str, request_id: Option<&str>) {
        let payload = ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        };
        let _ = self.send(client, WireMsg::Error(payload), request_id).await;
    }

    async fn handle_message(&self, client: &Client, envelope: WireEnvelope) {
        let request_id = envelope.request_id.as_deref();
        match envelope.msg {
            WireMsg::GetStatus => {
                let msg = self.status_msg().await;
                let _ = self.send(client, msg, request_id).await;
            }
            WireMsg::StartService(payload) => {
                let category = match payload.validate() {
                    Ok(value) => value.to_string(),
                    Err(err) => {
                        self.send_error(client, "invalid_payload", err, request_id).await;
                        warn!(event = "payload_invalid", conn_id = %client.conn_id, error = err);
                        return;
                    }
                };
                match self.supervisor.start(&category).await {
                    Ok(pids) => {
                        self.refresh_status(&category).await;
                        self.broadcast_status().await;
                        let ack = AckPayload {
                            message: format!("started {category} ({} processes)", pids.len()),
                        };
                        let _ = self
                            .send(client, WireMsg::ServiceStarted(ack), request_id)
                            .await;
                    }
                    Err(err) => {
                        self.send_error(client, err.code(), &err.to_string(), request_id)
                            .await;
                        let msg = self.status_msg().await;
                        let _ = self.send(client, msg, None).await;
                    }
                }
            }
            WireMsg::StopService(payload) => {
                let category = match payload.validate() {
                    Ok(value) => value.to_string(),
                    Err(err) => {
                        self.send_error(client, "invalid_payload", err, request_id).await;
                        warn!(event = "payload_invalid", conn_id = %client.conn_id, error = err);
                        return;
                    }
                };
                match self.supervisor.stop(&category).await {
                    Ok(count) => {
                        self.refresh_status(&category).await;
                        self.broadcast_status().await;
                        let ack = AckPayload {
                            message: format!("stopped {category} ({count} processes)"),
                        };
                        let _ = self
                            .send(client, WireMsg::ServiceStopped(ack), request_id)
                            .await;
                    }
                    Err(err) => {
                        self.refresh_status(&category).await;
                        self.send_error(client, err.code(), &err.to_string(), request_id)
                            .await;
                        let msg = self.status_msg().await;
                        let _ = self.send(client, msg, None).await;
                    }
                }
            }
            WireMsg::GetLogs(payload) => {
                let (category, limit) = match payload.validate() {
                    Ok(value) => value,
                    Err(err) => {
                        self.send_error(client, "invalid_payload", err, request_id).await;
                        warn!(event = "payload_invalid", conn_id = %client.conn_id, error = err);
                        return;
                    }
                };
                let Some(cell) = self.registry.cell(category) else {
                    self.send_error(client, "unknown_category", "unknown service category", request_id)
                        .await;
                    return;
                };
                // reply is queued before any later line can be pushed
                let state = cell.lock().await;
                let reply = WireMsg::Logs(LogsPayload {
                    category: category.to_string(),
                    logs: state.logs.tail(limit),
                });
                let _ = self.send(client, reply, request_id).await;
            }
            other => {
                self.send_error(client, "unexpected_message", "message not accepted by hub", request_id)
                    .await;
                warn!(event = "unexpected_message", conn_id = %client.conn_id, kind = other.kind());
            }
        }
    }

    /// Ring push and client enqueue happen under one category lock, so a
    /// `get_logs` reply and a push never both carry the same line.
    async fn append_and_push(&self, category: &str, service: &str, line: String) {
        let Some(cell) = self.registry.cell(category) else {
            debug!(event = "log_line_dropped", category, reason = "unknown_category");
            return;
        };
        let mut state = cell.lock().await;
        state.logs.push(line.clone());
        let payload = LogMessagePayload::new(category, service, line);
        self.broadcast(WireMsg::LogMessage(payload)).await;
    }

    /// Drains supervisor output into the log rings and out to every client.
    pub async fn pump_supervisor_events(self: Arc<Self>, mut rx: mpsc::Receiver<SupervisorEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                SupervisorEvent::Line {
                    category,
                    service,
                    line,
                } => {
                    self.append_and_push(&category, &service, line).await;
                }
                SupervisorEvent::Exited {
                    category,
                    service,
                    pid,
                    code,
                    killed,
                } => {
                    let pid_label = pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_string());
                    let line = match (killed, code) {
                        (true, _) => format!("[exit] {service} pid={pid_label} killed"),
                        (false, Some(code)) => format!("[exit] {service} pid={pid_label} code={code}"),
                        (false, None) => format!("[exit] {service} pid={pid_label} signal"),
                    };
                    if killed {
                        info!(event = "process_exit", category = %category, service = %service, killed);
                    } else {
                        warn!(event = "process_exit", category = %category, service = %service, code = ?code);
                    }
                    self.append_and_push(&category, &service, line).await;
                    if self.refresh_status(&category).await {
                        self.broadcast_status().await;
                    }
                }
            }
        }
    }

    pub fn start_status_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.config.status_interval.is_zero() {
            return;
        }
        let interval = self.config.status_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for category in self.registry.categories() {
                            self.refresh_status(&category).await;
                        }
                        self.broadcast_status().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    pub fn start_stale_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(stale_after) = self.config.stale_after else {
            return;
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for client in self.snapshot_clients().await {
                            if client.last_seen().await.elapsed() > stale_after {
                                warn!(event = "stale_close", conn_id = %client.conn_id);
                                self.remove_client(&client, "stale").await;
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn start_ping(self: Arc<Self>, client: Arc<Client>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !self.clients.read().await.contains_key(&client.conn_id) {
                    return;
                }
                if client.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!(event = "ping_failed", conn_id = %client.conn_id);
                    self.remove_client(&client, "ping_failed").await;
                    return;
                }
            }
        });
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_QUEUE_CAPACITY);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() || closing {
                    return;
                }
            }
        });

        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            remote,
            sender: tx.clone(),
            last_seen: AsyncMutex::new(Instant::now()),
        });
        self.register_client(client.clone()).await;
        let hello = WireMsg::Connected(ConnectedPayload {
            conn_id: client.conn_id.clone(),
            server: SERVER_NAME.to_string(),
            categories: self.registry.categories(),
        });
        if !self.send(&client, hello, None).await {
            self.remove_client(&client, "handshake_error").await;
            return;
        }
        self.clone().start_ping(client.clone());

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    client.touch().await;
                    continue;
                }
            };
            client.touch().await;
            if self.config.debug {
                debug!(event = "message_received", conn_id = %client.conn_id, raw = %String::from_utf8_lossy(&data));
            }
            let envelope = match decode_envelope(&data, DEFAULT_MAX_FRAME_BYTES) {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = %client.conn_id, error = %err);
                    self.send_error(&client, "invalid_message", &err.to_string(), None)
                        .await;
                    continue;
                }
            };
            self.handle_message(&client, envelope).await;
        }

        self.remove_client(&client, "disconnect").await;
        drop(client);
        drop(tx);
        let _ = write_task.await;
    }
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    if !hub.config.allow_remote && !addr.ip().is_loopback() {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    ws.max_message_size(DEFAULT_MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            hub.handle_socket(socket, addr).await;
        })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ServiceSpec;
    use deck_core::{control_ipc::CategoryPayload, STATUS_STOPPED};
    use std::collections::BTreeMap;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
    };

    type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn launch_hub(
        services: Vec<(&str, ServiceSpec)>,
    ) -> (SocketAddr, Arc<HubState>, watch::Sender<bool>) {
        let services: BTreeMap<String, ServiceSpec> = services
            .into_iter()
            .map(|(name, spec)| (name.to_string(), spec))
            .collect();
        let (event_tx, event_rx) = mpsc::channel(256);
        let registry = Registry::new(services.keys().cloned(), deck_core::DEFAULT_LOG_LIMIT);
        let supervisor = Supervisor::new(services, event_tx, Duration::from_secs(2));
        let config = HubConfig {
            status_interval: Duration::ZERO,
            ..HubConfig::default()
        };
        let hub = Arc::new(HubState::new(config, registry, supervisor));
        tokio::spawn(hub.clone().pump_supervisor_events(event_rx));
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = router(hub.clone());
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });
        (addr, hub, shutdown_tx)
    }

    async fn connect(addr: SocketAddr) -> Ws {
        let (ws, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect hub");
        ws
    }

    async fn send(ws: &mut Ws, msg: WireMsg) {
        let text = encode_text(&WireEnvelope::new(msg), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        ws.send(WsMessage::Text(text)).await.expect("send frame");
    }

    async fn recv(ws: &mut Ws) -> WireMsg {
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame timeout")
                .expect("stream open")
                .expect("frame ok");
            if let WsMessage::Text(text) = next {
                return decode_envelope(text.as_bytes(), DEFAULT_MAX_FRAME_BYTES)
                    .expect("decode")
                    .msg;
            }
        }
    }

    async fn recv_until<F>(ws: &mut Ws, mut pred: F) -> WireMsg
    where
        F: FnMut(&WireMsg) -> bool,
    {
        loop {
            let msg = recv(ws).await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handshake_then_full_status() {
        let (addr, _hub, _shutdown) = launch_hub(vec![
            ("debt", ServiceSpec::shell("exec sleep 30", 1)),
            ("msg", ServiceSpec::shell("exec sleep 30", 1)),
        ])
        .await;
        let mut ws = connect(addr).await;

        let WireMsg::Connected(hello) = recv(&mut ws).await else {
            panic!("expected connected handshake")
        };
        assert_eq!(hello.conn_id, "conn-1");
        assert_eq!(hello.categories, vec!["debt".to_string(), "msg".to_string()]);

        send(&mut ws, WireMsg::GetStatus).await;
        let WireMsg::Status(payload) = recv(&mut ws).await else {
            panic!("expected status")
        };
        assert_eq!(payload.services.len(), 2);
        assert!(payload
            .services
            .values()
            .all(|status| !status.running && status.status == STATUS_STOPPED));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_streams_logs_and_stop_acks() {
        let (addr, _hub, _shutdown) = launch_hub(vec![(
            "debt",
            ServiceSpec::shell("echo line1; echo line2; exec sleep 30", 1),
        )])
        .await;
        let mut ws = connect(addr).await;
        let _ = recv(&mut ws).await;

        send(&mut ws, WireMsg::start("debt")).await;
        let mut running = None;
        let mut pushed = Vec::new();
        loop {
            match recv(&mut ws).await {
                WireMsg::Status(payload) if payload.services["debt"].running => {
                    running = Some(payload.services["debt"].clone());
                }
                WireMsg::LogMessage(payload) => pushed.push(payload),
                WireMsg::ServiceStarted(_) => break,
                _ => {}
            }
        }
        let running = running.expect("running status before the ack");
        assert_eq!(running.process_count, 1);
        assert!(running.pid.is_some());

        let history = loop {
            send(&mut ws, WireMsg::get_logs("debt", 100)).await;
            let reply = recv_until(&mut ws, |msg| match msg {
                WireMsg::Logs(_) => true,
                WireMsg::LogMessage(payload) => {
                    pushed.push(payload.clone());
                    false
                }
                _ => false,
            })
            .await;
            let WireMsg::Logs(history) = reply else {
                unreachable!()
            };
            if history.logs.len() >= 2 {
                break history;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        assert_eq!(history.category, "debt");
        assert_eq!(history.logs, vec!["line1".to_string(), "line2".to_string()]);

        if pushed.is_empty() {
            let WireMsg::LogMessage(payload) =
                recv_until(&mut ws, |msg| matches!(msg, WireMsg::LogMessage(_))).await
            else {
                unreachable!()
            };
            pushed.push(payload);
        }
        assert_eq!(pushed[0].category.as_deref(), Some("debt"));
        assert_eq!(pushed[0].service.as_deref(), Some("debt-0"));

        send(&mut ws, WireMsg::stop("debt")).await;
        recv_until(&mut ws, |msg| {
            matches!(msg, WireMsg::Status(payload) if !payload.services["debt"].running)
        })
        .await;
        recv_until(&mut ws, |msg| matches!(msg, WireMsg::ServiceStopped(_))).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn history_and_pushes_never_repeat_a_line() {
        let (addr, _hub, _shutdown) = launch_hub(vec![(
            "debt",
            ServiceSpec::shell(
                "i=1; while [ $i -le 20000 ]; do echo $i; i=$((i+1)); done; exec sleep 30",
                1,
            ),
        )])
        .await;
        let mut ws = connect(addr).await;
        let _ = recv(&mut ws).await;
        send(&mut ws, WireMsg::start("debt")).await;

        let number = |line: &str| line.parse::<u64>().expect("numbered line");
        let mut served_upto = 0;
        let mut replies = 0;
        let mut repeated = Vec::new();
        send(&mut ws, WireMsg::get_logs("debt", 100)).await;
        while replies < 200 {
            match recv(&mut ws).await {
                WireMsg::Logs(reply) => {
                    replies += 1;
                    if let Some(last) = reply.logs.last() {
                        served_upto = served_upto.max(number(last));
                    }
                    send(&mut ws, WireMsg::get_logs("debt", 100)).await;
                }
                WireMsg::LogMessage(push) => {
                    let value = number(push.message.as_deref().unwrap_or_default());
                    if value <= served_upto {
                        repeated.push(value);
                    }
                }
                _ => {}
            }
        }
        assert!(
            repeated.is_empty(),
            "pushed after already being served as history: {repeated:?}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_unknown_category_and_bad_frames() {
        let (addr, _hub, _shutdown) =
            launch_hub(vec![("debt", ServiceSpec::shell("exec sleep 30", 1))]).await;
        let mut ws = connect(addr).await;
        let _ = recv(&mut ws).await;

        send(&mut ws, WireMsg::start("ghost")).await;
        let WireMsg::Error(err) = recv(&mut ws).await else {
            panic!("expected error")
        };
        assert_eq!(err.code, "unknown_category");
        assert!(matches!(recv(&mut ws).await, WireMsg::Status(_)));

        send(
            &mut ws,
            WireMsg::StopService(CategoryPayload {
                category: " ".to_string(),
            }),
        )
        .await;
        let WireMsg::Error(err) = recv(&mut ws).await else {
            panic!("expected error")
        };
        assert_eq!(err.code, "invalid_payload");

        ws.send(WsMessage::Text("{not json".to_string()))
            .await
            .expect("send garbage");
        let WireMsg::Error(err) = recv(&mut ws).await else {
            panic!("expected error")
        };
        assert_eq!(err.code, "invalid_message");

        send(&mut ws, WireMsg::get_logs("ghost", 10)).await;
        let WireMsg::Error(err) = recv(&mut ws).await else {
            panic!("expected error")
        };
        assert_eq!(err.code, "unknown_category");

        // connection still serves requests after the rejects
        send(&mut ws, WireMsg::GetStatus).await;
        assert!(matches!(recv(&mut ws).await, WireMsg::Status(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crash_is_broadcast_to_other_clients() {
        let (addr, _hub, _shutdown) =
            launch_hub(vec![("msg", ServiceSpec::shell("sleep 0.3; exit 4", 1))]).await;
        let mut actor = connect(addr).await;
        let mut watcher = connect(addr).await;
        let _ = recv(&mut actor).await;
        let _ = recv(&mut watcher).await;

        send(&mut actor, WireMsg::start("msg")).await;
        recv_until(&mut watcher, |msg| {
            matches!(msg, WireMsg::Status(payload) if payload.services["msg"].running)
        })
        .await;
        let WireMsg::LogMessage(exit_line) = recv_until(&mut watcher, |msg| {
            matches!(msg, WireMsg::LogMessage(payload)
                if payload.message.as_deref().is_some_and(|line| line.starts_with("[exit]")))
        })
        .await
        else {
            unreachable!()
        };
        assert!(exit_line
            .message
            .as_deref()
            .is_some_and(|line| line.ends_with("code=4")));
        recv_until(&mut watcher, |msg| {
            matches!(msg, WireMsg::Status(payload) if !payload.services["msg"].running)
        })
        .await;
    }
}
