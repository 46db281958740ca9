use crate::{
    dashboard::{ConnectionState, Dashboard, DashboardEvent, DashboardView, Effect},
    dispatcher::{DispatchError, PENDING_TIMEOUT, SETTLE_DELAY},
};
use deck_core::{
    control_ipc::{decode_envelope, encode_text, WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES},
    CommandKind, DEFAULT_LOG_LIMIT,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::{env, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:7878/ws";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// An open socket without a `connected` message by then counts as a failed attempt.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive failed attempts before the session gives up.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

const INPUT_QUEUE_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 512;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid hub url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Flag wins, then `DECK_HUB_URL`, then `DECK_HUB_ADDR` as `ws://<addr>/ws`.
pub fn resolve_hub_url(flag_url: &str) -> Result<Url, SessionError> {
    if !flag_url.trim().is_empty() {
        return parse_hub_url(flag_url.trim());
    }
    if let Ok(value) = env::var("DECK_HUB_URL") {
        if !value.trim().is_empty() {
            return parse_hub_url(value.trim());
        }
    }
    if let Ok(value) = env::var("DECK_HUB_ADDR") {
        if !value.trim().is_empty() {
            return parse_hub_url(&format!("ws://{}/ws", value.trim()));
        }
    }
    parse_hub_url(DEFAULT_HUB_URL)
}

pub fn parse_hub_url(raw: &str) -> Result<Url, SessionError> {
    let url = Url::parse(raw).map_err(|err| SessionError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(SessionError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: Url,
    pub reconnect_delay: Duration,
    pub handshake_timeout: Duration,
    pub max_retries: u32,
    pub log_capacity: usize,
    pub pending_timeout: Duration,
    pub settle_delay: Duration,
}

impl SessionConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            log_capacity: DEFAULT_LOG_LIMIT,
            pending_timeout: PENDING_TIMEOUT,
            settle_delay: SETTLE_DELAY,
        }
    }
}

#[derive(Debug)]
enum Input {
    Command { kind: CommandKind, category: String },
    PendingExpired { category: String, id: u64 },
    RequestHistory { category: String, limit: usize },
    RefreshStatus,
}

/// Cloneable front end of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inputs: mpsc::Sender<Input>,
    state: watch::Receiver<ConnectionState>,
    view: watch::Receiver<DashboardView>,
    events: broadcast::Sender<DashboardEvent>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    pub fn start(&self, category: &str) -> Result<(), DispatchError> {
        self.dispatch(CommandKind::Start, category)
    }

    pub fn stop(&self, category: &str) -> Result<(), DispatchError> {
        self.dispatch(CommandKind::Stop, category)
    }

    /// Fails fast unless connected; nothing is queued for later.
    pub fn dispatch(&self, kind: CommandKind, category: &str) -> Result<(), DispatchError> {
        let category = category.trim();
        if category.is_empty() {
            return Err(DispatchError::EmptyCategory);
        }
        self.send_input(Input::Command {
            kind,
            category: category.to_string(),
        })
    }

    pub fn request_history(&self, category: &str, limit: usize) -> Result<(), DispatchError> {
        let category = category.trim();
        if category.is_empty() {
            return Err(DispatchError::EmptyCategory);
        }
        self.send_input(Input::RequestHistory {
            category: category.to_string(),
            limit,
        })
    }

    /// Asks the hub for a fresh snapshot.
    pub fn refresh(&self) -> Result<(), DispatchError> {
        self.send_input(Input::RefreshStatus)
    }

    fn send_input(&self, input: Input) -> Result<(), DispatchError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(DispatchError::NotConnected);
        }
        self.inputs.try_send(input).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::SessionClosed,
        })
    }

    pub fn disconnect(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn on_state_change(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves once the state equals `wanted`; false if the session is gone.
    pub async fn wait_for_state(&self, wanted: ConnectionState) -> bool {
        let mut state = self.state.clone();
        let reached = state.wait_for(|current| *current == wanted).await.is_ok();
        reached
    }

    pub fn view(&self) -> DashboardView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<DashboardView> {
        self.view.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }
}

/// Spawns the session task and returns its handle.
pub fn connect(config: SessionConfig) -> (SessionHandle, JoinHandle<()>) {
    let (session, handle) = Session::new(config);
    (handle, tokio::spawn(session.run()))
}

#[derive(Debug, Default)]
struct ConnectionExit {
    handshake: bool,
    shutdown: bool,
}

/// Owns the dashboard state; every mutation happens on this task.
struct Session {
    dashboard: Dashboard,
    config: SessionConfig,
    inputs: mpsc::Receiver<Input>,
    timers: mpsc::Sender<Input>,
    state: watch::Sender<ConnectionState>,
    view: watch::Sender<DashboardView>,
    events: broadcast::Sender<DashboardEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Session {
    fn new(config: SessionConfig) -> (Self, SessionHandle) {
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (view_tx, view_rx) = watch::channel(DashboardView::default());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dashboard = Dashboard::new(config.log_capacity)
            .with_timings(config.pending_timeout, config.settle_delay);
        let session = Session {
            dashboard,
            config,
            inputs: input_rx,
            timers: input_tx.clone(),
            state: state_tx,
            view: view_tx,
            events: events_tx.clone(),
            shutdown: shutdown_rx,
        };
        let handle = SessionHandle {
            inputs: input_tx,
            state: state_rx,
            view: view_rx,
            events: events_tx,
            shutdown: Arc::new(shutdown_tx),
        };
        (session, handle)
    }

    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.dashboard.on_connecting();
            self.publish();
            debug!(event = "hub_connecting", url = %self.config.url, attempt = failures + 1);

            let connect = tokio::select! {
                result = connect_async(self.config.url.as_str()) => result,
                _ = wait_shutdown(&mut self.shutdown) => break,
            };
            match connect {
                Ok((ws, _)) => {
                    let exit = self.drive(ws).await;
                    if exit.handshake {
                        failures = 0;
                    } else {
                        failures += 1;
                    }
                    if exit.shutdown {
                        break;
                    }
                }
                Err(err) => {
                    warn!(event = "hub_connect_error", url = %self.config.url, error = %err);
                    failures += 1;
                }
            }

            let effects = self.dashboard.on_disconnected();
            self.apply_local(effects);

            if failures >= self.config.max_retries {
                warn!(event = "reconnect_exhausted", failures, url = %self.config.url);
                break;
            }
            if !self.idle(self.config.reconnect_delay).await {
                break;
            }
        }

        let effects = self.dashboard.on_disconnected();
        self.apply_local(effects);
        info!(event = "session_closed");
    }

    async fn drive(&mut self, ws: WsStream) -> ConnectionExit {
        let (mut sink, mut stream) = ws.split();
        let mut exit = ConnectionExit::default();
        let handshake_deadline = tokio::time::sleep(self.config.handshake_timeout);
        tokio::pin!(handshake_deadline);
        loop {
            let effects = tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_frame(text.as_bytes(), &mut exit),
                    Some(Ok(Message::Binary(bytes))) => self.on_frame(&bytes, &mut exit),
                    Some(Ok(Message::Close(_))) | None => {
                        info!(event = "hub_closed", conn_id = ?self.dashboard.conn_id());
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(event = "hub_read_error", error = %err);
                        break;
                    }
                },
                Some(input) = self.inputs.recv() => self.on_input(input),
                _ = &mut handshake_deadline, if !exit.handshake => {
                    warn!(
                        event = "hub_handshake_timeout",
                        url = %self.config.url,
                        timeout_ms = self.config.handshake_timeout.as_millis() as u64
                    );
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                _ = wait_shutdown(&mut self.shutdown) => {
                    let _ = sink.send(Message::Close(None)).await;
                    exit.shutdown = true;
                    break;
                }
            };
            let (sends, events) = self.arm_local(effects);
            let written = self.write(sends, &mut sink).await;
            self.publish();
            self.emit(events);
            if let Err(err) = written {
                warn!(event = "hub_write_error", error = %err);
                break;
            }
        }
        exit
    }

    /// Reconnect delay; inputs keep being answered while waiting.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                Some(input) = self.inputs.recv() => {
                    let effects = self.on_input(input);
                    self.apply_local(effects);
                }
                _ = wait_shutdown(&mut self.shutdown) => return false,
            }
        }
    }

    fn on_frame(&mut self, bytes: &[u8], exit: &mut ConnectionExit) -> Vec<Effect> {
        let envelope = match decode_envelope(bytes, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "frame_invalid", error = %err);
                return Vec::new();
            }
        };
        if matches!(envelope.msg, WireMsg::Connected(_)) {
            exit.handshake = true;
        }
        self.dashboard.handle_message(envelope.msg)
    }

    fn on_input(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Command { kind, category } => match self.dashboard.command(kind, &category) {
                Ok(effects) => effects,
                Err(error) => {
                    warn!(event = "command_rejected", category = %category, kind = %kind, error = %error);
                    vec![Effect::Emit(DashboardEvent::CommandRejected { category, error })]
                }
            },
            Input::PendingExpired { category, id } => self.dashboard.expire_pending(&category, id),
            Input::RequestHistory { category, limit } => {
                self.dashboard.request_history(&category, limit)
            }
            Input::RefreshStatus => self.dashboard.refresh_status(),
        }
    }

    async fn write(&self, sends: Vec<WireMsg>, sink: &mut WsSink) -> Result<(), tungstenite::Error> {
        for msg in sends {
            let text = match encode_text(&WireEnvelope::new(msg), DEFAULT_MAX_FRAME_BYTES) {
                Ok(text) => text,
                Err(err) => {
                    warn!(event = "encode_error", error = %err);
                    continue;
                }
            };
            sink.send(Message::Text(text)).await?;
        }
        Ok(())
    }

    /// Arms timers and hands back the sends and the events still to go out.
    fn arm_local(&self, effects: Vec<Effect>) -> (Vec<WireMsg>, Vec<DashboardEvent>) {
        let mut sends = Vec::new();
        let mut events = Vec::new();
        for effect in effects {
            match effect {
                Effect::Send(msg) => sends.push(msg),
                Effect::ArmPendingTimeout {
                    category,
                    id,
                    after,
                } => self.spawn_timer(after, Input::PendingExpired { category, id }),
                Effect::ScheduleStatusRefresh { after } => {
                    self.spawn_timer(after, Input::RefreshStatus)
                }
                Effect::Emit(event) => events.push(event),
            }
        }
        (sends, events)
    }

    /// Events go out after `publish`, so a subscriber reading the view sees their effect.
    fn emit(&self, events: Vec<DashboardEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    /// Same as the connected path, minus the socket.
    fn apply_local(&self, effects: Vec<Effect>) {
        let (sends, events) = self.arm_local(effects);
        for msg in sends {
            debug!(event = "send_dropped", kind = msg.kind(), reason = "offline");
        }
        self.publish();
        self.emit(events);
    }

    fn spawn_timer(&self, after: Duration, input: Input) {
        let timers = self.timers.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    let _ = timers.send(input).await;
                }
                _ = wait_shutdown(&mut shutdown) => {}
            }
        });
    }

    fn publish(&self) {
        let state = self.dashboard.connection();
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            info!(event = "connection_state", state = %state, url = %self.config.url);
        }
        let view = self.dashboard.view();
        self.view.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }
}

/// Resolves when shutdown was requested or every handle is gone.
async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deck_core::{
        control_ipc::{AckPayload, ConnectedPayload, LogsPayload, StatusPayload},
        ServiceStatus, StatusMap,
    };
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    type ServerWs = WebSocketStream<TcpStream>;

    async fn send(ws: &mut ServerWs, msg: WireMsg) {
        let text = encode_text(&WireEnvelope::new(msg), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        ws.send(Message::Text(text)).await.expect("server send");
    }

    async fn recv(ws: &mut ServerWs) -> Option<WireMsg> {
        loop {
            match ws.next().await? {
                Ok(Message::Text(text)) => {
                    return decode_envelope(text.as_bytes(), DEFAULT_MAX_FRAME_BYTES)
                        .ok()
                        .map(|env| env.msg)
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    async fn accept(listener: &TcpListener, conn_id: &str) -> ServerWs {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("ws handshake");
        send(
            &mut ws,
            WireMsg::Connected(ConnectedPayload {
                conn_id: conn_id.to_string(),
                server: "test-hub".to_string(),
                categories: Vec::new(),
            }),
        )
        .await;
        ws
    }

    fn status(entries: &[(&str, bool)]) -> WireMsg {
        let services: StatusMap = entries
            .iter()
            .map(|(category, running)| {
                let status = if *running {
                    ServiceStatus::running(Some(1234), 1)
                } else {
                    ServiceStatus::stopped()
                };
                (category.to_string(), status)
            })
            .collect();
        WireMsg::Status(StatusPayload { services })
    }

    async fn listener() -> (TcpListener, Url) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let url = parse_hub_url(&format!("ws://{addr}/ws")).expect("url");
        (listener, url)
    }

    async fn wait_view<F>(handle: &SessionHandle, mut pred: F) -> DashboardView
    where
        F: FnMut(&DashboardView) -> bool,
    {
        let mut rx = handle.watch_view();
        let view = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|view| pred(view)))
            .await
            .expect("view timeout")
            .expect("session alive")
            .clone();
        view
    }

    #[test]
    fn hub_url_validation() {
        assert!(parse_hub_url("ws://127.0.0.1:7878/ws").is_ok());
        assert!(parse_hub_url("wss://deck.example/ws").is_ok());
        assert!(matches!(
            parse_hub_url("http://127.0.0.1:7878/ws"),
            Err(SessionError::InvalidUrl { .. })
        ));
        assert!(parse_hub_url("not a url").is_err());
        assert_eq!(
            resolve_hub_url(" ws://10.0.0.5:9000/ws ")
                .expect("flag url")
                .as_str(),
            "ws://10.0.0.5:9000/ws"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnect_requests_status_once_and_rebuilds_mirror() {
        let (listener, url) = listener().await;
        let mut config = SessionConfig::new(url);
        config.reconnect_delay = Duration::from_millis(50);
        let (handle, _task) = connect(config);

        let mut first = accept(&listener, "conn-1").await;
        assert_eq!(recv(&mut first).await, Some(WireMsg::GetStatus));
        send(&mut first, status(&[("debt", true), ("msg", false)])).await;
        assert_eq!(
            recv(&mut first).await,
            Some(WireMsg::get_logs("debt", DEFAULT_LOG_LIMIT))
        );
        send(
            &mut first,
            WireMsg::Logs(LogsPayload {
                category: "debt".to_string(),
                logs: vec!["old".to_string()],
            }),
        )
        .await;
        wait_view(&handle, |view| view.logs.get("debt").is_some_and(|l| !l.is_empty())).await;
        drop(first);

        let mut second = accept(&listener, "conn-2").await;
        assert_eq!(recv(&mut second).await, Some(WireMsg::GetStatus));
        send(&mut second, status(&[("msg", false)])).await;
        let view = wait_view(&handle, |view| {
            view.conn_id.as_deref() == Some("conn-2") && !view.services.is_empty()
        })
        .await;
        assert_eq!(view.services.keys().collect::<Vec<_>>(), vec!["msg"]);
        assert!(view.logs.is_empty());
        assert_eq!(handle.state(), ConnectionState::Connected);

        // nothing else should follow the single get_status
        let extra = tokio::time::timeout(Duration::from_millis(300), recv(&mut second)).await;
        assert!(extra.is_err(), "unexpected frame: {extra:?}");

        handle.disconnect();
        assert!(handle.wait_for_state(ConnectionState::Disconnected).await);
    }

    fn connected_session() -> (Session, SessionHandle) {
        let url = parse_hub_url(DEFAULT_HUB_URL).expect("url");
        let (mut session, handle) = Session::new(SessionConfig::new(url));
        session
            .dashboard
            .handle_message(WireMsg::Connected(ConnectedPayload {
                conn_id: "conn-1".to_string(),
                server: String::new(),
                categories: Vec::new(),
            }));
        session.dashboard.handle_message(status(&[("debt", false)]));
        (session, handle)
    }

    fn drain(events: &mut broadcast::Receiver<DashboardEvent>) -> Vec<DashboardEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_start_expires_after_timeout() {
        let (mut session, handle) = connected_session();
        let mut events = handle.subscribe();

        let effects = session
            .dashboard
            .command(CommandKind::Start, "debt")
            .expect("dispatch");
        session.apply_local(effects);
        assert!(session.dashboard.dispatcher().is_pending("debt"));

        assert!(session.idle(Duration::from_millis(1500)).await);
        assert!(session.dashboard.dispatcher().is_pending("debt"));

        assert!(session.idle(Duration::from_millis(1000)).await);
        assert!(!session.dashboard.dispatcher().is_pending("debt"));
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            DashboardEvent::PendingExpired { category, kind: CommandKind::Start } if category == "debt"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_start_leaves_timer_with_nothing_to_do() {
        let (mut session, handle) = connected_session();
        let mut events = handle.subscribe();

        let effects = session
            .dashboard
            .command(CommandKind::Start, "debt")
            .expect("dispatch");
        session.apply_local(effects);
        assert!(session.idle(Duration::from_millis(200)).await);

        session.dashboard.handle_message(status(&[("debt", true)]));
        assert!(!session.dashboard.dispatcher().is_pending("debt"));

        // a newer op on the same category must survive the first timer
        let effects = session
            .dashboard
            .command(CommandKind::Stop, "debt")
            .expect("dispatch");
        session.apply_local(effects);
        assert!(session.idle(Duration::from_millis(1900)).await);
        assert_eq!(
            session.dashboard.dispatcher().pending("debt").map(|op| op.kind),
            Some(CommandKind::Stop)
        );
        assert!(!drain(&mut events)
            .iter()
            .any(|event| matches!(event, DashboardEvent::PendingExpired { .. })));
    }

    async fn next_event(events: &mut broadcast::Receiver<DashboardEvent>) -> DashboardEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timeout")
            .expect("event")
    }

    #[tokio::test(start_paused = true)]
    async fn timers_armed_before_teardown_never_fire() {
        let (mut session, handle) = connected_session();
        let mut events = handle.subscribe();

        let effects = session
            .dashboard
            .handle_message(WireMsg::ServiceStopped(AckPayload {
                message: "stopped debt (1 processes)".to_string(),
            }));
        assert!(effects
            .iter()
            .any(|effect| matches!(effect, Effect::ScheduleStatusRefresh { .. })));
        session.apply_local(effects);
        let effects = session
            .dashboard
            .command(CommandKind::Start, "debt")
            .expect("dispatch");
        session.apply_local(effects);
        drain(&mut events);

        handle.disconnect();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(session.inputs.try_recv().is_err());
        assert!(!session.idle(Duration::from_secs(1)).await);
        assert!(session.dashboard.dispatcher().is_pending("debt"));
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn view_is_current_when_events_arrive() {
        let (listener, url) = listener().await;
        let (handle, _task) = connect(SessionConfig::new(url));
        let mut events = handle.subscribe();
        let mut ws = accept(&listener, "conn-1").await;
        assert_eq!(recv(&mut ws).await, Some(WireMsg::GetStatus));

        for idx in 0..50 {
            let category = format!("c{idx}");
            send(&mut ws, status(&[(category.as_str(), false)])).await;
            while !matches!(next_event(&mut events).await, DashboardEvent::StatusChanged) {}
            assert!(
                handle.view().services.contains_key(&category),
                "view behind the event for {category}"
            );
        }

        send(
            &mut ws,
            WireMsg::Logs(LogsPayload {
                category: "c49".to_string(),
                logs: vec!["backlog".to_string()],
            }),
        )
        .await;
        while !matches!(next_event(&mut events).await, DashboardEvent::History { .. }) {}
        assert_eq!(handle.view().logs["c49"], vec!["backlog"]);
        handle.disconnect();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_hub_counts_as_a_failed_attempt() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(stream).await {
                    held.push(ws);
                }
            }
        });
        let mut config = SessionConfig::new(url);
        config.max_retries = 2;
        config.reconnect_delay = Duration::from_millis(20);
        config.handshake_timeout = Duration::from_millis(100);
        let (handle, task) = connect(config);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("handshake timeouts should exhaust the retries")
            .expect("session task");
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retry_ceiling_ends_the_session() {
        let (listener, url) = listener().await;
        drop(listener);
        let mut config = SessionConfig::new(url);
        config.max_retries = 3;
        config.reconnect_delay = Duration::from_millis(20);
        let (handle, task) = connect(config);

        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("session should stop retrying")
            .expect("session task");
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(handle.start("debt"), Err(DispatchError::NotConnected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_are_rejected_before_the_handshake() {
        let (listener, url) = listener().await;
        let (handle, _task) = connect(SessionConfig::new(url));
        assert_eq!(handle.stop("debt"), Err(DispatchError::NotConnected));
        assert_eq!(handle.start("  "), Err(DispatchError::EmptyCategory));

        let mut ws = accept(&listener, "conn-1").await;
        assert_eq!(recv(&mut ws).await, Some(WireMsg::GetStatus));
        assert!(handle.wait_for_state(ConnectionState::Connected).await);
        handle.stop("debt").expect("dispatch once connected");
        assert_eq!(recv(&mut ws).await, Some(WireMsg::stop("debt")));
        handle.disconnect();
    }
}
