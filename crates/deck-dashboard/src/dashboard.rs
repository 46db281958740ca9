use crate::{
    dispatcher::{DispatchError, Dispatcher, PENDING_TIMEOUT, SETTLE_DELAY},
    logs::LogStreams,
    reconcile::{LogSyncState, Reconciler},
    registry::ServiceMirror,
};
use deck_core::{
    control_ipc::{ConnectedPayload, ErrorPayload, WireMsg},
    CommandKind, StatusMap, DEFAULT_LOG_LIMIT,
};
use serde::Serialize;
use std::{collections::BTreeMap, fmt, time::Duration};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something observable happened; fanned out to UI subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DashboardEvent {
    Connected { conn_id: String },
    Disconnected,
    StatusChanged,
    History { category: String, lines: usize },
    LogLine {
        category: String,
        service: Option<String>,
        line: String,
    },
    Acked { kind: CommandKind, message: String },
    PendingExpired { category: String, kind: CommandKind },
    CommandRejected { category: String, error: DispatchError },
    HubError { code: String, message: String },
}

/// Work the state machine asks its driver to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(WireMsg),
    ArmPendingTimeout {
        category: String,
        id: u64,
        after: Duration,
    },
    ScheduleStatusRefresh { after: Duration },
    Emit(DashboardEvent),
}

/// Read-only copy of the client state, published after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardView {
    pub connection: ConnectionState,
    pub conn_id: Option<String>,
    pub services: StatusMap,
    pub pending: BTreeMap<String, CommandKind>,
    pub logs: BTreeMap<String, Vec<String>>,
    pub log_sync: BTreeMap<String, LogSyncState>,
    pub last_error: Option<ErrorPayload>,
}

/// Client-side state machine: consumes hub messages and user intents,
/// returns the effects to carry out. Performs no I/O itself.
#[derive(Debug, Clone)]
pub struct Dashboard {
    connection: ConnectionState,
    conn_id: Option<String>,
    services: ServiceMirror,
    logs: LogStreams,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    last_error: Option<ErrorPayload>,
    pending_timeout: Duration,
    settle_delay: Duration,
}

impl Default for Dashboard {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_LIMIT)
    }
}

impl Dashboard {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            conn_id: None,
            services: ServiceMirror::new(),
            logs: LogStreams::new(log_capacity),
            dispatcher: Dispatcher::new(),
            reconciler: Reconciler::new(),
            last_error: None,
            pending_timeout: PENDING_TIMEOUT,
            settle_delay: SETTLE_DELAY,
        }
    }

    pub fn with_timings(mut self, pending_timeout: Duration, settle_delay: Duration) -> Self {
        self.pending_timeout = pending_timeout;
        self.settle_delay = settle_delay;
        self
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn conn_id(&self) -> Option<&str> {
        self.conn_id.as_deref()
    }

    pub fn services(&self) -> &ServiceMirror {
        &self.services
    }

    pub fn logs(&self) -> &LogStreams {
        &self.logs
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn on_connecting(&mut self) {
        self.connection = ConnectionState::Connecting;
    }

    /// Transport gone. Pending ops cannot be confirmed any more, so they go too.
    pub fn on_disconnected(&mut self) -> Vec<Effect> {
        let was_connected = self.connection == ConnectionState::Connected;
        self.connection = ConnectionState::Disconnected;
        self.conn_id = None;
        let dropped = self.dispatcher.len();
        self.dispatcher.clear();
        if dropped > 0 {
            debug!(event = "pending_dropped", reason = "disconnect", count = dropped);
        }
        if was_connected {
            vec![Effect::Emit(DashboardEvent::Disconnected)]
        } else {
            Vec::new()
        }
    }

    /// Fresh connection: mirrors start over and the full status is requested.
    fn on_handshake(&mut self, hello: ConnectedPayload) -> Vec<Effect> {
        self.services.clear();
        self.logs.clear_all();
        self.reconciler.reset();
        self.dispatcher.clear();
        self.last_error = None;
        self.connection = ConnectionState::Connected;
        self.conn_id = Some(hello.conn_id.clone());
        info!(
            event = "hub_connected",
            conn_id = %hello.conn_id,
            server = %hello.server,
            categories = hello.categories.len()
        );
        vec![
            Effect::Send(WireMsg::GetStatus),
            Effect::Emit(DashboardEvent::Connected {
                conn_id: hello.conn_id,
            }),
        ]
    }

    pub fn command(
        &mut self,
        kind: CommandKind,
        category: &str,
    ) -> Result<Vec<Effect>, DispatchError> {
        if self.connection != ConnectionState::Connected {
            return Err(DispatchError::NotConnected);
        }
        let category = category.trim();
        if category.is_empty() {
            return Err(DispatchError::EmptyCategory);
        }
        let op = self.dispatcher.arm(category, kind);
        debug!(event = "command_dispatch", category, kind = %kind, id = op.id);
        let msg = match kind {
            CommandKind::Start => WireMsg::start(category),
            CommandKind::Stop => WireMsg::stop(category),
        };
        Ok(vec![
            Effect::Send(msg),
            Effect::ArmPendingTimeout {
                category: category.to_string(),
                id: op.id,
                after: self.pending_timeout,
            },
        ])
    }

    /// Fired by the pending timer; a no-op if the op was already cleared or replaced.
    pub fn expire_pending(&mut self, category: &str, id: u64) -> Vec<Effect> {
        let Some(op) = self.dispatcher.expire(category, id) else {
            return Vec::new();
        };
        warn!(event = "pending_timeout", category, kind = %op.kind, id);
        vec![Effect::Emit(DashboardEvent::PendingExpired {
            category: category.to_string(),
            kind: op.kind,
        })]
    }

    /// Explicit backfill, independent of whether the category is running.
    pub fn request_history(&self, category: &str, limit: usize) -> Vec<Effect> {
        if self.connection != ConnectionState::Connected {
            return Vec::new();
        }
        vec![Effect::Send(self.logs.request_history(category, limit))]
    }

    pub fn refresh_status(&self) -> Vec<Effect> {
        if self.connection != ConnectionState::Connected {
            return Vec::new();
        }
        vec![Effect::Send(WireMsg::GetStatus)]
    }

    pub fn handle_message(&mut self, msg: WireMsg) -> Vec<Effect> {
        match msg {
            WireMsg::Connected(hello) => self.on_handshake(hello),
            WireMsg::Status(payload) => self.on_snapshot(payload.normalized()),
            WireMsg::Logs(payload) => {
                let (category, logs) = match payload.validate() {
                    Ok(value) => value,
                    Err(reason) => {
                        warn!(event = "logs_dropped", reason);
                        return Vec::new();
                    }
                };
                let lines = logs.len();
                self.logs.on_history(&category, logs);
                self.reconciler.on_history(&category);
                vec![Effect::Emit(DashboardEvent::History { category, lines })]
            }
            WireMsg::LogMessage(payload) => {
                let service = payload.service.clone();
                let (category, line) = match payload.validate() {
                    Ok(value) => value,
                    Err(reason) => {
                        warn!(event = "log_message_dropped", reason);
                        return Vec::new();
                    }
                };
                self.logs.on_append(&category, line.clone());
                vec![Effect::Emit(DashboardEvent::LogLine {
                    category,
                    service,
                    line,
                })]
            }
            WireMsg::ServiceStarted(ack) => self.on_ack(CommandKind::Start, ack.message),
            WireMsg::ServiceStopped(ack) => self.on_ack(CommandKind::Stop, ack.message),
            WireMsg::Error(err) => {
                warn!(event = "hub_error", code = %err.code, message = %err.message);
                self.last_error = Some(err.clone());
                vec![Effect::Emit(DashboardEvent::HubError {
                    code: err.code,
                    message: err.message,
                })]
            }
            other => {
                warn!(event = "unexpected_message", kind = other.kind());
                Vec::new()
            }
        }
    }

    fn on_snapshot(&mut self, snapshot: StatusMap) -> Vec<Effect> {
        let outcome = self
            .reconciler
            .on_snapshot(&snapshot, &self.logs, &mut self.dispatcher);
        self.services.apply_snapshot(snapshot);
        for (category, op) in &outcome.cleared {
            debug!(event = "pending_cleared", reason = "snapshot", category = %category, kind = %op.kind, id = op.id);
        }
        let mut effects: Vec<Effect> = outcome
            .backfill
            .iter()
            .map(|category| {
                debug!(event = "log_backfill", category = %category);
                Effect::Send(self.logs.request_history(category, self.logs.capacity()))
            })
            .collect();
        effects.push(Effect::Emit(DashboardEvent::StatusChanged));
        effects
    }

    fn on_ack(&mut self, kind: CommandKind, message: String) -> Vec<Effect> {
        let cleared = self.dispatcher.on_ack();
        debug!(event = "pending_cleared", reason = "ack", kind = %kind, count = cleared);
        vec![
            Effect::ScheduleStatusRefresh {
                after: self.settle_delay,
            },
            Effect::Emit(DashboardEvent::Acked { kind, message }),
        ]
    }

    pub fn view(&self) -> DashboardView {
        DashboardView {
            connection: self.connection,
            conn_id: self.conn_id.clone(),
            services: self.services.all().clone(),
            pending: self.dispatcher.kinds(),
            logs: self.logs.snapshot(),
            log_sync: self.reconciler.states().clone(),
            last_error: self.last_error.clone(),
        }
    }
}
