use crate::config::ServiceSpec;
use deck_core::{ServiceStatus, STATUS_DEGRADED, STATUS_RUNNING};
use std::{
    collections::{BTreeMap, HashMap},
    io,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown service category '{0}'")]
    UnknownCategory(String),
    #[error("service '{0}' is already running")]
    AlreadyRunning(String),
    #[error("service '{0}' is not running")]
    NotRunning(String),
    #[error("failed to spawn '{category}': {source}")]
    Spawn {
        category: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::UnknownCategory(_) => "unknown_category",
            SupervisorError::AlreadyRunning(_) => "already_running",
            SupervisorError::NotRunning(_) => "not_running",
            SupervisorError::Spawn { .. } => "spawn_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Line {
        category: String,
        service: String,
        line: String,
    },
    Exited {
        category: String,
        service: String,
        pid: Option<u32>,
        code: Option<i32>,
        killed: bool,
    },
}

struct ChildHandle {
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    kill_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

struct ServiceGroup {
    expected: u32,
    children: Vec<ChildHandle>,
}

impl ServiceGroup {
    fn alive(&self) -> impl Iterator<Item = &ChildHandle> {
        self.children
            .iter()
            .filter(|child| child.alive.load(Ordering::SeqCst))
    }
}

/// Spawns and kills the worker processes behind each category.
pub struct Supervisor {
    services: BTreeMap<String, ServiceSpec>,
    groups: Mutex<HashMap<String, ServiceGroup>>,
    events: mpsc::Sender<SupervisorEvent>,
    stop_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        services: BTreeMap<String, ServiceSpec>,
        events: mpsc::Sender<SupervisorEvent>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            services,
            groups: Mutex::new(HashMap::new()),
            events,
            stop_timeout,
        }
    }

    pub fn categories(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Launches `processes` copies of the category's command. Returns their pids.
    pub async fn start(&self, category: &str) -> Result<Vec<u32>, SupervisorError> {
        let spec = self
            .services
            .get(category)
            .ok_or_else(|| SupervisorError::UnknownCategory(category.to_string()))?;
        let mut groups = self.groups.lock().await;
        if let Some(group) = groups.get(category) {
            if group.alive().next().is_some() {
                return Err(SupervisorError::AlreadyRunning(category.to_string()));
            }
        }

        let mut children = Vec::with_capacity(spec.processes as usize);
        for index in 0..spec.processes {
            let service = format!("{category}-{index}");
            match self.spawn_child(category, &service, spec) {
                Ok(child) => children.push(child),
                Err(source) => {
                    for mut child in children {
                        if let Some(kill) = child.kill_tx.take() {
                            let _ = kill.send(());
                        }
                    }
                    warn!(event = "service_spawn_failed", category, error = %source);
                    return Err(SupervisorError::Spawn {
                        category: category.to_string(),
                        source,
                    });
                }
            }
        }

        let pids: Vec<u32> = children.iter().filter_map(|child| child.pid).collect();
        info!(event = "service_started", category, pids = ?pids);
        groups.insert(
            category.to_string(),
            ServiceGroup {
                expected: spec.processes,
                children,
            },
        );
        Ok(pids)
    }

    /// Kills every live process of the category and waits (bounded) for exit.
    /// Returns how many were alive.
    pub async fn stop(&self, category: &str) -> Result<usize, SupervisorError> {
        if !self.services.contains_key(category) {
            return Err(SupervisorError::UnknownCategory(category.to_string()));
        }
        let group = self.groups.lock().await.remove(category);
        let Some(group) = group else {
            return Err(SupervisorError::NotRunning(category.to_string()));
        };
        let alive = group.alive().count();
        let mut tasks = Vec::with_capacity(group.children.len());
        for mut child in group.children {
            if let Some(kill) = child.kill_tx.take() {
                let _ = kill.send(());
            }
            tasks.push(child.task);
        }
        for task in tasks {
            if tokio::time::timeout(self.stop_timeout, task).await.is_err() {
                warn!(event = "service_stop_timeout", category);
            }
        }
        if alive == 0 {
            return Err(SupervisorError::NotRunning(category.to_string()));
        }
        info!(event = "service_stopped", category, processes = alive);
        Ok(alive)
    }

    pub async fn stop_all(&self) {
        for category in self.categories() {
            let _ = self.stop(&category).await;
        }
    }

    /// Current status derived from live children.
    pub async fn status(&self, category: &str) -> ServiceStatus {
        let groups = self.groups.lock().await;
        let Some(group) = groups.get(category) else {
            return ServiceStatus::stopped();
        };
        let alive: Vec<&ChildHandle> = group.alive().collect();
        if alive.is_empty() {
            return ServiceStatus::stopped();
        }
        let count = alive.len() as u32;
        ServiceStatus {
            running: true,
            pid: alive.iter().find_map(|child| child.pid),
            status: if count >= group.expected {
                STATUS_RUNNING.to_string()
            } else {
                STATUS_DEGRADED.to_string()
            },
            process_count: count,
        }
    }

    fn spawn_child(
        &self,
        category: &str,
        service: &str,
        spec: &ServiceSpec,
    ) -> io::Result<ChildHandle> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = spec.cwd.as_ref() {
            command.current_dir(cwd);
        }
        let child = command.spawn()?;
        let pid = child.id();
        let alive = Arc::new(AtomicBool::new(true));
        let (kill_tx, kill_rx) = oneshot::channel();
        let task = tokio::spawn(run_child(
            category.to_string(),
            service.to_string(),
            child,
            self.events.clone(),
            kill_rx,
            alive.clone(),
        ));
        Ok(ChildHandle {
            pid,
            alive,
            kill_tx: Some(kill_tx),
            task,
        })
    }
}

async fn run_child(
    category: String,
    service: String,
    mut child: Child,
    events: mpsc::Sender<SupervisorEvent>,
    kill_rx: oneshot::Receiver<()>,
    alive: Arc<AtomicBool>,
) {
    let pid = child.id();
    let stdout_task = child.stdout.take().map(|stdout| {
        tokio::spawn(forward_lines(
            stdout,
            category.clone(),
            service.clone(),
            events.clone(),
        ))
    });
    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(forward_lines(
            stderr,
            category.clone(),
            service.clone(),
            events.clone(),
        ))
    });

    let (code, killed) = tokio::select! {
        _ = kill_rx => {
            let _ = child.kill().await;
            (None, true)
        }
        status = child.wait() => {
            (status.ok().and_then(|status| status.code()), false)
        }
    };
    alive.store(false, Ordering::SeqCst);

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let _ = events
        .send(SupervisorEvent::Exited {
            category,
            service,
            pid,
            code,
            killed,
        })
        .await;
}

async fn forward_lines<R>(
    reader: R,
    category: String,
    service: String,
    events: mpsc::Sender<SupervisorEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let event = SupervisorEvent::Line {
            category: category.clone(),
            service: service.clone(),
            line,
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}
