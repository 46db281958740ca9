pub mod control_ipc;
pub mod log_ring;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use log_ring::LogRing;

/// Lines kept per category, both in the hub's rings and the dashboard buffers.
pub const DEFAULT_LOG_LIMIT: usize = 100;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_DEGRADED: &str = "degraded";
pub const STATUS_STOPPED: &str = "stopped";

/// Snapshot of every known category, keyed by category name.
pub type StatusMap = BTreeMap<String, ServiceStatus>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub running: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub process_count: u32,
}

impl ServiceStatus {
    pub fn stopped() -> Self {
        Self {
            running: false,
            pid: None,
            status: STATUS_STOPPED.to_string(),
            process_count: 0,
        }
    }

    pub fn running(pid: Option<u32>, process_count: u32) -> Self {
        Self {
            running: true,
            pid,
            status: STATUS_RUNNING.to_string(),
            process_count,
        }
    }

    /// A stopped service never carries a pid.
    pub fn normalized(mut self) -> Self {
        if !self.running {
            self.pid = None;
        }
        self
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self::stopped()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Start,
    Stop,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
        }
    }

    /// The `running` value a snapshot must show once this command took effect.
    pub fn expected_running(&self) -> bool {
        matches!(self, CommandKind::Start)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_status_drops_pid_when_normalized() {
        let status = ServiceStatus {
            running: false,
            pid: Some(4242),
            status: "stopped".to_string(),
            process_count: 0,
        }
        .normalized();
        assert_eq!(status.pid, None);

        let running = ServiceStatus::running(Some(7), 2).normalized();
        assert_eq!(running.pid, Some(7));
    }

    #[test]
    fn status_accepts_null_pid_and_missing_optionals() {
        let status: ServiceStatus =
            serde_json::from_str(r#"{"running": false, "pid": null}"#).expect("parse status");
        assert!(!status.running);
        assert_eq!(status.pid, None);
        assert_eq!(status.process_count, 0);
        assert!(status.status.is_empty());
    }
}
