use chrono::{DateTime, Utc};
use deck_core::{CommandKind, StatusMap};
use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;

/// How long an unanswered start/stop stays pending.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(2);
/// Delay between an ack and the follow-up `get_status`.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("not connected to the hub")]
    NotConnected,
    #[error("category must not be empty")]
    EmptyCategory,
    #[error("command queue is full")]
    QueueFull,
    #[error("session has shut down")]
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingOperation {
    pub id: u64,
    pub kind: CommandKind,
    pub armed_at: DateTime<Utc>,
}

impl PendingOperation {
    /// True once a snapshot shows the state this command asked for.
    pub fn satisfied_by(&self, running: bool) -> bool {
        self.kind.expected_running() == running
    }
}

/// At most one pending operation per category; re-arming replaces it.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    next_id: u64,
    pending: BTreeMap<String, PendingOperation>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, category: &str, kind: CommandKind) -> PendingOperation {
        self.next_id = self.next_id.wrapping_add(1);
        let op = PendingOperation {
            id: self.next_id,
            kind,
            armed_at: Utc::now(),
        };
        self.pending.insert(category.to_string(), op.clone());
        op
    }

    pub fn pending(&self, category: &str) -> Option<&PendingOperation> {
        self.pending.get(category)
    }

    pub fn is_pending(&self, category: &str) -> bool {
        self.pending.contains_key(category)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Timer path: only clears if the op under `category` is still the one
    /// that armed the timer.
    pub fn expire(&mut self, category: &str, id: u64) -> Option<PendingOperation> {
        match self.pending.get(category) {
            Some(op) if op.id == id => self.pending.remove(category),
            _ => None,
        }
    }

    /// Acks carry no category, so every pending op is released.
    pub fn on_ack(&mut self) -> usize {
        let cleared = self.pending.len();
        self.pending.clear();
        cleared
    }

    /// Drops ops the snapshot confirms, plus ops for categories it no longer lists.
    pub fn clear_satisfied(&mut self, snapshot: &StatusMap) -> Vec<(String, PendingOperation)> {
        let done: Vec<String> = self
            .pending
            .iter()
            .filter(|(category, op)| {
                snapshot
                    .get(category.as_str())
                    .map_or(true, |status| op.satisfied_by(status.running))
            })
            .map(|(category, _)| category.clone())
            .collect();
        done.into_iter()
            .filter_map(|category| {
                let op = self.pending.remove(&category)?;
                Some((category, op))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn kinds(&self) -> BTreeMap<String, CommandKind> {
        self.pending
            .iter()
            .map(|(category, op)| (category.clone(), op.kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deck_core::ServiceStatus;

    #[test]
    fn expire_ignores_a_superseded_operation() {
        let mut dispatcher = Dispatcher::new();
        let first = dispatcher.arm("debt", CommandKind::Start);
        let second = dispatcher.arm("debt", CommandKind::Stop);
        assert_ne!(first.id, second.id);

        assert_eq!(dispatcher.expire("debt", first.id), None);
        assert!(dispatcher.is_pending("debt"));
        assert_eq!(dispatcher.expire("debt", second.id), Some(second.clone()));
        assert!(!dispatcher.is_pending("debt"));
        assert_eq!(dispatcher.expire("debt", second.id), None);
    }

    #[test]
    fn ack_clears_every_category() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.arm("debt", CommandKind::Start);
        dispatcher.arm("msg", CommandKind::Stop);
        assert_eq!(dispatcher.on_ack(), 2);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn snapshot_clears_only_confirmed_or_vanished_categories() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.arm("debt", CommandKind::Start);
        dispatcher.arm("msg", CommandKind::Stop);
        dispatcher.arm("gone", CommandKind::Start);

        let snapshot = StatusMap::from([
            ("debt".to_string(), ServiceStatus::stopped()),
            ("msg".to_string(), ServiceStatus::stopped()),
        ]);
        let cleared: Vec<String> = dispatcher
            .clear_satisfied(&snapshot)
            .into_iter()
            .map(|(category, _)| category)
            .collect();
        assert_eq!(cleared, vec!["gone".to_string(), "msg".to_string()]);
        assert_eq!(
            dispatcher.pending("debt").map(|op| op.kind),
            Some(CommandKind::Start)
        );

        let snapshot = StatusMap::from([(
            "debt".to_string(),
            ServiceStatus::running(Some(42), 1),
        )]);
        assert_eq!(dispatcher.clear_satisfied(&snapshot).len(), 1);
        assert!(dispatcher.is_empty());
    }
}
