use crate::{
    dispatcher::{Dispatcher, PendingOperation},
    logs::LogStreams,
};
use deck_core::StatusMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Where a category's log buffer stands relative to the hub's ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSyncState {
    #[default]
    Unknown,
    IdleNoLogs,
    AwaitingHistory,
    Synced,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Categories that need a `get_logs` now.
    pub backfill: Vec<String>,
    pub cleared: Vec<(String, PendingOperation)>,
}

/// Decides, per snapshot, which buffers need history and which pending ops are done.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    awaiting: BTreeSet<String>,
    states: BTreeMap<String, LogSyncState>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, category: &str) -> LogSyncState {
        self.states.get(category).copied().unwrap_or_default()
    }

    pub fn states(&self) -> &BTreeMap<String, LogSyncState> {
        &self.states
    }

    pub fn is_awaiting(&self, category: &str) -> bool {
        self.awaiting.contains(category)
    }

    pub fn on_snapshot(
        &mut self,
        snapshot: &StatusMap,
        logs: &LogStreams,
        dispatcher: &mut Dispatcher,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome {
            cleared: dispatcher.clear_satisfied(snapshot),
            ..ReconcileOutcome::default()
        };

        self.awaiting.retain(|category| snapshot.contains_key(category));
        self.states.retain(|category, _| snapshot.contains_key(category));

        for (category, status) in snapshot {
            let empty = logs.is_empty(category);
            let next = if !status.running {
                self.awaiting.remove(category);
                if empty {
                    LogSyncState::IdleNoLogs
                } else {
                    LogSyncState::Synced
                }
            } else if self.awaiting.contains(category) {
                LogSyncState::AwaitingHistory
            } else if empty {
                self.awaiting.insert(category.clone());
                outcome.backfill.push(category.clone());
                LogSyncState::AwaitingHistory
            } else {
                LogSyncState::Synced
            };
            self.states.insert(category.clone(), next);
        }
        outcome
    }

    /// A `logs` reply arrived for `category`.
    pub fn on_history(&mut self, category: &str) {
        self.awaiting.remove(category);
        self.states.insert(category.to_string(), LogSyncState::Synced);
    }

    pub fn reset(&mut self) {
        self.awaiting.clear();
        self.states.clear();
    }
}
