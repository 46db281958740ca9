use deck_core::{ServiceStatus, StatusMap};

/// Local copy of the hub's service table. Only snapshots write to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMirror {
    services: StatusMap,
}

impl ServiceMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole table; categories missing from `snapshot` are gone.
    pub fn apply_snapshot(&mut self, snapshot: StatusMap) {
        self.services = snapshot
            .into_iter()
            .map(|(category, status)| (category, status.normalized()))
            .collect();
    }

    pub fn get(&self, category: &str) -> Option<&ServiceStatus> {
        self.services.get(category)
    }

    pub fn all(&self) -> &StatusMap {
        &self.services
    }

    pub fn is_running(&self, category: &str) -> bool {
        self.get(category).is_some_and(|status| status.running)
    }

    pub fn clear(&mut self) {
        self.services.clear();
    }
}
