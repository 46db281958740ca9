use deck_core::{
    control_ipc::{WireMsg, MAX_LOG_REQUEST},
    LogRing,
};
use std::collections::BTreeMap;

/// Per-category bounded log buffers fed by history replies and live pushes.
#[derive(Debug, Clone)]
pub struct LogStreams {
    capacity: usize,
    buffers: BTreeMap<String, LogRing>,
}

impl LogStreams {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Builds the `get_logs` request for a backfill.
    pub fn request_history(&self, category: &str, limit: usize) -> WireMsg {
        WireMsg::get_logs(category, limit.clamp(1, MAX_LOG_REQUEST))
    }

    /// History is authoritative: whatever was buffered is overwritten.
    pub fn on_history(&mut self, category: &str, lines: Vec<String>) {
        self.ring_mut(category).replace(lines);
    }

    pub fn on_append(&mut self, category: &str, line: String) {
        self.ring_mut(category).push(line);
    }

    pub fn get_buffer(&self, category: &str) -> Vec<String> {
        self.buffers
            .get(category)
            .map(LogRing::to_vec)
            .unwrap_or_default()
    }

    pub fn is_empty(&self, category: &str) -> bool {
        self.buffers.get(category).map_or(true, LogRing::is_empty)
    }

    pub fn clear(&mut self, category: &str) {
        if let Some(ring) = self.buffers.get_mut(category) {
            ring.clear();
        }
    }

    pub fn clear_all(&mut self) {
        self.buffers.clear();
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.buffers
            .iter()
            .map(|(category, ring)| (category.clone(), ring.to_vec()))
            .collect()
    }

    fn ring_mut(&mut self, category: &str) -> &mut LogRing {
        let capacity = self.capacity;
        self.buffers
            .entry(category.to_string())
            .or_insert_with(|| LogRing::new(capacity))
    }
}
