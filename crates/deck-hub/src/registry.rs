use deck_core::{LogRing, ServiceStatus, StatusMap};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;

/// Authoritative state of one category. Only ever mutated under its cell's lock.
#[derive(Debug)]
pub struct CategoryState {
    pub status: ServiceStatus,
    pub logs: LogRing,
}

impl CategoryState {
    /// Returns whether the status actually changed.
    pub fn set_status(&mut self, status: ServiceStatus) -> bool {
        let status = status.normalized();
        if self.status == status {
            return false;
        }
        self.status = status;
        true
    }
}

/// Category set is fixed at startup; each category has its own lock so writers
/// for different categories never contend.
pub struct Registry {
    cells: BTreeMap<String, Arc<Mutex<CategoryState>>>,
}

impl Registry {
    pub fn new<I>(categories: I, log_capacity: usize) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let cells = categories
            .into_iter()
            .map(|category| {
                (
                    category,
                    Arc::new(Mutex::new(CategoryState {
                        status: ServiceStatus::stopped(),
                        logs: LogRing::new(log_capacity),
                    })),
                )
            })
            .collect();
        Self { cells }
    }

    pub fn categories(&self) -> Vec<String> {
        self.cells.keys().cloned().collect()
    }

    pub fn cell(&self, category: &str) -> Option<Arc<Mutex<CategoryState>>> {
        self.cells.get(category).cloned()
    }

    pub async fn snapshot(&self) -> StatusMap {
        let mut services = StatusMap::new();
        for (category, cell) in &self.cells {
            let state = cell.lock().await;
            services.insert(category.clone(), state.status.clone());
        }
        services
    }
}
