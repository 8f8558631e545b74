//! GPU accounting: at most one GPU index per live worker.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// Visible GPU count. The real probe lives outside the engine; the
/// `TREELINE_GPU_COUNT` override feeds tests and CPU-only deployments.
pub fn gpu_count() -> usize {
    std::env::var("TREELINE_GPU_COUNT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

pub struct GpuManager {
    total: usize,
    assignments: Mutex<HashMap<String, usize>>,
}

impl GpuManager {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            assignments: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(&self, process_id: &str) -> Option<usize> {
        let mut assignments = self.lock();
        if let Some(existing) = assignments.get(process_id) {
            return Some(*existing);
        }
        let taken: Vec<usize> = assignments.values().copied().collect();
        let free = (0..self.total).find(|idx| !taken.contains(idx))?;
        assignments.insert(process_id.to_string(), free);
        info!("assigned GPU {} to {}", free, process_id);
        Some(free)
    }

    pub fn release(&self, process_id: &str) {
        if self.lock().remove(process_id).is_some() {
            debug!("released GPU for {}", process_id);
        }
    }

    pub fn release_all(&self) {
        self.lock().clear();
    }

    pub fn assigned(&self, process_id: &str) -> Option<usize> {
        self.lock().get(process_id).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        match self.assignments.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
