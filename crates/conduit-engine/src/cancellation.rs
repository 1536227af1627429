//! Process-local cancellation registry, shared across every entry point that
//! runs a long-lived orchestration job (scheduler ticks, direct calls). The
//! design is intentionally minimal: a guarded map from job id to signal, no
//! job management system.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Raised when a job's cancel signal was observed set. Callers should catch
/// this at the boundary of request handling and convert it into a
/// user-visible "cancelled" status rather than treating it as an error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("operation cancelled for job_id={0}")]
pub struct OperationCancelled(pub String);

#[derive(Default)]
pub struct CancellationRegistry {
    events: DashMap<String, Arc<AtomicBool>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self { events: DashMap::new() }
    }

    /// Idempotent: returns the existing signal if one is already registered.
    pub fn create(&self, job_id: &str) -> Arc<AtomicBool> {
        self.events
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<AtomicBool>> {
        self.events.get(job_id).map(|e| e.clone())
    }

    /// Returns whether a signal existed and was set.
    pub fn request_cancel(&self, job_id: &str) -> bool {
        match self.events.get(job_id) {
            Some(event) => {
                event.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self, job_id: &str) {
        self.events.remove(job_id);
    }

    /// Raises `OperationCancelled` if the job has been cancelled, clearing
    /// the entry first so a second check on the same job id never raises.
    pub fn check(&self, job_id: &str) -> Result<(), OperationCancelled> {
        if let Some(event) = self.get(job_id) {
            if event.load(Ordering::SeqCst) {
                self.clear(job_id);
                return Err(OperationCancelled(job_id.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_cancel_without_create_returns_false() {
        let reg = CancellationRegistry::new();
        assert!(!reg.request_cancel("job-1"));
    }

    #[test]
    fn create_is_idempotent() {
        let reg = CancellationRegistry::new();
        let a = reg.create("job-1");
        let b = reg.create("job-1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn check_raises_exactly_once() {
        let reg = CancellationRegistry::new();
        reg.create("job-1");
        assert!(reg.request_cancel("job-1"));

        assert!(reg.check("job-1").is_err());
        // second check: entry was cleared, so no raise.
        assert!(reg.check("job-1").is_ok());
    }

    #[test]
    fn clear_removes_entry() {
        let reg = CancellationRegistry::new();
        reg.create("job-1");
        reg.clear("job-1");
        assert!(reg.get("job-1").is_none());
        assert!(!reg.request_cancel("job-1"));
    }
}
