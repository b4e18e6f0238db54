//! Cancellation registry and the per-attempt abort signal.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{QueueError, Result};
use crate::job::JobId;

/// Abort flag shared between the cancellation requester (single writer) and
/// the running computation (single reader), which polls it.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` once the signal has been raised.
    pub fn check(&self) -> Result<()> {
        if self.is_set() {
            Err(QueueError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Where the job was when cancellation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job is being processed; its signal has been raised.
    Active,
    /// The job has not started; only the mark was recorded.
    NotStarted,
}

#[derive(Debug, Default)]
struct RegistryState {
    marked: HashSet<JobId>,
    active: Option<(JobId, CancelSignal)>,
}

/// Tracks which jobs have been asked to stop.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    state: Mutex<RegistryState>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the job cancelled and raises its signal if it is the active job.
    pub fn request_cancel(&self, id: &JobId) -> CancelOutcome {
        let mut state = self.lock();
        state.marked.insert(*id);
        match &state.active {
            Some((active_id, signal)) if active_id == id => {
                signal.set();
                tracing::info!("Cancellation requested for active job {}", id);
                CancelOutcome::Active
            }
            _ => {
                tracing::debug!("Cancellation requested for job {} before it started", id);
                CancelOutcome::NotStarted
            }
        }
    }

    pub fn is_cancelled(&self, id: &JobId) -> bool {
        self.lock().marked.contains(id)
    }

    /// Drops the cancellation mark for a job whose attempt has fully ended.
    pub fn clear(&self, id: &JobId) {
        self.lock().marked.remove(id);
    }

    /// Allocates a fresh signal and makes `id` the active job.
    ///
    /// Fails with `Cancelled` when the job was cancelled before it could
    /// start, so a cancel racing with the scheduler's pick is never lost.
    pub fn begin_attempt(&self, id: &JobId) -> Result<CancelSignal> {
        let mut state = self.lock();
        if state.marked.contains(id) {
            return Err(QueueError::Cancelled);
        }
        if let Some((previous, signal)) = state.active.take() {
            tracing::warn!("Job {} was still active when {} started", previous, id);
            signal.set();
        }
        let signal = CancelSignal::new();
        state.active = Some((*id, signal.clone()));
        Ok(signal)
    }

    /// Ends the attempt for `id`, discarding its signal and mark.
    pub fn end_attempt(&self, id: &JobId) {
        let mut state = self.lock();
        if matches!(&state.active, Some((active_id, _)) if active_id == id) {
            state.active = None;
        }
        state.marked.remove(id);
    }

    pub fn active_job(&self) -> Option<JobId> {
        self.lock().active.as_ref().map(|(id, _)| *id)
    }

    /// Cancels whatever job is active; used on shutdown.
    pub fn cancel_active(&self) -> Option<JobId> {
        let id = self.active_job()?;
        self.request_cancel(&id);
        Some(id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_active_job_raises_signal() {
        let registry = CancellationRegistry::new();
        let id = JobId::new();
        let signal = registry.begin_attempt(&id).unwrap();
        assert!(!signal.is_set());

        assert_eq!(registry.request_cancel(&id), CancelOutcome::Active);
        assert!(signal.is_set());
        assert!(signal.check().unwrap_err().is_cancelled());
        assert!(registry.is_cancelled(&id));
    }

    #[test]
    fn test_cancel_before_start_blocks_attempt() {
        let registry = CancellationRegistry::new();
        let id = JobId::new();
        assert_eq!(registry.request_cancel(&id), CancelOutcome::NotStarted);
        assert!(registry.begin_attempt(&id).is_err());
        assert_eq!(registry.active_job(), None);
    }

    #[test]
    fn test_signal_is_not_reused_across_jobs() {
        let registry = CancellationRegistry::new();
        let a = JobId::new();
        let b = JobId::new();

        let sig_a = registry.begin_attempt(&a).unwrap();
        registry.request_cancel(&a);
        registry.end_attempt(&a);
        assert!(!registry.is_cancelled(&a));

        let sig_b = registry.begin_attempt(&b).unwrap();
        assert!(sig_a.is_set());
        assert!(!sig_b.is_set());
        assert_eq!(registry.active_job(), Some(b));
    }

    #[test]
    fn test_cancelling_other_job_leaves_active_alone() {
        let registry = CancellationRegistry::new();
        let active = JobId::new();
        let other = JobId::new();
        let signal = registry.begin_attempt(&active).unwrap();

        assert_eq!(registry.request_cancel(&other), CancelOutcome::NotStarted);
        assert!(!signal.is_set());
        registry.clear(&other);
        assert!(!registry.is_cancelled(&other));
    }

    #[test]
    fn test_signal_visible_across_threads() {
        let registry = Arc::new(CancellationRegistry::new());
        let id = JobId::new();
        let signal = registry.begin_attempt(&id).unwrap();

        let poller = std::thread::spawn(move || {
            while !signal.is_set() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(registry.cancel_active(), Some(id));
        poller.join().unwrap();
    }
}
