//! Provider slot management.
//!
//! The provider tolerates very little concurrency, so every generation
//! call must hold a slot first. The ceiling is configurable but runs at
//! 1 in production, which serializes all provider traffic.
//!
//! State is process-local: this only coordinates correctly while a
//! single worker process executes jobs (the worker claims one job at a
//! time for the same reason). Running multiple worker processes would
//! require moving this counter into a shared store with an atomic
//! increment-with-ceiling-check; the type is the single seam where that
//! swap would happen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Read-only snapshot of slot occupancy, for health/observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    pub current_requests: usize,
    pub max_concurrent: usize,
    pub active_count: usize,
    pub available: bool,
}

#[derive(Default)]
struct SlotState {
    current_requests: usize,
    holders: HashMap<String, Instant>,
}

/// Counter enforcing the provider-call concurrency ceiling.
pub struct SlotManager {
    max_concurrent: usize,
    poll_interval: Duration,
    state: Mutex<SlotState>,
}

impl SlotManager {
    /// Create a manager with the given ceiling (clamped to at least 1).
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            poll_interval: Duration::from_secs(10),
            state: Mutex::new(SlotState::default()),
        }
    }

    /// Override the interval between acquisition attempts in
    /// [`SlotManager::wait_acquire`].
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Try to acquire a slot for the given holder.
    ///
    /// Returns false without side effects when the ceiling is reached.
    pub fn try_acquire(&self, holder_id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.current_requests >= self.max_concurrent {
            debug!(
                holder_id,
                current = state.current_requests,
                "slot not available"
            );
            return false;
        }

        state.current_requests += 1;
        state.holders.insert(holder_id.to_string(), Instant::now());
        debug!(
            holder_id,
            current = state.current_requests,
            "slot acquired"
        );
        true
    }

    /// Release the slot held by `holder_id`.
    ///
    /// Idempotent: releasing a holder that is not active is a no-op.
    pub fn release(&self, holder_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.holders.remove(holder_id).is_some() {
            state.current_requests = state.current_requests.saturating_sub(1);
            debug!(
                holder_id,
                current = state.current_requests,
                "slot released"
            );
        } else {
            warn!(holder_id, "release for holder without a slot, ignoring");
        }
    }

    /// Poll for a slot until acquired or `max_wait` elapses.
    ///
    /// Returns false on timeout without raising. Waiters are not queued:
    /// concurrent waiters race on each wake-up, so admission is not FIFO.
    pub async fn wait_acquire(&self, holder_id: &str, max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            if self.try_acquire(holder_id) {
                return true;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(holder_id, max_wait_secs = max_wait.as_secs(), "slot wait timed out");
                return false;
            }

            let wait = self.poll_interval.min(deadline - now);
            tokio::time::sleep(wait).await;
        }
    }

    /// Like [`SlotManager::wait_acquire`], but returns a guard that
    /// releases the slot when dropped. Dropping the guard is the only
    /// release path the orchestrator uses, so the slot frees even when
    /// the owning future is cancelled or aborted mid-flight.
    pub async fn wait_acquire_owned(
        self: &Arc<Self>,
        holder_id: &str,
        max_wait: Duration,
    ) -> Option<SlotGuard> {
        if self.wait_acquire(holder_id, max_wait).await {
            Some(SlotGuard {
                manager: Arc::clone(self),
                holder_id: holder_id.to_string(),
            })
        } else {
            None
        }
    }

    /// Snapshot of current occupancy.
    pub fn status(&self) -> SlotStatus {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        SlotStatus {
            current_requests: state.current_requests,
            max_concurrent: self.max_concurrent,
            active_count: state.holders.len(),
            available: state.current_requests < self.max_concurrent,
        }
    }

    /// Age of the oldest active slot holder, if any. A holder far past
    /// the task time limit indicates a leaked slot.
    pub fn oldest_holder_age(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.holders.values().map(|t| t.elapsed()).max()
    }
}

/// RAII handle for an acquired slot.
pub struct SlotGuard {
    manager: Arc<SlotManager>,
    holder_id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.manager.release(&self.holder_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_of_one_is_exclusive() {
        let slots = SlotManager::new(1);

        assert!(slots.try_acquire("task-a"));
        assert!(!slots.try_acquire("task-b"));

        slots.release("task-a");
        assert!(slots.try_acquire("task-b"));
    }

    #[test]
    fn ceiling_above_one_admits_up_to_ceiling() {
        let slots = SlotManager::new(2);

        assert!(slots.try_acquire("a"));
        assert!(slots.try_acquire("b"));
        assert!(!slots.try_acquire("c"));
    }

    #[test]
    fn concurrent_acquire_admits_exactly_one() {
        let slots = Arc::new(SlotManager::new(1));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let slots = Arc::clone(&slots);
                std::thread::spawn(move || slots.try_acquire(&format!("task-{i}")))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&acquired| acquired)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn oldest_holder_age_tracks_active_holders() {
        let slots = SlotManager::new(2);
        assert!(slots.oldest_holder_age().is_none());

        assert!(slots.try_acquire("task-a"));
        assert!(slots.oldest_holder_age().is_some());

        slots.release("task-a");
        assert!(slots.oldest_holder_age().is_none());
    }

    #[test]
    fn release_is_idempotent() {
        let slots = SlotManager::new(1);

        assert!(slots.try_acquire("task-a"));
        slots.release("task-a");
        slots.release("task-a");
        slots.release("never-held");

        let status = slots.status();
        assert_eq!(status.current_requests, 0);
        assert!(status.available);
    }

    #[test]
    fn status_reports_occupancy() {
        let slots = SlotManager::new(1);
        assert_eq!(
            slots.status(),
            SlotStatus {
                current_requests: 0,
                max_concurrent: 1,
                active_count: 0,
                available: true,
            }
        );

        slots.try_acquire("task-a");
        assert_eq!(
            slots.status(),
            SlotStatus {
                current_requests: 1,
                max_concurrent: 1,
                active_count: 1,
                available: false,
            }
        );
    }

    #[test]
    fn zero_ceiling_is_clamped() {
        let slots = SlotManager::new(0);
        assert!(slots.try_acquire("task-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_acquire_times_out() {
        let slots = SlotManager::new(1).with_poll_interval(Duration::from_secs(10));
        assert!(slots.try_acquire("holder"));

        let acquired = slots
            .wait_acquire("waiter", Duration::from_secs(35))
            .await;
        assert!(!acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_acquire_succeeds_after_release() {
        let slots = Arc::new(SlotManager::new(1).with_poll_interval(Duration::from_secs(1)));
        assert!(slots.try_acquire("holder"));

        let waiter = {
            let slots = Arc::clone(&slots);
            tokio::spawn(async move {
                slots.wait_acquire("waiter", Duration::from_secs(60)).await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        slots.release("holder");

        assert!(waiter.await.unwrap());
        assert_eq!(slots.status().current_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn guard_releases_on_drop() {
        let slots = Arc::new(SlotManager::new(1));

        let guard = slots
            .wait_acquire_owned("task-a", Duration::from_secs(1))
            .await
            .expect("slot should be free");
        assert!(!slots.status().available);

        drop(guard);
        assert!(slots.status().available);
    }
}
