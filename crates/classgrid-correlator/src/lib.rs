//! classgrid-correlator: matches asynchronous results to waiting requests.
//!
//! The gateway registers a pending request per task id before publishing the
//! task, then suspends on a [`WaitHandle`]. The result relay calls
//! [`Correlator::resolve`] for every result it drains from the result queue,
//! which wakes exactly the one waiter for that id.
//!
//! # Lifecycle
//!
//! ```text
//! begin_wait(id) ──► Pending(tx) ──resolve──► Ready (tx taken, result sent)
//!        │                                          │
//!        └──────── WaitHandle dropped / await_result returns ──► removed
//! ```
//!
//! The pending map is a sharded `DashMap`, so unrelated ids never contend
//! on the same lock and no lock is held while a caller waits.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use classgrid_core::{TaskId, TaskResult};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelatorError {
    /// A request for this id is already waiting.
    #[error("a request for {0} is already in flight")]
    DuplicateKey(TaskId),

    /// No result arrived before the deadline.
    #[error("no result for {id} within {waited:?}")]
    Timeout { id: TaskId, waited: Duration },

    /// The pending request was discarded before a result arrived.
    #[error("wait for {0} was cancelled")]
    Cancelled(TaskId),
}

/// What `resolve` did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiting request.
    Delivered,
    /// No request was waiting (late, duplicate, or unknown id).
    Dropped,
}

struct Pending {
    created_at: Instant,
    /// Taken by the first `resolve`; `None` once the result is ready.
    tx: Option<oneshot::Sender<TaskResult>>,
}

/// In-process map from correlation key to pending result.
#[derive(Clone, Default)]
pub struct Correlator {
    pending: Arc<DashMap<TaskId, Pending>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request for `id`.
    ///
    /// Fails with `DuplicateKey` while another request for the same id is
    /// still pending or unread.
    pub fn begin_wait(&self, id: &str) -> Result<WaitHandle, CorrelatorError> {
        match self.pending.entry(id.to_string()) {
            Entry::Occupied(_) => Err(CorrelatorError::DuplicateKey(id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(Pending {
                    created_at: Instant::now(),
                    tx: Some(tx),
                });
                debug!(task_id = %id, "pending request registered");
                Ok(WaitHandle {
                    id: id.to_string(),
                    rx,
                    pending: Arc::clone(&self.pending),
                })
            }
        }
    }

    /// Hand a result to the request waiting on its id.
    ///
    /// Results nobody is waiting for are dropped; that covers redelivered
    /// duplicates and results arriving after their request timed out.
    pub fn resolve(&self, result: TaskResult) -> Resolution {
        let id = result.id.clone();
        let waiting = self
            .pending
            .get_mut(&id)
            .and_then(|mut pending| pending.tx.take().map(|tx| (tx, pending.created_at)));

        match waiting {
            Some((tx, created_at)) => match tx.send(result) {
                Ok(()) => {
                    debug!(
                        task_id = %id,
                        waited_ms = created_at.elapsed().as_millis() as u64,
                        "result delivered"
                    );
                    Resolution::Delivered
                }
                Err(_) => {
                    debug!(task_id = %id, "waiter went away, dropping result");
                    Resolution::Dropped
                }
            },
            None => {
                debug!(task_id = %id, "no pending request, dropping result");
                Resolution::Dropped
            }
        }
    }

    /// Requests registered and not yet read.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }
}

/// A registered wait for one task id.
///
/// Dropping the handle (for example when the client disconnects and its
/// request future is cancelled) removes the pending entry.
pub struct WaitHandle {
    id: TaskId,
    rx: oneshot::Receiver<TaskResult>,
    pending: Arc<DashMap<TaskId, Pending>>,
}

impl WaitHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Suspend until the result for this id arrives or `timeout` elapses.
    ///
    /// The pending entry is removed on every outcome, so a result that
    /// arrives later is dropped by `resolve`.
    pub async fn await_result(mut self, timeout: Duration) -> Result<TaskResult, CorrelatorError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CorrelatorError::Cancelled(self.id.clone())),
            Err(_) => {
                debug!(task_id = %self.id, ?timeout, "wait timed out");
                Err(CorrelatorError::Timeout {
                    id: self.id.clone(),
                    waited: timeout,
                })
            }
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if self.pending.remove(&self.id).is_some() {
            debug!(task_id = %self.id, "pending request released");
        }
    }
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classgrid_core::{ErrorTag, Task};

    fn result_for(id: &str, label: &str) -> TaskResult {
        TaskResult::success(&Task::new(id), label)
    }

    #[tokio::test]
    async fn resolve_wakes_the_matching_waiter() {
        let correlator = Correlator::new();
        let handle = correlator.begin_wait("cat.jpg").unwrap();

        assert_eq!(
            correlator.resolve(result_for("cat.jpg", "tabby")),
            Resolution::Delivered
        );
        let result = handle.await_result(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.id, "cat.jpg");
        assert_eq!(result.label(), Some("tabby"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_waiters_receive_their_own_results() {
        let correlator = Correlator::new();
        let mut waiters = Vec::new();
        for i in 0..50 {
            let id = format!("img-{i}.jpg");
            let handle = correlator.begin_wait(&id).unwrap();
            waiters.push(tokio::spawn(async move {
                (id, handle.await_result(Duration::from_secs(5)).await)
            }));
        }

        // Resolve in reverse order.
        for i in (0..50).rev() {
            let id = format!("img-{i}.jpg");
            let label = format!("label-{i}");
            assert_eq!(correlator.resolve(result_for(&id, &label)), Resolution::Delivered);
        }

        for waiter in waiters {
            let (id, result) = waiter.await.unwrap();
            let result = result.unwrap();
            assert_eq!(result.id, id);
            let n = id.trim_start_matches("img-").trim_end_matches(".jpg");
            assert_eq!(result.label(), Some(format!("label-{n}").as_str()));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn unmatched_result_is_dropped_without_poisoning_later_waits() {
        let correlator = Correlator::new();
        assert_eq!(
            correlator.resolve(result_for("ghost.jpg", "stale")),
            Resolution::Dropped
        );
        assert_eq!(correlator.pending_count(), 0);

        let handle = correlator.begin_wait("ghost.jpg").unwrap();
        correlator.resolve(result_for("ghost.jpg", "fresh"));
        let result = handle.await_result(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.label(), Some("fresh"));
    }

    #[tokio::test]
    async fn duplicate_begin_wait_is_rejected() {
        let correlator = Correlator::new();
        let _first = correlator.begin_wait("cat.jpg").unwrap();
        assert_eq!(
            correlator.begin_wait("cat.jpg").unwrap_err(),
            CorrelatorError::DuplicateKey("cat.jpg".to_string())
        );
    }

    #[tokio::test]
    async fn concurrent_begin_wait_admits_exactly_one() {
        let correlator = Correlator::new();
        let mut attempts = Vec::new();
        for _ in 0..16 {
            let correlator = correlator.clone();
            attempts.push(tokio::spawn(async move {
                correlator.begin_wait("same.jpg").map(|handle| {
                    // Keep the registration alive past the race.
                    std::mem::forget(handle);
                })
            }));
        }
        let mut admitted = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(()) => admitted += 1,
                Err(e) => assert_eq!(e, CorrelatorError::DuplicateKey("same.jpg".to_string())),
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn second_resolve_for_same_id_is_dropped() {
        let correlator = Correlator::new();
        let handle = correlator.begin_wait("cat.jpg").unwrap();
        assert_eq!(correlator.resolve(result_for("cat.jpg", "tabby")), Resolution::Delivered);
        assert_eq!(correlator.resolve(result_for("cat.jpg", "tiger")), Resolution::Dropped);
        let result = handle.await_result(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.label(), Some("tabby"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cleans_up_and_late_result_is_dropped() {
        let correlator = Correlator::new();
        let handle = correlator.begin_wait("slow.jpg").unwrap();

        let err = handle.await_result(Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, CorrelatorError::Timeout { ref id, .. } if id == "slow.jpg"));
        assert!(!correlator.is_pending("slow.jpg"));

        assert_eq!(
            correlator.resolve(result_for("slow.jpg", "late")),
            Resolution::Dropped
        );
        // The id is free again.
        assert!(correlator.begin_wait("slow.jpg").is_ok());
    }

    #[tokio::test]
    async fn cancelled_wait_releases_entry() {
        let correlator = Correlator::new();
        let handle = correlator.begin_wait("gone.jpg").unwrap();
        let waiter = tokio::spawn(async move { handle.await_result(Duration::from_secs(60)).await });
        tokio::task::yield_now().await;

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(correlator.pending_count(), 0);
        assert!(correlator.begin_wait("gone.jpg").is_ok());
    }

    #[tokio::test]
    async fn error_results_are_delivered_like_labels() {
        let correlator = Correlator::new();
        let handle = correlator.begin_wait("bad.jpg").unwrap();
        let failed = TaskResult::failure(&Task::new("bad.jpg"), ErrorTag::CapabilityFailed, "boom");
        correlator.resolve(failed);
        let result = handle.await_result(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.error_tag(), Some(ErrorTag::CapabilityFailed));
    }
}
