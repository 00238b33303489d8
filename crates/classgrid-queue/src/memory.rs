//! In-process broker for single-process setups and tests.
//!
//! Queues are created on first use. Claimed messages move into an in-flight
//! table keyed by receipt handle; expired leases are reclaimed lazily on the
//! next `receive` or `approximate_depth` of that queue rather than by a
//! sweeper task.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use classgrid_core::Attributes;

use crate::{Message, Queue, QueueResult, ReceiptHandle};

#[derive(Debug, Clone)]
struct Stored {
    id: String,
    body: String,
    attributes: Attributes,
    receive_count: u32,
}

#[derive(Default)]
struct SlotState {
    ready: VecDeque<Stored>,
    /// handle → (message, visibility deadline)
    in_flight: HashMap<String, (Stored, Instant)>,
}

impl SlotState {
    /// Return expired leases to the front of the ready queue.
    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in &expired {
            if let Some((msg, _)) = self.in_flight.remove(handle) {
                debug!(message_id = %msg.id, "visibility timeout expired, redelivering");
                self.ready.push_front(msg);
            }
        }
        expired.len()
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|(_, deadline)| *deadline).min()
    }
}

struct QueueSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

struct BrokerInner {
    queues: DashMap<String, Arc<QueueSlot>>,
    visibility_timeout: Duration,
    next_id: AtomicU64,
    next_handle: AtomicU64,
}

/// In-memory at-least-once broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: DashMap::new(),
                visibility_timeout,
                next_id: AtomicU64::new(1),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    fn slot(&self, queue: &str) -> Arc<QueueSlot> {
        self.inner
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| {
                Arc::new(QueueSlot {
                    state: Mutex::new(SlotState::default()),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// Messages currently claimed and not yet acknowledged.
    pub async fn in_flight_count(&self, queue: &str) -> usize {
        self.slot(queue).state.lock().await.in_flight.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Queue for MemoryBroker {
    async fn send(&self, queue: &str, body: &str, attributes: &Attributes) -> QueueResult<String> {
        let id = format!("m-{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = self.slot(queue);
        slot.state.lock().await.ready.push_back(Stored {
            id: id.clone(),
            body: body.to_string(),
            attributes: attributes.clone(),
            receive_count: 0,
        });
        slot.notify.notify_waiters();
        debug!(%queue, message_id = %id, "message sent");
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> QueueResult<Vec<Message>> {
        let slot = self.slot(queue);
        let give_up_at = Instant::now() + wait;

        loop {
            // Register interest before checking so a send between the check
            // and the wait is not missed.
            let notified = slot.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = {
                let mut state = slot.state.lock().await;
                let now = Instant::now();
                state.reclaim_expired(now);

                let mut claimed = Vec::new();
                while claimed.len() < max_messages {
                    let Some(mut msg) = state.ready.pop_front() else {
                        break;
                    };
                    msg.receive_count += 1;
                    let handle = format!(
                        "h-{}",
                        self.inner.next_handle.fetch_add(1, Ordering::Relaxed)
                    );
                    claimed.push(Message {
                        id: msg.id.clone(),
                        body: msg.body.clone(),
                        attributes: msg.attributes.clone(),
                        handle: ReceiptHandle(handle.clone()),
                        receive_count: msg.receive_count,
                    });
                    state
                        .in_flight
                        .insert(handle, (msg, now + self.inner.visibility_timeout));
                }
                if !claimed.is_empty() {
                    return Ok(claimed);
                }
                state.next_expiry()
            };

            if Instant::now() >= give_up_at {
                return Ok(Vec::new());
            }

            let wake_at = next_expiry.map_or(give_up_at, |expiry| expiry.min(give_up_at));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, queue: &str, handle: &ReceiptHandle) -> QueueResult<()> {
        let slot = self.slot(queue);
        let mut state = slot.state.lock().await;
        match state.in_flight.remove(&handle.0) {
            Some((msg, _)) => debug!(%queue, message_id = %msg.id, "message acknowledged"),
            // The lease expired and the message was reclaimed; the new
            // delivery owns it now.
            None => debug!(%queue, %handle, "ack for unknown or expired handle ignored"),
        }
        Ok(())
    }

    async fn approximate_depth(&self, queue: &str) -> QueueResult<usize> {
        let slot = self.slot(queue);
        let mut state = slot.state.lock().await;
        state.reclaim_expired(Instant::now());
        Ok(state.ready.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(name: &str) -> Attributes {
        let mut a = Attributes::new();
        a.insert("FILE_NAME".to_string(), name.to_string());
        a
    }

    #[tokio::test]
    async fn send_then_receive_and_ack() {
        let broker = MemoryBroker::default();
        broker.send("tasks", "cat.jpg", &attrs("cat.jpg")).await.unwrap();
        assert_eq!(broker.approximate_depth("tasks").await.unwrap(), 1);

        let msgs = broker.receive("tasks", 1, Duration::ZERO).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body, "cat.jpg");
        assert_eq!(msgs[0].attributes["FILE_NAME"], "cat.jpg");
        assert_eq!(msgs[0].receive_count, 1);
        assert_eq!(broker.approximate_depth("tasks").await.unwrap(), 0);
        assert_eq!(broker.in_flight_count("tasks").await, 1);

        broker.ack("tasks", &msgs[0].handle).await.unwrap();
        assert_eq!(broker.in_flight_count("tasks").await, 0);
    }

    #[tokio::test]
    async fn receive_respects_max_messages() {
        let broker = MemoryBroker::default();
        for i in 0..5 {
            broker.send("results", &format!("{i}.jpg"), &Attributes::new()).await.unwrap();
        }
        let first = broker.receive("results", 3, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 3);
        let rest = broker.receive("results", 10, Duration::ZERO).await.unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let broker = MemoryBroker::default();
        broker.send("a", "x", &Attributes::new()).await.unwrap();
        assert!(broker.receive("b", 1, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(broker.receive("a", 1, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_is_redelivered_after_visibility_timeout() {
        let broker = MemoryBroker::new(Duration::from_secs(30));
        broker.send("tasks", "cat.jpg", &Attributes::new()).await.unwrap();

        let first = broker.receive("tasks", 1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        // Hidden while the lease is live.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(broker.receive("tasks", 1, Duration::ZERO).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(21)).await;
        let second = broker.receive("tasks", 1, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(second[0].handle, first[0].handle);

        // The stale handle no longer owns the message.
        broker.ack("tasks", &first[0].handle).await.unwrap();
        assert_eq!(broker.in_flight_count("tasks").await, 1);
        broker.ack("tasks", &second[0].handle).await.unwrap();
        assert_eq!(broker.in_flight_count("tasks").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_counts_toward_depth() {
        let broker = MemoryBroker::new(Duration::from_secs(5));
        broker.send("tasks", "a", &Attributes::new()).await.unwrap();
        let _claimed = broker.receive("tasks", 1, Duration::ZERO).await.unwrap();
        assert_eq!(broker.approximate_depth("tasks").await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(broker.approximate_depth("tasks").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_returns_empty_after_wait() {
        let broker = MemoryBroker::default();
        let started = Instant::now();
        let msgs = broker.receive("tasks", 1, Duration::from_secs(10)).await.unwrap();
        assert!(msgs.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_wakes_on_send() {
        let broker = MemoryBroker::default();
        let receiver = broker.clone();
        let handle = tokio::spawn(async move {
            receiver.receive("tasks", 1, Duration::from_secs(20)).await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        broker.send("tasks", "late.jpg", &Attributes::new()).await.unwrap();

        let msgs = handle.await.unwrap().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body, "late.jpg");
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_picks_up_expiring_lease() {
        let broker = MemoryBroker::new(Duration::from_secs(5));
        broker.send("tasks", "a", &Attributes::new()).await.unwrap();
        let _claimed = broker.receive("tasks", 1, Duration::ZERO).await.unwrap();

        let redelivered = broker.receive("tasks", 1, Duration::from_secs(20)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].receive_count, 2);
    }
}
