//! In-process broker.
//!
//! Honors the same contract as [`RedisBroker`](super::RedisBroker):
//! FIFO ordering, blocking dequeue with timeout, an in-flight ledger for
//! ack/nack, and queue expiry for result channels. Intended for tests and
//! single-process deployments; everything lives behind one async mutex,
//! which is plenty for those uses.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::{Broker, BrokerError, Delivery, DeliveryHandle};

struct QueueState {
    items: VecDeque<Vec<u8>>,
    in_flight: Vec<Vec<u8>>,
    /// When set, the queue is dropped wholesale once this instant passes.
    expires_at: Option<Instant>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            in_flight: Vec::new(),
            expires_at: None,
            notify: Arc::new(Notify::new()),
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-memory [`Broker`] for tests and single-process runs.
///
/// Cloning is cheap and all clones share the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the number of queues currently held in memory.
    pub async fn queue_count(&self) -> usize {
        let mut queues = self.queues.lock().await;
        Self::sweep(&mut queues);
        queues.len()
    }

    /// Returns the number of items waiting on a queue.
    pub async fn len(&self, queue: &str) -> usize {
        let mut queues = self.queues.lock().await;
        Self::sweep(&mut queues);
        queues.get(queue).map_or(0, |q| q.items.len())
    }

    /// Returns whether a queue is empty (or absent).
    pub async fn is_empty(&self, queue: &str) -> bool {
        self.len(queue).await == 0
    }

    /// Returns the number of dequeued-but-unacked items on a queue.
    pub async fn in_flight(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map_or(0, |q| q.in_flight.len())
    }

    /// Moves unacked items back onto their queue, oldest first, and
    /// returns how many were recovered. Mirror of
    /// [`RedisBroker::recover`](super::RedisBroker::recover).
    pub async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let recovered = state.in_flight.len();
        for raw in state.in_flight.drain(..) {
            state.items.push_back(raw);
            state.notify.notify_one();
        }
        Ok(recovered)
    }

    fn sweep(queues: &mut HashMap<String, QueueState>) {
        queues.retain(|_, state| !state.expired());
    }

    /// Drops a queue whose list and in-flight ledger are both empty.
    ///
    /// Mirrors Redis, where an empty list and a missing key are the same
    /// thing; without this, every timed-out wait on a result channel
    /// would leave a permanent entry in the queue map.
    fn remove_if_empty(queues: &mut HashMap<String, QueueState>, queue: &str) {
        if queues
            .get(queue)
            .is_some_and(|state| state.items.is_empty() && state.in_flight.is_empty())
        {
            queues.remove(queue);
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().await;
        Self::sweep(&mut queues);
        let state = queues
            .entry(queue.to_string())
            .or_insert_with(QueueState::new);
        state.items.push_back(payload);
        state.notify.notify_one();
        Ok(())
    }

    async fn enqueue_expiring(
        &self,
        queue: &str,
        payload: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().await;
        Self::sweep(&mut queues);
        let state = queues
            .entry(queue.to_string())
            .or_insert_with(QueueState::new);
        state.items.push_back(payload);
        state.expires_at = Some(Instant::now() + ttl);
        state.notify.notify_one();
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notify = {
                let mut queues = self.queues.lock().await;
                Self::sweep(&mut queues);
                let state = queues
                    .entry(queue.to_string())
                    .or_insert_with(QueueState::new);

                if let Some(raw) = state.items.pop_front() {
                    state.in_flight.push(raw.clone());
                    return Ok(Some(Delivery {
                        handle: DeliveryHandle {
                            queue: queue.to_string(),
                            raw: raw.clone(),
                        },
                        payload: raw,
                    }));
                }
                Arc::clone(&state.notify)
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let timed_out = remaining.is_zero()
                || tokio::time::timeout(remaining, notify.notified())
                    .await
                    .is_err();
            if timed_out {
                let mut queues = self.queues.lock().await;
                Self::remove_if_empty(&mut queues, queue);
                return Ok(None);
            }
        }
    }

    async fn ack(&self, handle: DeliveryHandle) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(&handle.queue) {
            if let Some(pos) = state.in_flight.iter().position(|raw| *raw == handle.raw) {
                state.in_flight.remove(pos);
            }
        }
        Self::remove_if_empty(&mut queues, &handle.queue);
        // An unknown handle is not an error; the queue may have been purged.
        Ok(())
    }

    async fn nack(&self, handle: DeliveryHandle) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(&handle.queue) {
            if let Some(pos) = state.in_flight.iter().position(|raw| *raw == handle.raw) {
                let raw = state.in_flight.remove(pos);
                state.items.push_front(raw);
                state.notify.notify_one();
            }
        }
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.remove(queue) {
            // Wake any blocked dequeuers so they re-check and time out.
            state.notify.notify_waiters();
        }
        Ok(())
    }
}
