//! Broker abstraction: the external-queue seam of the engine.
//!
//! A [`Broker`] exposes named, ordered, shared byte queues with blocking
//! dequeue and an ack/nack contract. Two implementations are provided:
//!
//! - [`RedisBroker`]: Redis lists with reliable dequeue (BRPOPLPUSH)
//! - [`MemoryBroker`]: in-process queues for tests and single-process runs
//!
//! The broker owns all shared mutable state (the task queue and the
//! per-task result channels); dispatcher and workers hold no locks of
//! their own beyond the broker handle.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// Errors surfaced by broker operations.
///
/// A dequeue that finds nothing before its timeout is **not** an error;
/// it returns `Ok(None)`.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Connection to the broker was lost or could not be established.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The underlying Redis operation failed.
    #[error("redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// The broker was shut down while an operation was in flight.
    #[error("broker closed")]
    Closed,
}

/// One dequeued item plus the handle needed to ack or nack it.
///
/// The handle identifies the in-flight item in the broker's processing
/// ledger. Dropping a delivery without acking leaves the item stranded
/// in that ledger until [`RedisBroker::recover`] (or its in-memory
/// equivalent) runs.
#[derive(Debug)]
pub struct Delivery {
    /// Opaque in-flight handle, interpreted only by the broker that
    /// produced it.
    pub handle: DeliveryHandle,
    /// The raw payload as enqueued.
    pub payload: Vec<u8>,
}

/// Identifies an in-flight delivery for ack/nack.
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    pub(crate) queue: String,
    pub(crate) raw: Vec<u8>,
}

/// Named, ordered, shared byte queues with blocking dequeue.
///
/// Delivery contract: an enqueued item is handed to at most one dequeuer;
/// it stays in an in-flight ledger from dequeue until ack (dropped) or
/// nack (returned to the front of its queue).
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Appends a payload to the named queue.
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Appends a payload to the named queue and arms an expiry: if the
    /// queue is untouched for `ttl` it is dropped wholesale. Result
    /// channels use this so channels nobody consumes are garbage
    /// collected.
    async fn enqueue_expiring(
        &self,
        queue: &str,
        payload: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), BrokerError>;

    /// Removes and returns the oldest item, blocking up to `timeout`.
    ///
    /// Returns `Ok(None)` if the timeout elapses with nothing available
    /// (a normal empty poll, not an error).
    async fn dequeue(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Marks a delivery as done, removing it from the in-flight ledger.
    async fn ack(&self, handle: DeliveryHandle) -> Result<(), BrokerError>;

    /// Returns a delivery to the front of its queue for redelivery.
    async fn nack(&self, handle: DeliveryHandle) -> Result<(), BrokerError>;

    /// Drops a queue and everything on it. Used by the dispatcher to
    /// release result channels it will never await.
    async fn purge(&self, queue: &str) -> Result<(), BrokerError>;
}
