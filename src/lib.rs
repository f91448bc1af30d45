//! redmap: distributed map over Redis-backed workers.
//!
//! A caller submits a sequence of items with [`Dispatcher::map`] and gets
//! back a lazy stream of results in submission order. Worker processes
//! anywhere on the network run a [`WorkerLoop`] (or a [`WorkerPool`])
//! against the same queue, apply a registered [`TaskHandler`] to each
//! task, and publish outcomes on per-task result channels.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use redmap::{Dispatcher, DispatcherConfig, RedisBroker, WorkerPool, WorkerPoolConfig,
//!              WorkerConfig, handler_fn};
//!
//! let broker = Arc::new(RedisBroker::connect("redis://localhost:6379").await?);
//!
//! // Worker side (any process):
//! let mut pool = WorkerPool::new(
//!     WorkerPoolConfig::new(4).with_worker(WorkerConfig::new("squares")),
//!     Arc::clone(&broker),
//!     Arc::new(handler_fn(|n: i64| async move { Ok(n * n) })),
//! );
//! pool.start()?;
//!
//! // Caller side:
//! let dispatcher = Dispatcher::new(broker, DispatcherConfig::new("squares"));
//! let mut results = dispatcher.map::<_, i64>([2, 3, 4]).await?;
//! while let Some(result) = results.next().await {
//!     println!("{:?}", result); // 4, 9, 16, in submission order
//! }
//! ```
//!
//! Delivery semantics: at-most-once per dequeue+ack. A handler error
//! resolves its task as a failure outcome delivered to the caller; a
//! worker crash mid-task strands the task in the broker's processing
//! ledger until [`RedisBroker::recover`] requeues it.

pub mod broker;
pub mod dispatcher;
pub mod router;
pub mod task;
pub mod worker;

pub use broker::{Broker, BrokerError, Delivery, DeliveryHandle, MemoryBroker, RedisBroker};
pub use dispatcher::{Dispatcher, DispatcherConfig, MapError, ResultStream};
pub use router::{ResultRouter, RouterError};
pub use task::{Outcome, Task, TaskOutcome};
pub use worker::{
    handler_fn, FnHandler, PoolError, PoolStats, TaskHandler, WorkerConfig, WorkerLoop,
    WorkerPool, WorkerPoolConfig,
};
