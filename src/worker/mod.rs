//! Worker side of the engine: handler registration and the worker loop.
//!
//! A worker is an explicit loop owned by the caller: it blocks on the
//! task queue, decodes each task, invokes the registered [`TaskHandler`],
//! and publishes the outcome on the task's result channel. A failing
//! handler produces a `Failure` outcome for that task; it never
//! terminates the loop.
//!
//! Per-task state machine: `Dequeued -> Processing -> {Succeeded, Failed}
//! -> Published`. The delivery is acked only after the outcome is
//! published, so a worker that dies mid-task leaves the task recoverable
//! in the broker's processing ledger.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::Future;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::router::ResultRouter;
use crate::task::{Task, TaskOutcome};

pub mod pool;

pub use pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};

use pool::SharedStats;

/// Processing logic supplied by the embedding application.
///
/// One input value in, one output value out; anything the handler needs
/// beyond that (clients, caches) lives in the implementing type. Errors
/// are reported as failed outcomes for the task at hand, never as loop
/// crashes.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Decoded task payload type.
    type Input: DeserializeOwned + Send;
    /// Return value type, serialized into the outcome.
    type Output: Serialize + Send;

    /// Processes one task payload.
    async fn process(&self, input: Self::Input) -> anyhow::Result<Self::Output>;
}

/// Adapts a plain async function into a [`TaskHandler`].
///
/// ```rust,ignore
/// let handler = handler_fn(|n: i64| async move { Ok(n * n) });
/// ```
pub fn handler_fn<F, Fut, I, O>(f: F) -> FnHandler<F, I, O>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

/// A [`TaskHandler`] built from a function value. See [`handler_fn`].
pub struct FnHandler<F, I, O> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

#[async_trait]
impl<F, Fut, I, O> TaskHandler for FnHandler<F, I, O>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn process(&self, input: I) -> anyhow::Result<O> {
        (self.f)(input).await
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name of the task queue to consume.
    pub queue: String,
    /// Blocking-dequeue slice; also how often the loop notices shutdown.
    pub poll_interval: Duration,
    /// Per-task processing budget. An overrunning handler resolves the
    /// task as a `Failure` outcome. `None` disables the budget.
    pub task_timeout: Option<Duration>,
    /// Lifetime of an unconsumed result channel.
    pub result_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: "tasks".to_string(),
            poll_interval: Duration::from_secs(1),
            task_timeout: Some(Duration::from_secs(1800)),
            result_ttl: crate::dispatcher::DEFAULT_RESULT_TTL,
        }
    }
}

impl WorkerConfig {
    /// Creates a configuration for the named queue.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the per-task processing budget.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Disables the per-task processing budget.
    pub fn without_task_timeout(mut self) -> Self {
        self.task_timeout = None;
        self
    }

    /// Sets the unconsumed result channel lifetime.
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }
}

/// A single long-running consumer of the task queue.
///
/// Usually spawned in numbers by a [`WorkerPool`]; can also be run
/// standalone with [`WorkerLoop::new`] and a caller-owned shutdown
/// channel.
pub struct WorkerLoop<B: Broker, H: TaskHandler> {
    id: String,
    broker: Arc<B>,
    router: ResultRouter<B>,
    handler: Arc<H>,
    config: WorkerConfig,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedStats>,
}

impl<B: Broker, H: TaskHandler> WorkerLoop<B, H> {
    /// Creates a standalone worker loop.
    pub fn new(
        id: impl Into<String>,
        broker: Arc<B>,
        handler: Arc<H>,
        config: WorkerConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self::with_stats(
            id,
            broker,
            handler,
            config,
            shutdown_rx,
            Arc::new(SharedStats::new()),
        )
    }

    pub(crate) fn with_stats(
        id: impl Into<String>,
        broker: Arc<B>,
        handler: Arc<H>,
        config: WorkerConfig,
        shutdown_rx: broadcast::Receiver<()>,
        stats: Arc<SharedStats>,
    ) -> Self {
        let router = ResultRouter::new(Arc::clone(&broker), &config.queue, config.result_ttl);
        Self {
            id: id.into(),
            broker,
            router,
            handler,
            config,
            shutdown_rx,
            stats,
        }
    }

    /// Returns the worker's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs the loop until a shutdown signal arrives.
    ///
    /// The loop finishes the task in hand before returning; it stops
    /// dequeuing as soon as the signal is observed.
    pub async fn run(mut self) {
        info!(worker_id = %self.id, queue = %self.config.queue, "worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self
                .broker
                .dequeue(&self.config.queue, self.config.poll_interval)
                .await
            {
                Ok(Some(delivery)) => {
                    self.process_delivery(delivery).await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "no tasks available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "failed to dequeue task");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    /// Processes one delivery end to end: decode, handle, publish, ack.
    async fn process_delivery(&self, delivery: Delivery) {
        let task: Task = match serde_json::from_slice(&delivery.payload) {
            Ok(task) => task,
            Err(e) => {
                // Poison message: nothing to publish a failure for, since
                // there is no task id to name a channel with.
                error!(worker_id = %self.id, error = %e, "undecodable task payload; dropping");
                self.ack(delivery.handle).await;
                return;
            }
        };

        let task_id = task.id;
        let started = Instant::now();
        debug!(worker_id = %self.id, task_id = %task_id, "processing task");
        self.stats.increment_active();

        let outcome = match serde_json::from_value::<H::Input>(task.payload) {
            Ok(input) => {
                let work = self.handler.process(input);
                let result = match self.config.task_timeout {
                    Some(budget) => match tokio::time::timeout(budget, work).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!(
                            "processing exceeded task budget of {budget:?}"
                        )),
                    },
                    None => work.await,
                };
                let duration_ms = started.elapsed().as_millis() as u64;

                match result.and_then(|out| {
                    serde_json::to_value(out).map_err(anyhow::Error::from)
                }) {
                    Ok(value) => TaskOutcome::success(task_id, &self.id, value, duration_ms),
                    Err(e) => TaskOutcome::failure(task_id, &self.id, e.to_string(), duration_ms),
                }
            }
            Err(e) => TaskOutcome::failure(
                task_id,
                &self.id,
                format!("invalid task payload: {e}"),
                started.elapsed().as_millis() as u64,
            ),
        };

        self.stats.decrement_active();
        let duration = started.elapsed();

        if outcome.is_success() {
            self.stats.record_completion(duration);
            info!(
                worker_id = %self.id,
                task_id = %task_id,
                duration_ms = duration.as_millis() as u64,
                "task succeeded"
            );
        } else {
            self.stats.record_failure(duration);
            warn!(
                worker_id = %self.id,
                task_id = %task_id,
                error = ?outcome.outcome,
                "task failed"
            );
        }

        if let Err(e) = self.router.publish_result(&outcome).await {
            // The task stays resolved at-most-once: the outcome is lost
            // rather than the task re-run.
            error!(worker_id = %self.id, task_id = %task_id, error = %e, "failed to publish result");
        }

        self.ack(delivery.handle).await;
    }

    async fn ack(&self, handle: crate::broker::DeliveryHandle) {
        if let Err(e) = self.broker.ack(handle).await {
            error!(worker_id = %self.id, error = %e, "failed to ack delivery");
        }
    }
}
