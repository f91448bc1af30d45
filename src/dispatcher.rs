//! Task dispatch: `map` over remote workers.
//!
//! The dispatcher turns an input sequence into uniquely-identified tasks
//! on the shared task queue and hands back a lazy, single-pass stream of
//! results in submission order. Every position resolves: a worker failure
//! or a per-item timeout is yielded as that position's error and the
//! stream continues, so one bad item never terminates the whole map.
//!
//! Dropping the stream early releases the result channels of every id
//! that was never awaited, so abandoned maps leave nothing behind on the
//! broker.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError};
use crate::router::{ResultRouter, RouterError};
use crate::task::{Outcome, Task, TaskOutcome};

/// Default wait budget per item before its position resolves to
/// [`MapError::ItemTimedOut`].
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default lifetime of an unconsumed result channel.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(600);

/// Errors yielded per position of a map's result stream.
///
/// Only [`MapError::Broker`] raised while enqueueing aborts a `map` call;
/// everything else is the resolution of a single position.
#[derive(Debug, Error)]
pub enum MapError {
    /// No worker produced a result for this position within the wait
    /// budget.
    #[error("map item {position} timed out after {waited:?} (task {task_id})")]
    ItemTimedOut {
        position: usize,
        task_id: Uuid,
        waited: Duration,
    },

    /// The worker's processing function failed for this position.
    #[error("map item {position} failed: {error}")]
    ItemFailed { position: usize, error: String },

    /// An item could not be serialized for the wire.
    #[error("failed to encode map item {position}: {source}")]
    Encode {
        position: usize,
        source: serde_json::Error,
    },

    /// A worker's return value did not decode to the expected type.
    #[error("failed to decode result for map item {position}: {source}")]
    Decode {
        position: usize,
        source: serde_json::Error,
    },

    /// The broker failed underneath the dispatcher.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name of the task queue.
    pub queue: String,
    /// Per-item result wait budget. `None` waits forever and must be
    /// chosen explicitly via [`DispatcherConfig::without_result_timeout`].
    pub result_timeout: Option<Duration>,
    /// How long an unconsumed result channel survives.
    pub result_ttl: Duration,
}

impl DispatcherConfig {
    /// Creates a configuration for the named queue with default timeouts.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            result_timeout: Some(DEFAULT_RESULT_TIMEOUT),
            result_ttl: DEFAULT_RESULT_TTL,
        }
    }

    /// Sets the per-item result wait budget.
    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = Some(timeout);
        self
    }

    /// Opts into waiting indefinitely for each result.
    pub fn without_result_timeout(mut self) -> Self {
        self.result_timeout = None;
        self
    }

    /// Sets the unconsumed result channel lifetime.
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }
}

/// Issues tasks and collects their results in submission order.
pub struct Dispatcher<B: Broker> {
    broker: Arc<B>,
    router: ResultRouter<B>,
    config: DispatcherConfig,
}

impl<B: Broker> Dispatcher<B> {
    /// Creates a dispatcher over the given broker.
    pub fn new(broker: Arc<B>, config: DispatcherConfig) -> Self {
        let router = ResultRouter::new(Arc::clone(&broker), &config.queue, config.result_ttl);
        Self {
            broker,
            router,
            config,
        }
    }

    /// Submits every item as a task and returns a lazy stream of results
    /// in submission order.
    ///
    /// All items are enqueued up front; an enqueue failure aborts the
    /// whole call. The stream then resolves one position per `next()`,
    /// waiting on that task's result channel. It is single-pass and not
    /// restartable.
    pub async fn map<I, O>(
        &self,
        items: impl IntoIterator<Item = I>,
    ) -> Result<ResultStream<O>, MapError>
    where
        I: Serialize,
        O: DeserializeOwned + Send + 'static,
    {
        // Encode everything first so a bad item aborts the call before a
        // single task reaches the queue.
        let mut prepared: Vec<(usize, Uuid, Vec<u8>)> = Vec::new();
        for (position, item) in items.into_iter().enumerate() {
            let payload =
                serde_json::to_value(&item).map_err(|source| MapError::Encode { position, source })?;
            let task = Task::new(payload);
            let encoded = serde_json::to_vec(&task)
                .map_err(|source| MapError::Encode { position, source })?;
            prepared.push((position, task.id, encoded));
        }

        let mut submitted: VecDeque<(usize, Uuid)> = VecDeque::with_capacity(prepared.len());
        for (position, task_id, encoded) in prepared {
            self.broker.enqueue(&self.config.queue, encoded).await?;
            debug!(task_id = %task_id, position, queue = %self.config.queue, "submitted task");
            submitted.push_back((position, task_id));
        }

        info!(
            queue = %self.config.queue,
            count = submitted.len(),
            "map submitted"
        );

        Ok(ResultStream::new(
            self.router.clone(),
            submitted,
            self.config.result_timeout,
        ))
    }

    /// Returns the result router backing this dispatcher.
    pub fn router(&self) -> &ResultRouter<B> {
        &self.router
    }

    /// Returns the dispatcher configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

type SharedPending = Arc<Mutex<VecDeque<(usize, Uuid)>>>;

/// Lazy, single-pass, submission-ordered stream of map results.
///
/// Each `next()` resolves the next submitted position to either the
/// decoded worker return value or the [`MapError`] for that position.
/// Dropping the stream before exhaustion releases the result channels of
/// all not-yet-awaited ids (best effort, on a spawned task).
pub struct ResultStream<O> {
    inner: Pin<Box<dyn Stream<Item = Result<O, MapError>> + Send>>,
    pending: SharedPending,
    router_cleanup: Option<Box<dyn FnOnce(Vec<Uuid>) + Send>>,
}

impl<O> std::fmt::Debug for ResultStream<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream").finish_non_exhaustive()
    }
}

impl<O> ResultStream<O>
where
    O: DeserializeOwned + Send + 'static,
{
    fn new<B: Broker>(
        router: ResultRouter<B>,
        submitted: VecDeque<(usize, Uuid)>,
        timeout: Option<Duration>,
    ) -> Self {
        let pending: SharedPending = Arc::new(Mutex::new(submitted));

        let inner = {
            let router = router.clone();
            let pending = Arc::clone(&pending);
            stream! {
                loop {
                    // Leave the entry in place until it resolves, so an
                    // early drop still knows this id was never delivered.
                    let Some((position, task_id)) = pending.lock().expect("pending lock").front().copied() else {
                        break;
                    };

                    let item = match router.await_result(task_id, timeout).await {
                        Ok(outcome) => decode_outcome(position, outcome),
                        Err(RouterError::ResultTimeout { task_id, waited }) => {
                            Err(MapError::ItemTimedOut { position, task_id, waited })
                        }
                        Err(RouterError::Broker(e)) => Err(MapError::Broker(e)),
                        Err(RouterError::Decode(source)) => {
                            Err(MapError::Decode { position, source })
                        }
                    };

                    pending.lock().expect("pending lock").pop_front();
                    yield item;
                }
            }
        };

        let cleanup_router = router;
        let router_cleanup = Box::new(move |ids: Vec<Uuid>| {
            // Purging needs the runtime; outside one there is nothing to
            // leak into because nothing was ever awaited remotely anyway.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    for id in ids {
                        if let Err(e) = cleanup_router.forget(id).await {
                            warn!(task_id = %id, error = %e, "failed to release result channel");
                        }
                    }
                });
            }
        });

        Self {
            inner: Box::pin(inner),
            pending,
            router_cleanup: Some(router_cleanup),
        }
    }
}

impl<O> ResultStream<O> {
    /// Returns how many positions have not yet resolved.
    pub fn remaining(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }
}

impl<O> Stream for ResultStream<O> {
    type Item = Result<O, MapError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl<O> Drop for ResultStream<O> {
    fn drop(&mut self) {
        let leftover: Vec<Uuid> = self
            .pending
            .lock()
            .expect("pending lock")
            .iter()
            .map(|(_, id)| *id)
            .collect();

        if leftover.is_empty() {
            return;
        }

        debug!(count = leftover.len(), "map dropped early; releasing result channels");
        if let Some(cleanup) = self.router_cleanup.take() {
            cleanup(leftover);
        }
    }
}

fn decode_outcome<O: DeserializeOwned>(
    position: usize,
    outcome: TaskOutcome,
) -> Result<O, MapError> {
    match outcome.outcome {
        Outcome::Success(value) => {
            serde_json::from_value(value).map_err(|source| MapError::Decode { position, source })
        }
        Outcome::Failure(error) => Err(MapError::ItemFailed { position, error }),
    }
}
