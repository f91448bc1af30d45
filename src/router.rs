//! Result routing between workers and dispatchers.
//!
//! Every in-flight task owns a dedicated result channel whose name is
//! derived purely from the task id, so the producing worker and the
//! awaiting dispatcher agree on it without any side channel. A channel
//! carries exactly one [`TaskOutcome`] and is garbage collected after
//! delivery (consuming the single item empties it) or after the result
//! TTL if nobody ever consumes it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError};
use crate::task::TaskOutcome;

/// Poll slice used when the caller opted into waiting indefinitely.
const UNBOUNDED_POLL: Duration = Duration::from_secs(30);

/// Errors from awaiting or publishing results.
#[derive(Debug, Error)]
pub enum RouterError {
    /// No result arrived for the task within the wait budget.
    #[error("no result for task {task_id} within {waited:?}")]
    ResultTimeout { task_id: Uuid, waited: Duration },

    /// The broker failed underneath the router.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A result channel carried bytes that do not decode to an outcome.
    #[error("malformed result payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Routes one [`TaskOutcome`] per task from its producing worker to the
/// single awaiting dispatcher call.
pub struct ResultRouter<B: Broker> {
    broker: Arc<B>,
    queue: String,
    result_ttl: Duration,
}

impl<B: Broker> Clone for ResultRouter<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            queue: self.queue.clone(),
            result_ttl: self.result_ttl,
        }
    }
}

impl<B: Broker> ResultRouter<B> {
    /// Creates a router for the named task queue.
    ///
    /// `result_ttl` bounds how long an unconsumed result channel survives;
    /// a dispatcher that gave up (or was dropped) leaves nothing behind
    /// once the TTL passes.
    pub fn new(broker: Arc<B>, queue: impl Into<String>, result_ttl: Duration) -> Self {
        Self {
            broker,
            queue: queue.into(),
            result_ttl,
        }
    }

    /// Derives the result channel name for a task id.
    ///
    /// Pure function of the queue name and the id; workers and
    /// dispatchers compute it independently.
    pub fn channel_name(&self, task_id: Uuid) -> String {
        format!("{}:result:{}", self.queue, task_id)
    }

    /// Publishes the single outcome for a task.
    ///
    /// The channel expires after the result TTL, so publishing for a task
    /// whose dispatcher already gave up is harmless; the outcome ages out
    /// unread.
    pub async fn publish_result(&self, outcome: &TaskOutcome) -> Result<(), RouterError> {
        let channel = self.channel_name(outcome.task_id);
        let payload = serde_json::to_vec(outcome)?;

        self.broker
            .enqueue_expiring(&channel, payload, self.result_ttl)
            .await?;

        debug!(
            task_id = %outcome.task_id,
            success = outcome.is_success(),
            "published result"
        );
        Ok(())
    }

    /// Blocks until the outcome for `task_id` arrives, or the timeout
    /// elapses with [`RouterError::ResultTimeout`].
    ///
    /// `timeout: None` waits indefinitely; that is an explicit opt-in,
    /// never a default.
    pub async fn await_result(
        &self,
        task_id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<TaskOutcome, RouterError> {
        let channel = self.channel_name(task_id);

        let delivery = match timeout {
            Some(budget) => self
                .broker
                .dequeue(&channel, budget)
                .await?
                .ok_or(RouterError::ResultTimeout {
                    task_id,
                    waited: budget,
                })?,
            None => loop {
                if let Some(delivery) = self.broker.dequeue(&channel, UNBOUNDED_POLL).await? {
                    break delivery;
                }
            },
        };

        let outcome: TaskOutcome = serde_json::from_slice(&delivery.payload)?;
        self.broker.ack(delivery.handle).await?;

        if outcome.task_id != task_id {
            // Channel names are id-derived, so this indicates an external
            // writer on our namespace.
            warn!(
                expected = %task_id,
                got = %outcome.task_id,
                "result channel carried a foreign task id"
            );
        }

        Ok(outcome)
    }

    /// Releases the channel for a task that will never be awaited.
    pub async fn forget(&self, task_id: Uuid) -> Result<(), RouterError> {
        let channel = self.channel_name(task_id);
        self.broker.purge(&channel).await?;
        debug!(task_id = %task_id, "released result channel");
        Ok(())
    }
}
