//! Redis broker with reliable dequeue.
//!
//! Queues are Redis lists. Enqueue is LPUSH so BRPOPLPUSH consumes in FIFO
//! order. Dequeue atomically moves the item into a `{queue}:processing`
//! list; ack removes it from there, nack moves it back to the front of the
//! main queue. An item stranded in the processing list by a crashed
//! consumer can be moved back with [`RedisBroker::recover`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use super::{Broker, BrokerError, Delivery, DeliveryHandle};

/// Redis-backed [`Broker`] over a shared connection manager.
///
/// The connection manager reconnects automatically; a connection that
/// cannot be established at all surfaces as [`BrokerError::Unavailable`].
#[derive(Clone)]
pub struct RedisBroker {
    redis: ConnectionManager,
}

fn processing_list(queue: &str) -> String {
    format!("{}:processing", queue)
}

/// Converts a dequeue budget into a BRPOPLPUSH timeout argument.
///
/// Redis 6+ accepts fractional seconds; a zero timeout would mean "block
/// forever", so sub-millisecond budgets are clamped to one millisecond.
fn blocking_timeout_secs(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(0.001)
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unavailable`] if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Creates a broker from an existing connection manager.
    ///
    /// Useful when sharing a connection pool across components.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Moves items stranded in `{queue}:processing` back onto the main
    /// queue and returns how many were recovered.
    ///
    /// Call this on startup to pick up work dropped by a consumer that
    /// crashed between dequeue and ack. Redelivery is an explicit step,
    /// never something the broker does behind the caller's back.
    pub async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let processing = processing_list(queue);

        let stranded: Vec<Vec<u8>> = conn.lrange(&processing, 0, -1).await?;
        let recovered = stranded.len();

        for raw in stranded {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&processing, 1, raw.as_slice())
                .rpush(queue, raw.as_slice());
            pipe.query_async::<_, ()>(&mut conn).await?;
        }

        if recovered > 0 {
            debug!(queue, recovered, "recovered stranded deliveries");
        }

        Ok(recovered)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(queue, payload).await?;
        Ok(())
    }

    async fn enqueue_expiring(
        &self,
        queue: &str,
        payload: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let ttl_secs = ttl.as_secs().max(1) as i64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(queue, payload)
            .expire(queue, ttl_secs);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.redis.clone();

        // BRPOPLPUSH atomically pops from the queue and parks the item in
        // the processing list until ack or nack.
        let raw: Option<Vec<u8>> = redis::cmd("BRPOPLPUSH")
            .arg(queue)
            .arg(processing_list(queue))
            .arg(blocking_timeout_secs(timeout))
            .query_async(&mut conn)
            .await?;

        Ok(raw.map(|raw| Delivery {
            handle: DeliveryHandle {
                queue: queue.to_string(),
                raw: raw.clone(),
            },
            payload: raw,
        }))
    }

    async fn ack(&self, handle: DeliveryHandle) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(
            processing_list(&handle.queue),
            1,
            handle.raw.as_slice(),
        )
        .await?;
        Ok(())
    }

    async fn nack(&self, handle: DeliveryHandle) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(processing_list(&handle.queue), 1, handle.raw.as_slice())
            .rpush(&handle.queue, handle.raw.as_slice());
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.del(queue).del(processing_list(queue));
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
