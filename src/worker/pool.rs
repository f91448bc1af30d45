//! Pool of worker loops over one shared task queue.
//!
//! Spawns a configurable number of [`WorkerLoop`]s as independent tokio
//! tasks, tracks shared statistics, and shuts them down gracefully via a
//! broadcast signal: each worker finishes its task in hand, stops
//! dequeuing, and returns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broker::Broker;

use super::{TaskHandler, WorkerConfig, WorkerLoop};

/// Errors from pool lifecycle operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool is already running.
    #[error("pool is already running")]
    AlreadyRunning,

    /// The pool is not running.
    #[error("pool is not running")]
    NotRunning,

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker loops to spawn.
    pub num_workers: usize,
    /// Per-worker configuration (queue name, poll interval, budgets).
    pub worker: WorkerConfig,
    /// How long shutdown waits for workers to finish their tasks in hand.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            worker: WorkerConfig::default(),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with the given worker count.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the per-worker configuration.
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// A point-in-time snapshot of pool activity.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Workers currently processing a task.
    pub active_workers: usize,
    /// Tasks resolved with a success outcome.
    pub tasks_succeeded: u64,
    /// Tasks resolved with a failure outcome.
    pub tasks_failed: u64,
    /// Average processing duration across resolved tasks.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Total tasks resolved, success or failure.
    pub fn total_processed(&self) -> u64 {
        self.tasks_succeeded + self.tasks_failed
    }

    /// Success rate as a percentage of resolved tasks.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_succeeded as f64 / total as f64) * 100.0
    }
}

/// Atomics shared between the pool handle and its workers.
pub(crate) struct SharedStats {
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedStats {
    pub(crate) fn new() -> Self {
        Self {
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_completion(&self, duration: Duration) {
        self.tasks_succeeded.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn snapshot(&self, num_workers: usize) -> PoolStats {
        let succeeded = self.tasks_succeeded.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = succeeded + failed;
        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            tasks_succeeded: succeeded,
            tasks_failed: failed,
            average_task_duration: average,
        }
    }
}

/// Manages a set of worker loops sharing one handler and one queue.
pub struct WorkerPool<B: Broker, H: TaskHandler> {
    config: WorkerPoolConfig,
    broker: Arc<B>,
    handler: Arc<H>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedStats>,
    is_running: AtomicBool,
}

impl<B: Broker, H: TaskHandler> WorkerPool<B, H> {
    /// Creates a pool; no workers run until [`WorkerPool::start`].
    pub fn new(config: WorkerPoolConfig, broker: Arc<B>, handler: Arc<H>) -> Self {
        // Buffer of 1 is enough: the signal is sent once.
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            broker,
            handler,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns all workers. They begin consuming the queue immediately.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::AlreadyRunning`] if the pool was started
    /// without an intervening shutdown.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let worker = WorkerLoop::with_stats(
                format!("worker-{}", i),
                Arc::clone(&self.broker),
                Arc::clone(&self.handler),
                self.config.worker.clone(),
                self.shutdown_tx.subscribe(),
                Arc::clone(&self.stats),
            );

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.config.num_workers,
            queue = %self.config.worker.queue,
            "worker pool started"
        );

        Ok(())
    }

    /// Signals every worker to stop and waits for them to finish their
    /// tasks in hand.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ShutdownTimeout`] if workers are still busy
    /// when the shutdown timeout elapses.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("initiating worker pool shutdown");

        // Send may fail if every worker already stopped.
        let _ = self.shutdown_tx.send(());

        let drain = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "worker task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(()) => {
                self.is_running.store(false, Ordering::SeqCst);
                info!("worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                self.is_running.store(false, Ordering::SeqCst);
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the configured number of workers.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}
