//! End-to-end tests for the dispatch engine.
//!
//! Most tests run against the in-memory broker and need no external
//! services. The Redis-backed tests make real calls to a local Redis and
//! are ignored by default. Run with:
//! REDIS_URL=redis://localhost:6379 cargo test --test map_roundtrip -- --ignored

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use redmap::{
    handler_fn, Broker, Dispatcher, DispatcherConfig, MapError, MemoryBroker, RedisBroker,
    WorkerConfig, WorkerPool, WorkerPoolConfig,
};

static TRACING: std::sync::Once = std::sync::Once::new();

/// Installs a subscriber once so RUST_LOG surfaces engine logs in tests.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

fn fast_worker_config(queue: &str) -> WorkerConfig {
    WorkerConfig::new(queue).with_poll_interval(Duration::from_millis(20))
}

fn dispatcher_for(broker: Arc<MemoryBroker>, queue: &str) -> Dispatcher<MemoryBroker> {
    Dispatcher::new(
        broker,
        DispatcherConfig::new(queue).with_result_timeout(Duration::from_secs(5)),
    )
}

#[tokio::test]
async fn square_map_yields_results_in_submission_order() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new());

    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(3).with_worker(fast_worker_config("squares")),
        Arc::clone(&broker),
        Arc::new(handler_fn(|n: i64| async move {
            // Jitter processing time so completion order differs from
            // submission order.
            tokio::time::sleep(Duration::from_millis((n % 3) as u64 * 15)).await;
            Ok(n * n)
        })),
    );
    pool.start().expect("pool should start");

    let dispatcher = dispatcher_for(Arc::clone(&broker), "squares");
    let results: Vec<i64> = dispatcher
        .map::<_, i64>([2, 3, 4])
        .await
        .expect("map should submit")
        .map(|r| r.expect("every position should succeed"))
        .collect()
        .await;

    assert_eq!(results, vec![4, 9, 16]);

    pool.shutdown().await.expect("pool should shut down");
}

#[tokio::test]
async fn map_yields_exactly_one_result_per_item() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new());

    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(2).with_worker(fast_worker_config("echo")),
        Arc::clone(&broker),
        Arc::new(handler_fn(|s: String| async move { Ok(s.to_uppercase()) })),
    );
    pool.start().unwrap();

    let dispatcher = dispatcher_for(Arc::clone(&broker), "echo");
    let inputs = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
    let results: Vec<String> = dispatcher
        .map::<_, String>(inputs.clone())
        .await
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;

    assert_eq!(results, vec!["A", "B", "C", "D"]);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_item_does_not_terminate_the_stream() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new());

    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(1).with_worker(fast_worker_config("flaky")),
        Arc::clone(&broker),
        Arc::new(handler_fn(|n: i64| async move {
            if n == 13 {
                anyhow::bail!("unlucky input")
            }
            Ok(n * 10)
        })),
    );
    pool.start().unwrap();

    let dispatcher = dispatcher_for(Arc::clone(&broker), "flaky");
    let results: Vec<Result<i64, MapError>> = dispatcher
        .map::<_, i64>([1, 13, 3])
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 3, "one result per input, even after a failure");
    assert_eq!(*results[0].as_ref().unwrap(), 10);
    match &results[1] {
        Err(MapError::ItemFailed { position, error }) => {
            assert_eq!(*position, 1);
            assert!(error.contains("unlucky input"));
        }
        other => panic!("expected a failure at position 1, got {other:?}"),
    }
    assert_eq!(*results[2].as_ref().unwrap(), 30);

    pool.shutdown().await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.tasks_succeeded, 2);
    assert_eq!(stats.tasks_failed, 1);
}

#[tokio::test]
async fn missing_workers_resolve_to_timeouts_not_hangs() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new());
    let dispatcher = Dispatcher::new(
        Arc::clone(&broker),
        DispatcherConfig::new("nobody-home").with_result_timeout(Duration::from_millis(100)),
    );

    let results: Vec<Result<i64, MapError>> = dispatcher
        .map::<_, i64>([1, 2])
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 2);
    for (i, item) in results.iter().enumerate() {
        match item {
            Err(MapError::ItemTimedOut { position, .. }) => assert_eq!(*position, i),
            other => panic!("expected timeout at position {i}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn two_workers_process_every_task_exactly_once() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new());
    let processed = Arc::new(AtomicUsize::new(0));

    let handler = {
        let processed = Arc::clone(&processed);
        handler_fn(move |n: i64| {
            let processed = Arc::clone(&processed);
            async move {
                processed.fetch_add(1, Ordering::SeqCst);
                Ok(n + 1000)
            }
        })
    };

    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(2).with_worker(fast_worker_config("bulk")),
        Arc::clone(&broker),
        Arc::new(handler),
    );
    pool.start().unwrap();

    let dispatcher = Dispatcher::new(
        Arc::clone(&broker),
        DispatcherConfig::new("bulk").with_result_timeout(Duration::from_secs(10)),
    );

    let inputs: Vec<i64> = (0..100).collect();
    let results: Vec<i64> = dispatcher
        .map::<_, i64>(inputs)
        .await
        .unwrap()
        .map(|r| r.expect("no task should be lost"))
        .collect()
        .await;

    let expected: Vec<i64> = (0..100).map(|n| n + 1000).collect();
    assert_eq!(results, expected, "no loss, submission order preserved");
    assert_eq!(
        processed.load(Ordering::SeqCst),
        100,
        "no task processed twice"
    );

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn independent_runs_share_nothing() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new());

    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(1).with_worker(fast_worker_config("runs")),
        Arc::clone(&broker),
        Arc::new(handler_fn(|n: i64| async move { Ok(-n) })),
    );
    pool.start().unwrap();

    let dispatcher = dispatcher_for(Arc::clone(&broker), "runs");

    let first: Vec<i64> = dispatcher
        .map::<_, i64>([1, 2, 3])
        .await
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;
    let second: Vec<i64> = dispatcher
        .map::<_, i64>([1, 2, 3])
        .await
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;

    assert_eq!(first, vec![-1, -2, -3]);
    assert_eq!(second, vec![-1, -2, -3]);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_maps_do_not_cross_talk() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new());

    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(2).with_worker(fast_worker_config("shared")),
        Arc::clone(&broker),
        Arc::new(handler_fn(|n: i64| async move { Ok(n * 2) })),
    );
    pool.start().unwrap();

    let dispatcher = Arc::new(dispatcher_for(Arc::clone(&broker), "shared"));

    let a = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .map::<_, i64>([1, 2, 3])
                .await
                .unwrap()
                .map(|r| r.unwrap())
                .collect::<Vec<i64>>()
                .await
        })
    };
    let b = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .map::<_, i64>([10, 20, 30])
                .await
                .unwrap()
                .map(|r| r.unwrap())
                .collect::<Vec<i64>>()
                .await
        })
    };

    assert_eq!(a.await.unwrap(), vec![2, 4, 6]);
    assert_eq!(b.await.unwrap(), vec![20, 40, 60]);

    pool.shutdown().await.unwrap();
}

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

#[tokio::test]
#[ignore] // Needs a local Redis; see the header comment for the run command.
async fn redis_square_map_roundtrip() {
    init_tracing();
    let broker = Arc::new(
        RedisBroker::connect(&redis_url())
            .await
            .expect("redis should be reachable"),
    );

    // Unique queue per run so reruns never see stale state.
    let queue = format!("redmap-test:{}", uuid::Uuid::new_v4());

    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(2).with_worker(fast_worker_config(&queue)),
        Arc::clone(&broker),
        Arc::new(handler_fn(|n: i64| async move { Ok(n * n) })),
    );
    pool.start().unwrap();

    let dispatcher = Dispatcher::new(
        Arc::clone(&broker),
        DispatcherConfig::new(&queue).with_result_timeout(Duration::from_secs(10)),
    );

    let results: Vec<i64> = dispatcher
        .map::<_, i64>([2, 3, 4])
        .await
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(results, vec![4, 9, 16]);

    pool.shutdown().await.unwrap();
    broker.purge(&queue).await.unwrap();
}

#[tokio::test]
#[ignore] // Needs a local Redis; see the header comment for the run command.
async fn redis_recover_requeues_stranded_tasks() {
    init_tracing();
    let broker = RedisBroker::connect(&redis_url())
        .await
        .expect("redis should be reachable");
    let queue = format!("redmap-test:{}", uuid::Uuid::new_v4());

    broker.enqueue(&queue, b"payload".to_vec()).await.unwrap();
    let delivery = broker
        .dequeue(&queue, Duration::from_secs(1))
        .await
        .unwrap()
        .expect("item should be delivered");
    drop(delivery); // consumer "crashed" without acking

    assert_eq!(broker.recover(&queue).await.unwrap(), 1);

    let again = broker
        .dequeue(&queue, Duration::from_secs(1))
        .await
        .unwrap()
        .expect("stranded item should be redelivered");
    assert_eq!(again.payload, b"payload");

    broker.ack(again.handle).await.unwrap();
    broker.purge(&queue).await.unwrap();
}
