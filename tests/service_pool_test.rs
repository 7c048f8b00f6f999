//! Integration tests for the service pool.
//!
//! This test validates:
//! 1. Concurrency never exceeds capacity
//! 2. Corrupted handles are evicted, healthy ones reused
//! 3. Statistics add up
//! 4. The idle sweep keeps the configured floor
//! 5. Permit timeouts, cancellation and shutdown
//! 6. The idle poll and temporary-handle fallbacks

use std::sync::Arc;
use std::time::Duration;

use resilient_scheduler::core::{
    NativeError, NativeErrorKind, PoolSettings, SchedulerError, SchedulerService, ServicePool,
    TaskServicePool,
};
use resilient_scheduler::infra::InMemoryServiceFactory;
use tokio::sync::{oneshot, Barrier};
use tokio_util::sync::CancellationToken;

fn settings(capacity: usize, min_handles: usize) -> PoolSettings {
    PoolSettings {
        capacity,
        acquire_timeout: Duration::from_secs(5),
        min_handles,
        idle_timeout: Duration::from_secs(10),
        cleanup_interval: Duration::from_secs(3600),
        idle_poll_timeout: Duration::from_millis(50),
    }
}

async fn list_root(pool: &ServicePool<InMemoryServiceFactory>) -> Result<(), SchedulerError> {
    pool.execute(&CancellationToken::new(), |svc| async move {
        svc.list_tasks("\\")
            .await
            .map(|_| ())
            .map_err(SchedulerError::from)
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_bounded_by_capacity() {
    let factory = InMemoryServiceFactory::new();
    factory.set_latency(Duration::from_millis(50));
    let pool = Arc::new(ServicePool::new(factory.clone(), settings(3, 0)).unwrap());

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move { list_root(&pool).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(factory.max_concurrent_calls(), 3);
    let stats = pool.stats();
    assert_eq!(stats.total_operations, 10);
    assert_eq!(stats.failed_operations, 0);
    assert!(stats.total_instances <= 3);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn test_corrupted_handle_is_evicted() {
    let factory = InMemoryServiceFactory::new();
    let pool = ServicePool::new(factory.clone(), settings(2, 0)).unwrap();

    list_root(&pool).await.unwrap();
    assert_eq!(pool.stats().total_instances, 1);
    let first = pool.handles()[0].id;

    factory.inject_error(NativeError::new(NativeErrorKind::InteropFailure, "RPC server unavailable"));
    let err = list_root(&pool).await.unwrap_err();
    assert!(err.is_corruption());

    let stats = pool.stats();
    assert_eq!(stats.total_instances, 0);
    assert_eq!(stats.available, 0);
    assert_eq!(stats.corrupted_evictions, 1);
    assert_eq!(factory.closed(), 1);

    list_root(&pool).await.unwrap();
    let handles = pool.handles();
    assert_eq!(handles.len(), 1);
    assert_ne!(handles[0].id, first);
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn test_transient_failure_keeps_handle() {
    let factory = InMemoryServiceFactory::new();
    let pool = ServicePool::new(factory.clone(), settings(2, 0)).unwrap();

    factory.inject_error(NativeError::new(NativeErrorKind::Network, "connection reset"));
    assert!(list_root(&pool).await.is_err());

    let stats = pool.stats();
    assert_eq!(stats.total_instances, 1);
    assert_eq!(stats.available, 1);
    assert_eq!(stats.corrupted_evictions, 0);
    assert_eq!(factory.closed(), 0);
}

#[tokio::test]
async fn test_pool_never_retries() {
    let factory = InMemoryServiceFactory::new();
    let pool = ServicePool::new(factory.clone(), settings(1, 0)).unwrap();

    factory.inject_error(NativeError::new(NativeErrorKind::ServiceUnavailable, "busy"));
    assert!(list_root(&pool).await.is_err());
    assert_eq!(factory.native_calls(), 1);
}

#[tokio::test]
async fn test_stats_count_successes_and_failures() {
    let factory = InMemoryServiceFactory::new();
    let pool = ServicePool::new(factory.clone(), settings(2, 0)).unwrap();
    let (successes, failures) = (5u64, 3u64);

    for _ in 0..successes {
        list_root(&pool).await.unwrap();
    }
    factory.inject_errors(
        &NativeError::new(NativeErrorKind::Io, "disk"),
        usize::try_from(failures).unwrap(),
    );
    for _ in 0..failures {
        assert!(list_root(&pool).await.is_err());
    }

    let stats = pool.stats();
    assert_eq!(stats.total_operations, successes + failures);
    assert_eq!(stats.failed_operations, failures);
    assert_eq!(stats.capacity, 2);
    assert_eq!(stats.temporary_handles_created, 0);
}

/// Check out `count` handles at once so the pool ends up tracking `count`.
async fn fill(pool: &ServicePool<InMemoryServiceFactory>, count: usize) {
    let barrier = &Arc::new(Barrier::new(count));
    let cancel = &CancellationToken::new();
    let calls = (0..count).map(move |_| {
        let barrier = Arc::clone(barrier);
        pool.execute(cancel, move |_svc| async move {
            barrier.wait().await;
            Ok::<_, SchedulerError>(())
        })
    });
    for result in futures::future::join_all(calls).await {
        result.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_sweep_keeps_floor() {
    let factory = InMemoryServiceFactory::new();
    let pool = ServicePool::new(factory.clone(), settings(4, 1)).unwrap();

    fill(&pool, 3).await;
    assert_eq!(pool.stats().total_instances, 3);
    assert_eq!(pool.stats().available, 3);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(pool.evict_idle(), 0);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(pool.evict_idle(), 2);

    let stats = pool.stats();
    assert_eq!(stats.total_instances, 1);
    assert_eq!(stats.idle_evictions, 2);
    assert_eq!(factory.closed(), 2);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(pool.evict_idle(), 0);
    assert_eq!(pool.stats().total_instances, 1);
}

#[tokio::test(start_paused = true)]
async fn test_background_sweep_runs() {
    let factory = InMemoryServiceFactory::new();
    let mut s = settings(4, 1);
    s.idle_timeout = Duration::from_secs(2);
    s.cleanup_interval = Duration::from_secs(1);
    let pool = ServicePool::new(factory.clone(), s).unwrap();

    fill(&pool, 3).await;
    assert_eq!(pool.stats().total_instances, 3);

    tokio::time::sleep(Duration::from_secs(5)).await;

    let stats = pool.stats();
    assert_eq!(stats.total_instances, 1);
    assert_eq!(stats.idle_evictions, 2);
}

#[tokio::test(start_paused = true)]
async fn test_warm_up_creates_floor() {
    let factory = InMemoryServiceFactory::new();
    let pool = ServicePool::new(factory.clone(), settings(4, 2)).unwrap();

    assert_eq!(pool.warm_up().await.unwrap(), 2);
    assert_eq!(pool.warm_up().await.unwrap(), 0);
    assert_eq!(factory.created(), 2);
    assert_eq!(pool.stats().available, 2);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_timeout_reports_pool_exhausted() {
    let factory = InMemoryServiceFactory::new();
    let mut s = settings(1, 0);
    s.acquire_timeout = Duration::from_millis(200);
    let pool = ServicePool::new(factory, s).unwrap();
    let cancel = CancellationToken::new();
    let (release, held) = oneshot::channel::<()>();

    let holder = pool.execute(&cancel, |_svc| async move {
        let _ = held.await;
        Ok::<_, SchedulerError>(())
    });
    let waiter = async {
        let result = pool
            .execute(&cancel, |_svc| async { Ok::<_, SchedulerError>(()) })
            .await;
        let _ = release.send(());
        result
    };

    let (first, second) = tokio::join!(holder, waiter);
    first.unwrap();
    let err = second.unwrap_err();
    assert!(matches!(err, SchedulerError::PoolExhausted { capacity: 1, .. }));
    assert!(err.is_timeout());
    assert!(err.is_retriable());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_for_permit() {
    let factory = InMemoryServiceFactory::new();
    let pool = ServicePool::new(factory, settings(1, 0)).unwrap();
    let holder_cancel = CancellationToken::new();
    let waiter_cancel = CancellationToken::new();
    let (release, held) = oneshot::channel::<()>();

    let holder = pool.execute(&holder_cancel, |_svc| async move {
        let _ = held.await;
        Ok::<_, SchedulerError>(())
    });
    let waiter = async {
        let trigger = waiter_cancel.clone();
        let cancel_soon = async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        };
        let (result, ()) = tokio::join!(
            pool.execute(&waiter_cancel, |_svc| async { Ok::<_, SchedulerError>(()) }),
            cancel_soon
        );
        let _ = release.send(());
        result
    };

    let (first, second) = tokio::join!(holder, waiter);
    first.unwrap();
    assert!(second.unwrap_err().is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_operation_returns_handle_and_permit() {
    let factory = InMemoryServiceFactory::new();
    let pool = ServicePool::new(factory.clone(), settings(1, 0)).unwrap();
    let cancel = CancellationToken::new();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        pool.execute(&cancel, |_svc| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, SchedulerError>(())
        }),
    )
    .await;
    assert!(abandoned.is_err());

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.available, 1);
    assert_eq!(stats.failed_operations, 1);

    list_root(&pool).await.unwrap();
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn test_execute_after_shutdown_is_disposed() {
    let factory = InMemoryServiceFactory::new();
    let pool = ServicePool::new(factory.clone(), settings(2, 0)).unwrap();
    list_root(&pool).await.unwrap();
    let calls_before = factory.native_calls();

    pool.shutdown();
    assert!(pool.is_disposed());
    assert_eq!(factory.closed(), 1);
    assert_eq!(pool.stats().total_instances, 0);

    let err = list_root(&pool).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Disposed));
    assert_eq!(factory.native_calls(), calls_before);

    pool.shutdown();
    assert_eq!(factory.closed(), 1);
}

#[tokio::test]
async fn test_in_flight_handle_closed_after_shutdown() {
    let factory = InMemoryServiceFactory::new();
    let pool = ServicePool::new(factory.clone(), settings(2, 0)).unwrap();
    let cancel = CancellationToken::new();

    pool.execute(&cancel, |_svc| async {
        pool.shutdown();
        Ok::<_, SchedulerError>(())
    })
    .await
    .unwrap();

    assert_eq!(factory.created(), 1);
    assert_eq!(factory.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_warm_up_closes_new_handle() {
    let factory = InMemoryServiceFactory::new();
    factory.set_create_latency(Duration::from_millis(100));
    let pool = ServicePool::new(factory.clone(), settings(2, 1)).unwrap();

    let (warmed, ()) = tokio::join!(pool.warm_up(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.shutdown();
    });

    assert!(matches!(warmed, Err(SchedulerError::Disposed)));
    assert_eq!(factory.created(), 1);
    assert_eq!(factory.closed(), 1);
    assert_eq!(pool.stats().total_instances, 0);
    assert!(pool.handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_create_for_execute_closes_new_handle() {
    let factory = InMemoryServiceFactory::new();
    factory.set_create_latency(Duration::from_millis(100));
    let pool = ServicePool::new(factory.clone(), settings(2, 0)).unwrap();

    let (result, ()) = tokio::join!(list_root(&pool), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.shutdown();
    });

    assert!(matches!(result, Err(SchedulerError::Disposed)));
    assert_eq!(factory.native_calls(), 0);
    assert_eq!(factory.created(), 1);
    assert_eq!(factory.closed(), 1);
    assert_eq!(pool.stats().failed_operations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_saturated_pool_falls_back_to_temporary_handle() {
    let factory = InMemoryServiceFactory::new();
    factory.set_create_latency(Duration::from_millis(100));
    let pool = ServicePool::new(factory.clone(), settings(1, 1)).unwrap();
    let pool_ref = &pool;

    // warm_up holds the only slot while its create is in flight
    let (warmed, used) = tokio::join!(pool.warm_up(), async {
        tokio::task::yield_now().await;
        pool.execute(&CancellationToken::new(), |svc| async move {
            assert!(pool_ref.stats().total_instances <= 1);
            svc.list_tasks("\\").await.map_err(SchedulerError::from)
        })
        .await
    });

    assert_eq!(warmed.unwrap(), 1);
    used.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.temporary_handles_created, 1);
    assert_eq!(stats.total_instances, 1);
    assert_eq!(stats.available, 1);
    assert_eq!(factory.created(), 2);
    assert_eq!(factory.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_poll_picks_up_handle_created_elsewhere() {
    let factory = InMemoryServiceFactory::new();
    factory.set_create_latency(Duration::from_millis(100));
    let mut s = settings(1, 1);
    s.idle_poll_timeout = Duration::from_millis(500);
    let pool = ServicePool::new(factory.clone(), s).unwrap();

    let (warmed, used) = tokio::join!(pool.warm_up(), async {
        tokio::task::yield_now().await;
        list_root(&pool).await
    });

    assert_eq!(warmed.unwrap(), 1);
    used.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.temporary_handles_created, 0);
    assert_eq!(stats.total_instances, 1);
    assert_eq!(factory.created(), 1);
    assert_eq!(pool.handles()[0].usage_count, 1);
}
