//! Bounded pool of native scheduler-service handles.
//!
//! Every call goes through [`ServicePool::execute`]:
//!
//! 1. a semaphore permit is taken (bounded by `pool_acquire_timeout`);
//! 2. a handle is popped from the idle queue, or created if the pool has room,
//!    or polled for briefly, or, as a last resort, created as a temporary
//!    handle that is never tracked;
//! 3. the caller's operation runs with the handle;
//! 4. corrupted handles are evicted, healthy ones go back to the idle queue,
//!    temporary ones are closed, and the permit is released.
//!
//! Step 4 runs from a guard's `Drop`, so a future dropped by a timeout or a
//! cancellation still returns its handle and permit.
//!
//! The temporary-handle fallback lets a caller make progress when the idle
//! queue is momentarily empty although a permit was granted. Under sustained
//! contention it can push the number of open native handles above capacity;
//! the number of concurrently running operations is still bounded by the
//! semaphore.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerOptions;

use super::error::{OperationContext, SchedulerError};
use super::service::{SchedulerService, ServiceFactory};
use super::stats::{PoolCounters, PoolStats};

/// Sleep between idle-queue polls when the pool is full.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pool sizing and timing, taken from [`SchedulerOptions`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum concurrently running operations and tracked handles.
    pub capacity: usize,
    /// How long a caller may wait for a permit.
    pub acquire_timeout: Duration,
    /// Idle sweep never evicts below this many tracked handles.
    pub min_handles: usize,
    /// Idle time after which a handle may be evicted.
    pub idle_timeout: Duration,
    /// Interval between idle sweeps.
    pub cleanup_interval: Duration,
    /// Bounded wait on the idle queue before falling back to a temporary handle.
    pub idle_poll_timeout: Duration,
}

impl From<&SchedulerOptions> for PoolSettings {
    fn from(opts: &SchedulerOptions) -> Self {
        Self {
            capacity: opts.pool_capacity,
            acquire_timeout: opts.pool_acquire_timeout,
            min_handles: opts.min_handles,
            idle_timeout: opts.idle_timeout,
            cleanup_interval: opts.cleanup_interval,
            idle_poll_timeout: opts.idle_poll_timeout,
        }
    }
}

/// Read-only view of one tracked handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSnapshot {
    /// Handle identifier.
    pub id: Uuid,
    /// Whether a caller currently holds it.
    pub in_use: bool,
    /// Operations run on it so far.
    pub usage_count: u64,
    /// Time since it was created.
    pub age: Duration,
    /// Time since it was last released.
    pub idle_for: Duration,
}

/// One native handle owned by the pool.
struct PooledHandle<S> {
    id: Uuid,
    service: Arc<S>,
    created_at: Instant,
    last_used: Mutex<Instant>,
    in_use: AtomicBool,
    usage_count: AtomicU64,
    closed: AtomicBool,
}

impl<S: SchedulerService> PooledHandle<S> {
    fn new(service: S) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            service: Arc::new(service),
            created_at: now,
            last_used: Mutex::new(now),
            in_use: AtomicBool::new(false),
            usage_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn check_out(&self) {
        self.in_use.store(true, Ordering::Release);
        self.usage_count.fetch_add(1, Ordering::Relaxed);
    }

    fn check_in(&self) {
        *self.last_used.lock() = Instant::now();
        self.in_use.store(false, Ordering::Release);
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_used.lock())
    }

    /// Close the native handle. Only the first call reaches the adapter.
    fn destroy(&self, reason: &'static str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.service.close() {
            Ok(()) => debug!(handle = %self.id, reason, "closed scheduler handle"),
            Err(e) => warn!(handle = %self.id, reason, error = %e, "failed to close scheduler handle"),
        }
    }

    fn snapshot(&self, now: Instant) -> HandleSnapshot {
        HandleSnapshot {
            id: self.id,
            in_use: self.in_use.load(Ordering::Acquire),
            usage_count: self.usage_count.load(Ordering::Relaxed),
            age: now.saturating_duration_since(self.created_at),
            idle_for: self.idle_for(now),
        }
    }
}

/// Tracked handles, idle queue and in-flight creations under one lock.
struct PoolState<S> {
    tracked: HashMap<Uuid, Arc<PooledHandle<S>>>,
    idle: VecDeque<Uuid>,
    pending_creates: usize,
}

impl<S: SchedulerService> PoolState<S> {
    /// Pop the oldest idle handle and check it out while still under the lock,
    /// so a concurrent shutdown sees it as in use.
    fn pop_idle(&mut self) -> Option<Arc<PooledHandle<S>>> {
        while let Some(id) = self.idle.pop_front() {
            if let Some(handle) = self.tracked.get(&id) {
                handle.check_out();
                return Some(Arc::clone(handle));
            }
        }
        None
    }

    fn has_room(&self, capacity: usize) -> bool {
        self.tracked.len() + self.pending_creates < capacity
    }
}

struct PoolInner<F: ServiceFactory> {
    factory: F,
    settings: PoolSettings,
    semaphore: Semaphore,
    state: Mutex<PoolState<F::Service>>,
    counters: PoolCounters,
    disposed: AtomicBool,
    sweep_cancel: CancellationToken,
}

impl<F: ServiceFactory> PoolInner<F> {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Evict handles idle past the timeout, keeping at least `min_handles`.
    fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let evicted: Vec<Arc<PooledHandle<F::Service>>> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut evicted = Vec::new();

            while let Some(id) = state.idle.pop_front() {
                let Some(handle) = state.tracked.get(&id) else {
                    continue;
                };
                let expired = handle.idle_for(now) > self.settings.idle_timeout;
                if expired && state.tracked.len() > self.settings.min_handles {
                    if let Some(handle) = state.tracked.remove(&id) {
                        evicted.push(handle);
                    }
                } else {
                    kept.push_back(id);
                }
            }
            state.idle = kept;
            evicted
        };

        for handle in &evicted {
            handle.destroy("idle timeout");
        }
        let count = evicted.len();
        if count > 0 {
            self.counters
                .idle_evictions
                .fetch_add(count as u64, Ordering::Relaxed);
            info!(evicted = count, "evicted idle scheduler handles");
        }
        count
    }
}

/// Slot reserved under the state lock while a handle is being created.
struct CreateReservation<'a, F: ServiceFactory> {
    pool: &'a PoolInner<F>,
    active: bool,
}

impl<'a, F: ServiceFactory> CreateReservation<'a, F> {
    /// Reserve a slot if the pool has room.
    fn try_reserve(pool: &'a PoolInner<F>) -> Option<Self> {
        let mut state = pool.state.lock();
        if !state.has_room(pool.settings.capacity) {
            return None;
        }
        state.pending_creates += 1;
        Some(Self { pool, active: true })
    }

    /// Turn the reservation into a tracked handle, either idle or checked out.
    ///
    /// Returns `false` without tracking the handle if the pool was shut down
    /// while it was being created; the caller must destroy it.
    #[must_use]
    fn commit(mut self, handle: &Arc<PooledHandle<F::Service>>, idle: bool) -> bool {
        let mut state = self.pool.state.lock();
        state.pending_creates -= 1;
        self.active = false;
        if self.pool.is_disposed() {
            return false;
        }
        state.tracked.insert(handle.id, Arc::clone(handle));
        if idle {
            state.idle.push_back(handle.id);
        } else {
            handle.check_out();
        }
        true
    }
}

impl<F: ServiceFactory> Drop for CreateReservation<'_, F> {
    fn drop(&mut self) {
        if self.active {
            self.pool.state.lock().pending_creates -= 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseOutcome {
    Succeeded,
    Failed { corrupted: bool },
}

/// A checked-out handle plus the permit that allowed it.
///
/// Dropping the lease returns or destroys the handle, then releases the
/// permit (fields drop after `Drop::drop` runs).
struct HandleLease<'a, F: ServiceFactory> {
    pool: &'a PoolInner<F>,
    handle: Arc<PooledHandle<F::Service>>,
    temporary: bool,
    outcome: Option<LeaseOutcome>,
    _permit: SemaphorePermit<'a>,
}

impl<F: ServiceFactory> HandleLease<'_, F> {
    fn service(&self) -> Arc<F::Service> {
        Arc::clone(&self.handle.service)
    }

    fn finish(&mut self, err: Option<&SchedulerError>) {
        self.outcome = Some(match err {
            None => LeaseOutcome::Succeeded,
            Some(e) => LeaseOutcome::Failed {
                corrupted: e.is_corruption(),
            },
        });
    }
}

impl<F: ServiceFactory> Drop for HandleLease<'_, F> {
    fn drop(&mut self) {
        let pool = self.pool;
        let handle = &self.handle;
        let outcome = self.outcome.unwrap_or(LeaseOutcome::Failed { corrupted: false });
        pool.counters
            .record_operation(!matches!(outcome, LeaseOutcome::Succeeded));
        handle.check_in();

        if self.temporary {
            handle.destroy("temporary handle");
            return;
        }

        if matches!(outcome, LeaseOutcome::Failed { corrupted: true }) {
            let removed = pool.state.lock().tracked.remove(&handle.id).is_some();
            if removed {
                pool.counters
                    .corrupted_evictions
                    .fetch_add(1, Ordering::Relaxed);
                warn!(handle = %handle.id, "evicting corrupted scheduler handle");
            }
            handle.destroy("corrupted");
            return;
        }

        let returned = {
            let mut state = pool.state.lock();
            if !pool.is_disposed() && state.tracked.contains_key(&handle.id) {
                state.idle.push_back(handle.id);
                true
            } else {
                false
            }
        };
        if !returned {
            handle.destroy("pool disposed");
        }
    }
}

/// Executes operations on pooled scheduler handles.
///
/// Implemented by [`ServicePool`]; tests may substitute their own.
pub trait TaskServicePool: Send + Sync {
    /// Handle type lent to operations.
    type Service: SchedulerService;

    /// Run `operation` with a pooled handle. The pool never retries.
    fn execute<T, Op, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: Op,
    ) -> impl Future<Output = Result<T, SchedulerError>> + Send
    where
        T: Send,
        Op: FnOnce(Arc<Self::Service>) -> Fut + Send,
        Fut: Future<Output = Result<T, SchedulerError>> + Send;

    /// Current statistics.
    fn stats(&self) -> PoolStats;

    /// Dispose every handle and refuse further work.
    fn shutdown(&self);
}

/// Production service pool.
pub struct ServicePool<F: ServiceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ServiceFactory> std::fmt::Debug for ServicePool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePool")
            .field("settings", &self.inner.settings)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<F: ServiceFactory> ServicePool<F> {
    /// Create a pool and start its idle sweep.
    ///
    /// The sweep runs on the current tokio runtime; without one the pool
    /// still works but idle handles are only evicted by
    /// [`evict_idle`](Self::evict_idle).
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ConfigurationInvalid` if the settings are invalid.
    pub fn new(factory: F, settings: PoolSettings) -> Result<Self, SchedulerError> {
        if settings.capacity == 0 {
            return Err(SchedulerError::ConfigurationInvalid(
                "pool capacity must be greater than 0".into(),
            ));
        }
        if settings.acquire_timeout.is_zero() {
            return Err(SchedulerError::ConfigurationInvalid(
                "pool acquire timeout must be greater than 0".into(),
            ));
        }
        if settings.idle_timeout.is_zero() {
            return Err(SchedulerError::ConfigurationInvalid(
                "idle timeout must be greater than 0".into(),
            ));
        }
        if settings.cleanup_interval.is_zero() {
            return Err(SchedulerError::ConfigurationInvalid(
                "cleanup interval must be greater than 0".into(),
            ));
        }
        if settings.min_handles > settings.capacity {
            return Err(SchedulerError::ConfigurationInvalid(format!(
                "min handles ({}) exceeds capacity ({})",
                settings.min_handles, settings.capacity
            )));
        }

        let inner = Arc::new(PoolInner {
            factory,
            semaphore: Semaphore::new(settings.capacity),
            state: Mutex::new(PoolState {
                tracked: HashMap::with_capacity(settings.capacity),
                idle: VecDeque::with_capacity(settings.capacity),
                pending_creates: 0,
            }),
            counters: PoolCounters::default(),
            disposed: AtomicBool::new(false),
            sweep_cancel: CancellationToken::new(),
            settings,
        });

        Self::spawn_sweeper(&inner);

        info!(
            capacity = inner.settings.capacity,
            min_handles = inner.settings.min_handles,
            idle_timeout_ms = u64::try_from(inner.settings.idle_timeout.as_millis()).unwrap_or(u64::MAX),
            "service pool initialized"
        );

        Ok(Self { inner })
    }

    /// Create a pool from process-wide options.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ConfigurationInvalid` if the options are invalid.
    pub fn from_options(factory: F, options: &SchedulerOptions) -> Result<Self, SchedulerError> {
        options
            .validate()
            .map_err(SchedulerError::ConfigurationInvalid)?;
        Self::new(factory, PoolSettings::from(options))
    }

    fn spawn_sweeper(inner: &Arc<PoolInner<F>>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; idle sweep disabled");
            return;
        };
        let weak: Weak<PoolInner<F>> = Arc::downgrade(inner);
        let cancel = inner.sweep_cancel.clone();
        let period = inner.settings.cleanup_interval;

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.is_disposed() {
                    break;
                }
                inner.sweep_idle();
            }
            debug!("idle sweep stopped");
        });
    }

    /// Pool settings.
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Whether [`shutdown`](TaskServicePool::shutdown) has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Create handles until `min_handles` are tracked.
    ///
    /// Returns the number created.
    ///
    /// # Errors
    ///
    /// Returns the factory's error if a handle cannot be created, or
    /// `SchedulerError::Disposed` after shutdown.
    pub async fn warm_up(&self) -> Result<usize, SchedulerError> {
        let inner = &*self.inner;
        let mut created = 0;
        loop {
            if inner.is_disposed() {
                return Err(SchedulerError::Disposed);
            }
            let below_floor = {
                let state = inner.state.lock();
                state.tracked.len() + state.pending_creates < inner.settings.min_handles
            };
            if !below_floor {
                break;
            }
            let Some(reservation) = CreateReservation::try_reserve(inner) else {
                break;
            };
            let service = inner.factory.create().await?;
            let handle = Arc::new(PooledHandle::new(service));
            if !reservation.commit(&handle, true) {
                handle.destroy("pool disposed");
                return Err(SchedulerError::Disposed);
            }
            created += 1;
        }
        if created > 0 {
            info!(created, "pre-created scheduler handles");
        }
        Ok(created)
    }

    /// Run one idle sweep now. Returns the number of handles evicted.
    pub fn evict_idle(&self) -> usize {
        self.inner.sweep_idle()
    }

    /// Snapshot every tracked handle.
    pub fn handles(&self) -> Vec<HandleSnapshot> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        state.tracked.values().map(|h| h.snapshot(now)).collect()
    }

    async fn acquire_permit(
        &self,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<SemaphorePermit<'_>, SchedulerError> {
        let inner = &*self.inner;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SchedulerError::Cancelled {
                context: OperationContext::default(),
            }),
            res = tokio::time::timeout(inner.settings.acquire_timeout, inner.semaphore.acquire()) => {
                match res {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(SchedulerError::Disposed),
                    Err(_) => {
                        let waited = started.elapsed();
                        warn!(
                            capacity = inner.settings.capacity,
                            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                            "timed out waiting for a pool permit"
                        );
                        Err(SchedulerError::PoolExhausted {
                            capacity: inner.settings.capacity,
                            waited,
                        })
                    }
                }
            }
        }
    }

    /// Find a handle for a caller that already holds a permit.
    ///
    /// Returns the handle, already checked out, and whether it is temporary.
    async fn obtain_handle(&self) -> Result<(Arc<PooledHandle<F::Service>>, bool), SchedulerError> {
        let inner = &*self.inner;

        let reservation = {
            let mut state = inner.state.lock();
            if let Some(handle) = state.pop_idle() {
                return Ok((handle, false));
            }
            drop(state);
            CreateReservation::try_reserve(inner)
        };

        if let Some(reservation) = reservation {
            let service = inner.factory.create().await?;
            let handle = Arc::new(PooledHandle::new(service));
            if !reservation.commit(&handle, false) {
                handle.destroy("pool disposed");
                return Err(SchedulerError::Disposed);
            }
            debug!(handle = %handle.id, "created scheduler handle");
            return Ok((handle, false));
        }

        let deadline = Instant::now() + inner.settings.idle_poll_timeout;
        loop {
            let popped = inner.state.lock().pop_idle();
            if let Some(handle) = popped {
                return Ok((handle, false));
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }

        let service = inner.factory.create().await?;
        inner
            .counters
            .temporary_handles
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            capacity = inner.settings.capacity,
            "pool saturated; using a temporary unpooled handle"
        );
        let handle = Arc::new(PooledHandle::new(service));
        handle.check_out();
        Ok((handle, true))
    }
}

impl<F: ServiceFactory> TaskServicePool for ServicePool<F> {
    type Service = F::Service;

    async fn execute<T, Op, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: Op,
    ) -> Result<T, SchedulerError>
    where
        T: Send,
        Op: FnOnce(Arc<Self::Service>) -> Fut + Send,
        Fut: Future<Output = Result<T, SchedulerError>> + Send,
    {
        if self.inner.is_disposed() {
            return Err(SchedulerError::Disposed);
        }

        let started = Instant::now();
        let permit = self.acquire_permit(cancel, started).await?;
        let (handle, temporary) = match self.obtain_handle().await {
            Ok(found) => found,
            Err(e) => {
                self.inner.counters.record_operation(true);
                return Err(e);
            }
        };

        let waited = started.elapsed();
        self.inner.counters.record_wait(waited);

        let mut lease = HandleLease {
            pool: &self.inner,
            handle,
            temporary,
            outcome: None,
            _permit: permit,
        };

        let result = operation(lease.service()).await;
        lease.finish(result.as_ref().err());
        drop(lease);
        result
    }

    fn stats(&self) -> PoolStats {
        let (total, available) = {
            let state = self.inner.state.lock();
            (state.tracked.len(), state.idle.len())
        };
        self.inner
            .counters
            .snapshot(self.inner.settings.capacity, total, available)
    }

    fn shutdown(&self) {
        let inner = &*self.inner;
        if inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.sweep_cancel.cancel();
        inner.semaphore.close();

        let drained: Vec<Arc<PooledHandle<F::Service>>> = {
            let mut state = inner.state.lock();
            state.idle.clear();
            state.tracked.drain().map(|(_, handle)| handle).collect()
        };

        // In-use handles are closed by their lease when it is dropped.
        let mut closed = 0usize;
        for handle in &drained {
            if !handle.in_use.load(Ordering::Acquire) {
                handle.destroy("pool shutdown");
                closed += 1;
            }
        }
        info!(
            closed,
            in_flight = drained.len() - closed,
            "service pool shut down"
        );
    }
}

impl<F: ServiceFactory> Drop for ServicePool<F> {
    fn drop(&mut self) {
        if !self.inner.is_disposed() {
            debug!("ServicePool dropped without explicit shutdown");
            self.shutdown();
        }
    }
}
