//! In-memory scheduler service for tests and local development.
//!
//! All handles created by one [`InMemoryServiceFactory`] share a registry, the
//! way connections to one machine's scheduler see the same tasks. The factory
//! also exposes fault injection and call accounting so callers can exercise
//! retry and pool behaviour without a real scheduler.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{
    NativeError, NativeErrorKind, NativeResult, SchedulerService, ServiceFactory, TaskInfo,
    TaskRegistration, TaskState,
};

const ROOT_FOLDER: &str = "\\";

#[derive(Debug, Clone)]
struct StoredTask {
    registration: TaskRegistration,
    state: TaskState,
    next_run: Option<SystemTime>,
}

#[derive(Debug)]
struct Registry {
    folders: HashSet<String>,
    tasks: BTreeMap<(String, String), StoredTask>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut folders = HashSet::new();
        folders.insert(ROOT_FOLDER.to_string());
        Self {
            folders,
            tasks: BTreeMap::new(),
        }
    }
}

impl Registry {
    fn require_folder(&self, folder: &str) -> NativeResult<()> {
        if self.folders.contains(folder) {
            Ok(())
        } else {
            Err(NativeError::new(
                NativeErrorKind::NotFound,
                format!("folder `{folder}` does not exist"),
            ))
        }
    }

    fn task_mut(&mut self, folder: &str, name: &str) -> NativeResult<&mut StoredTask> {
        self.tasks
            .get_mut(&(folder.to_string(), name.to_string()))
            .ok_or_else(|| {
                NativeError::new(
                    NativeErrorKind::NotFound,
                    format!("task `{folder}\\{name}` does not exist"),
                )
            })
    }
}

#[derive(Debug, Default)]
struct Shared {
    registry: Mutex<Registry>,
    faults: Mutex<VecDeque<NativeError>>,
    failing_creates: AtomicUsize,
    latency: Mutex<Duration>,
    create_latency: Mutex<Duration>,
    created: AtomicU64,
    closed: AtomicU64,
    native_calls: AtomicU64,
    active_calls: AtomicUsize,
    max_concurrent_calls: AtomicUsize,
}

/// Decrements the active-call gauge when a call ends.
struct ActiveCall<'a>(&'a Shared);

impl<'a> ActiveCall<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let now = shared.active_calls.fetch_add(1, Ordering::AcqRel) + 1;
        shared.max_concurrent_calls.fetch_max(now, Ordering::AcqRel);
        Self(shared)
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.active_calls.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One handle to the in-memory scheduler.
#[derive(Debug)]
pub struct InMemorySchedulerService {
    shared: Arc<Shared>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl InMemorySchedulerService {
    async fn call<T, G>(&self, op: G) -> NativeResult<T>
    where
        G: FnOnce(&mut Registry) -> NativeResult<T> + Send,
        T: Send,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(NativeError::new(
                NativeErrorKind::UseAfterDispose,
                "handle already closed",
            ));
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(NativeError::new(
                NativeErrorKind::ServiceUnavailable,
                "handle is not connected",
            ));
        }

        let shared = &*self.shared;
        shared.native_calls.fetch_add(1, Ordering::Relaxed);
        let _active = ActiveCall::enter(shared);

        let latency = *shared.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = shared.faults.lock().pop_front();
        if let Some(err) = injected {
            return Err(err);
        }

        let mut registry = shared.registry.lock();
        op(&mut registry)
    }
}

#[async_trait]
impl SchedulerService for InMemorySchedulerService {
    async fn connect(&self) -> NativeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NativeError::new(
                NativeErrorKind::UseAfterDispose,
                "handle already closed",
            ));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> NativeResult<()> {
        let path = path.to_string();
        self.call(move |reg| {
            reg.folders.insert(path);
            Ok(())
        })
        .await
    }

    async fn list_tasks(&self, folder: &str) -> NativeResult<Vec<TaskInfo>> {
        let folder = folder.to_string();
        self.call(move |reg| {
            reg.require_folder(&folder)?;
            Ok(reg
                .tasks
                .iter()
                .filter(|((f, _), _)| *f == folder)
                .map(|((f, name), task)| TaskInfo {
                    folder: f.clone(),
                    name: name.clone(),
                    state: task.state,
                    next_run: task.next_run,
                })
                .collect())
        })
        .await
    }

    async fn register_task(&self, registration: &TaskRegistration) -> NativeResult<()> {
        let registration = registration.clone();
        self.call(move |reg| {
            reg.require_folder(&registration.folder)?;
            let state = if registration.enabled {
                TaskState::Ready
            } else {
                TaskState::Disabled
            };
            reg.tasks.insert(
                (registration.folder.clone(), registration.name.clone()),
                StoredTask {
                    registration,
                    state,
                    next_run: None,
                },
            );
            Ok(())
        })
        .await
    }

    async fn delete_task(&self, folder: &str, name: &str) -> NativeResult<()> {
        let (folder, name) = (folder.to_string(), name.to_string());
        self.call(move |reg| {
            reg.task_mut(&folder, &name)?;
            reg.tasks.remove(&(folder, name));
            Ok(())
        })
        .await
    }

    async fn run_task(&self, folder: &str, name: &str) -> NativeResult<()> {
        let (folder, name) = (folder.to_string(), name.to_string());
        self.call(move |reg| {
            let task = reg.task_mut(&folder, &name)?;
            if task.state == TaskState::Disabled {
                return Err(NativeError::new(
                    NativeErrorKind::Other,
                    format!("task `{}` is disabled", task.registration.name),
                ));
            }
            task.state = TaskState::Running;
            Ok(())
        })
        .await
    }

    async fn stop_task(&self, folder: &str, name: &str) -> NativeResult<()> {
        let (folder, name) = (folder.to_string(), name.to_string());
        self.call(move |reg| {
            let task = reg.task_mut(&folder, &name)?;
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
            }
            Ok(())
        })
        .await
    }

    async fn task_state(&self, folder: &str, name: &str) -> NativeResult<TaskState> {
        let (folder, name) = (folder.to_string(), name.to_string());
        self.call(move |reg| Ok(reg.task_mut(&folder, &name)?.state))
            .await
    }

    async fn next_run_time(&self, folder: &str, name: &str) -> NativeResult<Option<SystemTime>> {
        let (folder, name) = (folder.to_string(), name.to_string());
        self.call(move |reg| Ok(reg.task_mut(&folder, &name)?.next_run))
            .await
    }

    fn close(&self) -> NativeResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(NativeError::new(
                NativeErrorKind::UseAfterDispose,
                "handle closed twice",
            ));
        }
        self.shared.closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Factory for [`InMemorySchedulerService`] handles.
///
/// Clones share the same registry, faults and counters.
#[derive(Debug, Clone, Default)]
pub struct InMemoryServiceFactory {
    shared: Arc<Shared>,
}

impl InMemoryServiceFactory {
    /// Create a factory with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error returned by the next native call on any handle.
    pub fn inject_error(&self, err: NativeError) {
        self.shared.faults.lock().push_back(err);
    }

    /// Queue `count` copies of an error.
    pub fn inject_errors(&self, err: &NativeError, count: usize) {
        let mut faults = self.shared.faults.lock();
        faults.extend(std::iter::repeat_n(err.clone(), count));
    }

    /// Make the next `count` handle creations fail as service-unavailable.
    pub fn fail_next_creates(&self, count: usize) {
        self.shared.failing_creates.store(count, Ordering::Release);
    }

    /// Delay every native call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock() = latency;
    }

    /// Delay every handle creation by `latency`, before it succeeds or fails.
    pub fn set_create_latency(&self, latency: Duration) {
        *self.shared.create_latency.lock() = latency;
    }

    /// Handles created so far.
    pub fn created(&self) -> u64 {
        self.shared.created.load(Ordering::Relaxed)
    }

    /// Handles closed so far.
    pub fn closed(&self) -> u64 {
        self.shared.closed.load(Ordering::Relaxed)
    }

    /// Native calls attempted on open handles, including injected failures.
    pub fn native_calls(&self) -> u64 {
        self.shared.native_calls.load(Ordering::Relaxed)
    }

    /// Highest number of native calls observed in flight at once.
    pub fn max_concurrent_calls(&self) -> usize {
        self.shared.max_concurrent_calls.load(Ordering::Acquire)
    }

    /// Number of tasks currently registered.
    pub fn task_count(&self) -> usize {
        self.shared.registry.lock().tasks.len()
    }
}

#[async_trait]
impl ServiceFactory for InMemoryServiceFactory {
    type Service = InMemorySchedulerService;

    async fn create(&self) -> NativeResult<Self::Service> {
        let latency = *self.shared.create_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failing = self
            .shared
            .failing_creates
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(NativeError::new(
                NativeErrorKind::ServiceUnavailable,
                "task scheduler service is not running",
            ));
        }

        let service = InMemorySchedulerService {
            shared: Arc::clone(&self.shared),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        service.connect().await?;
        self.shared.created.fetch_add(1, Ordering::Relaxed);
        Ok(service)
    }
}
