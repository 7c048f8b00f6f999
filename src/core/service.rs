//! Native scheduler-service abstraction.
//!
//! A [`SchedulerService`] is one open connection to the operating system's task
//! scheduler. Opening one is expensive, so the service pool keeps a bounded set
//! of them and hands them out per call. Adapters report failures as
//! [`NativeError`] values; the pool and the retry executor only look at the
//! [`NativeErrorKind`](crate::core::NativeErrorKind) tag.

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::NativeError;

/// Result type used at the adapter boundary.
pub type NativeResult<T> = Result<T, NativeError>;

/// Observed state of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// State could not be determined.
    Unknown,
    /// Task is registered but disabled.
    Disabled,
    /// Task is queued to run.
    Queued,
    /// Task is enabled and waiting for a trigger.
    Ready,
    /// Task is currently running.
    Running,
}

/// A task registration handed to the native scheduler.
///
/// The definition body is opaque here; building it is the job of the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRegistration {
    /// Folder path, e.g. `\\Reports`.
    pub folder: String,
    /// Task name, unique within its folder.
    pub name: String,
    /// Serialized task definition.
    pub definition: String,
    /// Whether the task starts enabled.
    pub enabled: bool,
}

impl TaskRegistration {
    /// An enabled registration.
    pub fn new(
        folder: impl Into<String>,
        name: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            folder: folder.into(),
            name: name.into(),
            definition: definition.into(),
            enabled: true,
        }
    }

    /// Set whether the task starts enabled.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Summary of a task as enumerated from a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Folder the task lives in.
    pub folder: String,
    /// Task name.
    pub name: String,
    /// Current state.
    pub state: TaskState,
    /// Next scheduled run, if any.
    pub next_run: Option<SystemTime>,
}

/// Operations a native scheduler adapter must provide.
///
/// Implementations must be safe to share across threads, but the pool never
/// lends the same handle to two callers at once.
#[async_trait]
pub trait SchedulerService: Send + Sync + 'static {
    /// Open the connection to the scheduler service.
    async fn connect(&self) -> NativeResult<()>;

    /// Create a folder (and missing parents). Succeeds if it already exists.
    async fn create_folder(&self, path: &str) -> NativeResult<()>;

    /// Enumerate the tasks registered in a folder.
    async fn list_tasks(&self, folder: &str) -> NativeResult<Vec<TaskInfo>>;

    /// Register or replace a task definition.
    async fn register_task(&self, registration: &TaskRegistration) -> NativeResult<()>;

    /// Delete a task.
    async fn delete_task(&self, folder: &str, name: &str) -> NativeResult<()>;

    /// Start a task now.
    async fn run_task(&self, folder: &str, name: &str) -> NativeResult<()>;

    /// Stop all running instances of a task.
    async fn stop_task(&self, folder: &str, name: &str) -> NativeResult<()>;

    /// Read a task's state.
    async fn task_state(&self, folder: &str, name: &str) -> NativeResult<TaskState>;

    /// Read a task's next scheduled run time.
    async fn next_run_time(&self, folder: &str, name: &str) -> NativeResult<Option<SystemTime>>;

    /// Release the native connection. Called exactly once per handle.
    fn close(&self) -> NativeResult<()>;
}

/// Creates connected scheduler-service handles for the pool.
#[async_trait]
pub trait ServiceFactory: Send + Sync + 'static {
    /// Handle type produced by this factory.
    type Service: SchedulerService;

    /// Create and connect a new handle.
    async fn create(&self) -> NativeResult<Self::Service>;
}
