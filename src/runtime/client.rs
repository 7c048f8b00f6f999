//! Caller-facing scheduler client.
//!
//! Composes the retry executor over the service pool: each attempt borrows a
//! pooled handle, so a corrupted handle is evicted by the pool and the retry
//! runs on a fresh one.

use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use crate::core::{
    OperationContext, PoolStats, RetryExecutor, RetryPolicy, RetryPolicyService, SchedulerError,
    SchedulerService, TaskInfo, TaskRegistration, TaskServicePool, TaskState,
};

/// Full path of a task, used as its identifier in error context.
fn task_path(folder: &str, name: &str) -> String {
    if folder.ends_with('\\') {
        format!("{folder}{name}")
    } else {
        format!("{folder}\\{name}")
    }
}

fn task_context(operation: &str, folder: &str, name: &str) -> OperationContext {
    OperationContext::new(operation)
        .with_task_id(task_path(folder, name))
        .with_task_name(name)
}

/// Entry point for running scheduler operations with retry and pooling.
#[derive(Debug)]
pub struct SchedulerClient<P, R = RetryExecutor> {
    pool: P,
    retry: R,
}

impl<P, R> SchedulerClient<P, R>
where
    P: TaskServicePool,
    R: RetryPolicyService,
{
    /// Assemble a client from its two collaborators.
    pub const fn new(pool: P, retry: R) -> Self {
        Self { pool, retry }
    }

    /// The service pool.
    pub const fn pool(&self) -> &P {
        &self.pool
    }

    /// The retry executor.
    pub const fn retry(&self) -> &R {
        &self.retry
    }

    /// Run `operation` on a pooled handle, retrying transient failures.
    ///
    /// `operation` is invoked once per attempt. `policy` falls back to the
    /// executor's default when `None`.
    ///
    /// # Errors
    ///
    /// The classified failure of the last attempt, `Cancelled` if `cancel`
    /// fires, or `Disposed` after shutdown.
    pub async fn execute<T, Op, Fut>(
        &self,
        context: &OperationContext,
        policy: Option<&RetryPolicy>,
        cancel: &CancellationToken,
        operation: Op,
    ) -> Result<T, SchedulerError>
    where
        T: Send,
        Op: Fn(Arc<P::Service>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, SchedulerError>> + Send,
    {
        let pool = &self.pool;
        let operation = &operation;
        self.retry
            .execute_with_retry(
                move || pool.execute(cancel, move |svc| operation(svc)),
                policy,
                context,
                cancel,
            )
            .await
    }

    /// No-result variant of [`execute`](Self::execute).
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn execute_unit<Op, Fut>(
        &self,
        context: &OperationContext,
        policy: Option<&RetryPolicy>,
        cancel: &CancellationToken,
        operation: Op,
    ) -> Result<(), SchedulerError>
    where
        Op: Fn(Arc<P::Service>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), SchedulerError>> + Send,
    {
        let pool = &self.pool;
        let operation = &operation;
        self.retry
            .execute_with_retry_unit(
                move || pool.execute(cancel, move |svc| operation(svc)),
                policy,
                context,
                cancel,
            )
            .await
    }

    /// Pool statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Shut the pool down. Later calls fail with `Disposed`.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// Create a task folder.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn create_folder(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let ctx = OperationContext::new("create_folder").with_task_id(path);
        self.execute_unit(&ctx, None, cancel, move |svc| async move {
            svc.create_folder(path).await.map_err(SchedulerError::from)
        })
        .await
    }

    /// Enumerate the tasks in a folder.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn list_tasks(
        &self,
        folder: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskInfo>, SchedulerError> {
        let ctx = OperationContext::new("list_tasks").with_task_id(folder);
        self.execute(&ctx, None, cancel, move |svc| async move {
            svc.list_tasks(folder).await.map_err(SchedulerError::from)
        })
        .await
    }

    /// Register or replace a task.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn register_task(
        &self,
        registration: &TaskRegistration,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let ctx = task_context("register_task", &registration.folder, &registration.name);
        self.execute_unit(&ctx, None, cancel, move |svc| async move {
            svc.register_task(registration)
                .await
                .map_err(SchedulerError::from)
        })
        .await
    }

    /// Delete a task.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn delete_task(
        &self,
        folder: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let ctx = task_context("delete_task", folder, name);
        self.execute_unit(&ctx, None, cancel, move |svc| async move {
            svc.delete_task(folder, name)
                .await
                .map_err(SchedulerError::from)
        })
        .await
    }

    /// Start a task now.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn run_task(
        &self,
        folder: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let ctx = task_context("run_task", folder, name);
        self.execute_unit(&ctx, None, cancel, move |svc| async move {
            svc.run_task(folder, name).await.map_err(SchedulerError::from)
        })
        .await
    }

    /// Stop a running task.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn stop_task(
        &self,
        folder: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let ctx = task_context("stop_task", folder, name);
        self.execute_unit(&ctx, None, cancel, move |svc| async move {
            svc.stop_task(folder, name).await.map_err(SchedulerError::from)
        })
        .await
    }

    /// Read a task's state.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn task_state(
        &self,
        folder: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskState, SchedulerError> {
        let ctx = task_context("task_state", folder, name);
        self.execute(&ctx, None, cancel, move |svc| async move {
            svc.task_state(folder, name).await.map_err(SchedulerError::from)
        })
        .await
    }

    /// Read a task's next scheduled run.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn next_run_time(
        &self,
        folder: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<SystemTime>, SchedulerError> {
        let ctx = task_context("next_run_time", folder, name);
        self.execute(&ctx, None, cancel, move |svc| async move {
            svc.next_run_time(folder, name)
                .await
                .map_err(SchedulerError::from)
        })
        .await
    }
}
