//! Error types for scheduler operations.
//!
//! Two layers live here. [`NativeError`] is what a scheduler-service adapter
//! returns: a message tagged with a [`NativeErrorKind`]. [`SchedulerError`] is
//! the taxonomy surfaced to callers once the retry executor has classified a
//! failure.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies the operation a failure belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    /// Logical operation name, e.g. `register_task`.
    pub operation: String,
    /// Caller-supplied task identifier.
    pub task_id: Option<String>,
    /// Caller-supplied task name.
    pub task_name: Option<String>,
}

impl OperationContext {
    /// Context for a named operation with no task attached.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            task_id: None,
            task_name: None,
        }
    }

    /// Attach a task identifier.
    #[must_use]
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Attach a task name.
    #[must_use]
    pub fn with_task_name(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = Some(task_name.into());
        self
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operation.is_empty() {
            write!(f, "<unnamed operation>")?;
        } else {
            write!(f, "{}", self.operation)?;
        }
        if let Some(id) = &self.task_id {
            write!(f, " [task id: {id}]")?;
        }
        if let Some(name) = &self.task_name {
            write!(f, " [task name: {name}]")?;
        }
        Ok(())
    }
}

/// Failure category reported by a native scheduler-service adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeErrorKind {
    /// The interop call itself failed (marshalling, RPC, bad HRESULT).
    InteropFailure,
    /// The service refused access to the caller.
    AccessDenied,
    /// The handle was used after it had been closed.
    UseAfterDispose,
    /// The scheduler service is not reachable or not running.
    ServiceUnavailable,
    /// Local I/O failure.
    Io,
    /// Network failure talking to a remote scheduler.
    Network,
    /// The native call timed out.
    Timeout,
    /// The requested task or folder does not exist.
    NotFound,
    /// Anything the adapter could not categorize.
    Other,
}

impl NativeErrorKind {
    /// Kinds that mean the handle must not be reused.
    pub const fn is_corruption(self) -> bool {
        matches!(
            self,
            Self::InteropFailure | Self::AccessDenied | Self::UseAfterDispose
        )
    }

    /// Kinds the retry executor treats as transient.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable | Self::Io | Self::Network | Self::Timeout
        )
    }
}

impl fmt::Display for NativeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InteropFailure => "interop failure",
            Self::AccessDenied => "access denied",
            Self::UseAfterDispose => "use after dispose",
            Self::ServiceUnavailable => "service unavailable",
            Self::Io => "i/o failure",
            Self::Network => "network failure",
            Self::Timeout => "timeout",
            Self::NotFound => "not found",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

/// Error returned by a native scheduler-service adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("native {kind}: {message}")]
pub struct NativeError {
    /// Failure category.
    pub kind: NativeErrorKind,
    /// Adapter-provided detail.
    pub message: String,
}

impl NativeError {
    /// Build a native error of the given kind.
    pub fn new(kind: NativeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors produced by the retry executor, the service pool and the client.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Access to the scheduler was denied. Never retried.
    #[error("permission denied for {context}: {message}")]
    PermissionDenied {
        /// Failure detail.
        message: String,
        /// Operation that failed.
        context: OperationContext,
    },
    /// The scheduler service is temporarily unavailable.
    #[error("scheduler service unavailable for {context}: {message}")]
    ServiceUnavailable {
        /// Failure detail.
        message: String,
        /// Operation that failed.
        context: OperationContext,
    },
    /// Options or arguments failed validation.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
    /// A single attempt ran longer than the configured operation timeout.
    #[error("{context} timed out after {timeout:?}")]
    OperationTimedOut {
        /// Limit that was exceeded.
        timeout: Duration,
        /// Operation that failed.
        context: OperationContext,
    },
    /// The requested task or folder does not exist.
    #[error("not found for {context}: {message}")]
    NotFound {
        /// Failure detail.
        message: String,
        /// Operation that failed.
        context: OperationContext,
    },
    /// No pool permit became available within the acquisition timeout.
    #[error("service pool exhausted (capacity {capacity}) after waiting {waited:?}")]
    PoolExhausted {
        /// Configured pool capacity.
        capacity: usize,
        /// How long the caller waited.
        waited: Duration,
    },
    /// The caller's cancellation token fired.
    #[error("{context} was cancelled")]
    Cancelled {
        /// Operation that was cancelled.
        context: OperationContext,
    },
    /// The service pool has been shut down.
    #[error("service pool has been disposed")]
    Disposed,
    /// Unclassified failure reported by the native adapter.
    #[error(transparent)]
    Native(#[from] NativeError),
    /// Catch-all for unclassified failures. Never retried.
    #[error("scheduler error in {context}: {message}")]
    Generic {
        /// Failure detail.
        message: String,
        /// Operation that failed.
        context: OperationContext,
    },
    /// Every attempt failed but no failure was recorded.
    #[error("{context} failed after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Operation that failed.
        context: OperationContext,
    },
}

impl SchedulerError {
    /// Timeout-like failures, including pool exhaustion.
    pub const fn is_timeout(&self) -> bool {
        match self {
            Self::OperationTimedOut { .. } | Self::PoolExhausted { .. } => true,
            Self::Native(native) => matches!(native.kind, NativeErrorKind::Timeout),
            _ => false,
        }
    }

    /// Failures on the retry allow-list.
    pub const fn is_retriable(&self) -> bool {
        match self {
            Self::ServiceUnavailable { .. }
            | Self::OperationTimedOut { .. }
            | Self::PoolExhausted { .. } => true,
            Self::Native(native) => native.kind.is_transient(),
            _ => false,
        }
    }

    /// Access or permission denial, native or already classified.
    pub const fn is_permission_denied(&self) -> bool {
        match self {
            Self::PermissionDenied { .. } => true,
            Self::Native(native) => matches!(native.kind, NativeErrorKind::AccessDenied),
            _ => false,
        }
    }

    /// Failures that mean the native handle used for the call is unusable.
    pub const fn is_corruption(&self) -> bool {
        match self {
            Self::Native(native) => native.kind.is_corruption(),
            _ => false,
        }
    }

    /// Whether this is a cancellation outcome.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Fill in operation context on variants that carry one.
    ///
    /// Context already set by a lower layer is kept.
    #[must_use]
    pub fn with_context(mut self, ctx: &OperationContext) -> Self {
        match &mut self {
            Self::PermissionDenied { context, .. }
            | Self::ServiceUnavailable { context, .. }
            | Self::OperationTimedOut { context, .. }
            | Self::NotFound { context, .. }
            | Self::Cancelled { context }
            | Self::Generic { context, .. }
            | Self::RetriesExhausted { context, .. } => {
                if context.operation.is_empty() {
                    *context = ctx.clone();
                }
            }
            Self::ConfigurationInvalid(_)
            | Self::PoolExhausted { .. }
            | Self::Disposed
            | Self::Native(_) => {}
        }
        self
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
