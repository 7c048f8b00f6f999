//! Retry executor, service pool and the types they share.

pub mod error;
pub mod retry;
pub mod service;
pub mod service_pool;
pub mod stats;

pub use error::{AppResult, NativeError, NativeErrorKind, OperationContext, SchedulerError};
pub use retry::{BackoffMode, RetryExecutor, RetryPolicy, RetryPolicyService, RetrySettings};
pub use service::{
    NativeResult, SchedulerService, ServiceFactory, TaskInfo, TaskRegistration, TaskState,
};
pub use service_pool::{HandleSnapshot, PoolSettings, ServicePool, TaskServicePool};
pub use stats::PoolStats;
