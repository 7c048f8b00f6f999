//! # Resilient Scheduler
//!
//! Retry and pooling core for driving a native task-scheduler service.
//!
//! Native scheduler handles are expensive to open and can go bad mid-call.
//! This crate puts two pieces between callers and the native service:
//!
//! - **Retry Executor**: runs an operation with bounded retry, exponential or
//!   linear backoff with symmetric jitter, a per-attempt timeout and
//!   cooperative cancellation. It is the only component that decides whether
//!   a failure is retried.
//! - **Service Pool**: hands out a bounded set of native handles under a
//!   semaphore, reuses idle ones, evicts handles whose calls fail with a
//!   corruption-class error, sweeps handles idle past a timeout while keeping
//!   a minimum floor, and reports statistics.
//!
//! Calls flow caller → retry executor → (each attempt) service pool → native
//! call, so a corrupted handle is evicted and the next attempt gets a fresh
//! one.
//!
//! ```rust,ignore
//! use resilient_scheduler::builders::build_client;
//! use resilient_scheduler::config::SchedulerOptions;
//! use resilient_scheduler::core::TaskRegistration;
//! use resilient_scheduler::infra::InMemoryServiceFactory;
//! use tokio_util::sync::CancellationToken;
//!
//! let client = build_client(&SchedulerOptions::default(), InMemoryServiceFactory::new()).await?;
//! let cancel = CancellationToken::new();
//!
//! client.register_task(&TaskRegistration::new("\\", "nightly-backup", "<Task/>"), &cancel).await?;
//! client.run_task("\\", "nightly-backup", &cancel).await?;
//!
//! let stats = client.stats();
//! println!("{} operations, {} failed", stats.total_operations, stats.failed_operations);
//! client.shutdown();
//! ```
//!
//! The native service sits behind [`core::SchedulerService`] and
//! [`core::ServiceFactory`]; [`infra::memory`] provides an in-process
//! implementation with fault injection.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Retry executor, service pool, error taxonomy and statistics.
pub mod core;
/// Process-wide options for retry and pooling.
pub mod config;
/// Builders to construct a scheduler client from options.
pub mod builders;
/// Adapters implementing the native scheduler-service boundary.
pub mod infra;
/// Caller-facing client composing retry over the pool.
pub mod runtime;
/// Shared utilities.
pub mod util;
