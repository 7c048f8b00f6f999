//! Caller-facing client composing retry over the pool.

pub mod client;

pub use client::SchedulerClient;
