//! Adapters implementing the native scheduler-service boundary.

pub mod memory;

pub use memory::{InMemorySchedulerService, InMemoryServiceFactory};
