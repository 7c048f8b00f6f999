//! Process-wide options for retry and pooling.

pub mod options;

pub use options::SchedulerOptions;
