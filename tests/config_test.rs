//! Option loading from JSON and environment-style lookups.

use std::time::Duration;

use resilient_scheduler::config::SchedulerOptions;
use resilient_scheduler::core::{BackoffMode, PoolSettings, RetrySettings};

#[test]
fn test_partial_json_keeps_defaults() {
    let opts = SchedulerOptions::from_json_str(
        r#"{ "pool_capacity": 10, "retry_base_delay": 250, "use_exponential_backoff": false }"#,
    )
    .unwrap();

    assert_eq!(opts.pool_capacity, 10);
    assert_eq!(opts.retry_base_delay, Duration::from_millis(250));
    assert_eq!(opts.default_retry_count, 3);
    assert_eq!(opts.pool_acquire_timeout, Duration::from_secs(30));
    assert_eq!(opts.default_retry_policy().backoff, BackoffMode::Linear);
}

#[test]
fn test_invalid_json_values_rejected() {
    assert!(SchedulerOptions::from_json_str(r#"{ "jitter_factor": 2.0 }"#).is_err());
    assert!(SchedulerOptions::from_json_str(r#"{ "pool_capacity": 2, "min_handles": 3 }"#).is_err());
    assert!(SchedulerOptions::from_json_str("not json").is_err());
}

#[test]
fn test_settings_derived_from_options() {
    let opts = SchedulerOptions {
        pool_capacity: 7,
        operation_timeout: Duration::from_secs(5),
        ..SchedulerOptions::default()
    };

    let pool = PoolSettings::from(&opts);
    assert_eq!(pool.capacity, 7);
    assert_eq!(pool.min_handles, 2);
    assert_eq!(pool.idle_timeout, Duration::from_secs(300));
    assert_eq!(pool.cleanup_interval, Duration::from_secs(60));

    let retry = RetrySettings::from(&opts);
    assert_eq!(retry.operation_timeout, Duration::from_secs(5));
    assert_eq!(retry.default_policy.retry_count, 3);
    assert_eq!(retry.default_policy.max_delay, Duration::from_secs(30));
}

#[test]
fn test_lookup_without_overrides_is_default() {
    let opts = SchedulerOptions::from_lookup(|_| None).unwrap();
    assert_eq!(opts, SchedulerOptions::default());
}

#[test]
fn test_lookup_validates_result() {
    let err = SchedulerOptions::from_lookup(|key| match key {
        "SCHEDULER_POOL_CAPACITY" => Some("1".into()),
        "SCHEDULER_MIN_HANDLES" => Some("4".into()),
        _ => None,
    })
    .unwrap_err();
    assert!(err.contains("min_handles"));
}
