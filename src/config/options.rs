//! Process-wide options consumed by the retry executor and the service pool.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::retry::{BackoffMode, RetryPolicy};

/// Options for the service pool and the retry executor.
///
/// Durations are serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Maximum number of handles in use at once.
    pub pool_capacity: usize,
    /// How long a caller may wait for a pool permit.
    #[serde(with = "duration_millis")]
    pub pool_acquire_timeout: Duration,
    /// Retries applied when the caller supplies no policy.
    pub default_retry_count: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub retry_base_delay: Duration,
    /// Upper bound for any retry delay.
    #[serde(with = "duration_millis")]
    pub retry_max_delay: Duration,
    /// Limit for a single attempt.
    #[serde(with = "duration_millis")]
    pub operation_timeout: Duration,
    /// Jitter factor in `[0, 1]`.
    pub jitter_factor: f64,
    /// Exponential backoff when true, linear otherwise.
    pub use_exponential_backoff: bool,
    /// Emit per-attempt debug events.
    pub detailed_logging: bool,
    /// Floor the idle sweep never evicts below.
    pub min_handles: usize,
    /// Idle time after which a handle becomes eligible for eviction.
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
    /// Interval between idle sweeps.
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,
    /// How long to poll the idle queue when the pool is full before falling
    /// back to a temporary handle.
    #[serde(with = "duration_millis")]
    pub idle_poll_timeout: Duration,
    /// Create `min_handles` handles when the pool is built.
    pub prewarm: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            pool_capacity: 5,
            pool_acquire_timeout: Duration::from_secs(30),
            default_retry_count: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(60),
            jitter_factor: 0.1,
            use_exponential_backoff: true,
            detailed_logging: false,
            min_handles: 2,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            idle_poll_timeout: Duration::from_millis(100),
            prewarm: false,
        }
    }
}

impl SchedulerOptions {
    /// Validate option values.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_capacity == 0 {
            return Err("pool_capacity must be greater than 0".into());
        }
        if self.pool_acquire_timeout.is_zero() {
            return Err("pool_acquire_timeout must be greater than 0".into());
        }
        if self.retry_base_delay.is_zero() || self.retry_max_delay.is_zero() {
            return Err("retry delays must be greater than 0".into());
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err("retry_max_delay must be at least retry_base_delay".into());
        }
        if self.operation_timeout.is_zero() {
            return Err("operation_timeout must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            ));
        }
        if self.min_handles > self.pool_capacity {
            return Err(format!(
                "min_handles ({}) must not exceed pool_capacity ({})",
                self.min_handles, self.pool_capacity
            ));
        }
        if self.idle_timeout.is_zero() || self.cleanup_interval.is_zero() {
            return Err("idle_timeout and cleanup_interval must be greater than 0".into());
        }
        Ok(())
    }

    /// Policy applied when the caller does not pass one.
    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_count: self.default_retry_count,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            jitter_factor: self.jitter_factor,
            backoff: if self.use_exponential_backoff {
                BackoffMode::Exponential
            } else {
                BackoffMode::Linear
            },
        }
    }

    /// Parse options from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let opts: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Load options from defaults overridden by `SCHEDULER_*` environment
    /// variables. A `.env` file in the working directory is read first if
    /// present.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = Self::default();

        if let Some(v) = parse_var(&lookup, "SCHEDULER_POOL_CAPACITY")? {
            opts.pool_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_POOL_ACQUIRE_TIMEOUT_MS")? {
            opts.pool_acquire_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_DEFAULT_RETRY_COUNT")? {
            opts.default_retry_count = v;
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_RETRY_BASE_DELAY_MS")? {
            opts.retry_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_RETRY_MAX_DELAY_MS")? {
            opts.retry_max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_OPERATION_TIMEOUT_MS")? {
            opts.operation_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_JITTER_FACTOR")? {
            opts.jitter_factor = v;
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_USE_EXPONENTIAL_BACKOFF")? {
            opts.use_exponential_backoff = v;
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_DETAILED_LOGGING")? {
            opts.detailed_logging = v;
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_MIN_HANDLES")? {
            opts.min_handles = v;
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_IDLE_TIMEOUT_MS")? {
            opts.idle_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_CLEANUP_INTERVAL_MS")? {
            opts.cleanup_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_IDLE_POLL_TIMEOUT_MS")? {
            opts.idle_poll_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "SCHEDULER_PREWARM")? {
            opts.prewarm = v;
        }

        opts.validate()?;
        Ok(opts)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, String>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| format!("{key}: cannot parse `{raw}`: {e}"))
        })
        .transpose()
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
