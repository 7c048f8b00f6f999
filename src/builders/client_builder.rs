//! Build a [`SchedulerClient`] from [`SchedulerOptions`].

use tracing::info;

use crate::config::SchedulerOptions;
use crate::core::{
    AppResult, PoolSettings, RetryExecutor, SchedulerError, ServiceFactory, ServicePool,
};
use crate::runtime::SchedulerClient;

/// Client over the production pool and executor.
pub type DefaultClient<F> = SchedulerClient<ServicePool<F>, RetryExecutor>;

/// Validate `options`, build the pool and executor, and pre-create handles
/// when `prewarm` is set.
///
/// # Errors
///
/// `ConfigurationInvalid` for bad options; the factory's error if pre-warming
/// fails.
pub async fn build_client<F: ServiceFactory>(
    options: &SchedulerOptions,
    factory: F,
) -> Result<DefaultClient<F>, SchedulerError> {
    options
        .validate()
        .map_err(|e| SchedulerError::ConfigurationInvalid(format!("options invalid: {e}")))?;

    let pool = ServicePool::new(factory, PoolSettings::from(options))?;
    if options.prewarm {
        pool.warm_up().await?;
    }
    let retry = RetryExecutor::new(options);

    info!(
        pool_capacity = options.pool_capacity,
        retry_count = options.default_retry_count,
        exponential = options.use_exponential_backoff,
        "scheduler client ready"
    );
    Ok(SchedulerClient::new(pool, retry))
}

/// [`build_client`] with options read from `SCHEDULER_*` environment
/// variables (and `.env`, if present).
///
/// # Errors
///
/// Fails if a variable cannot be parsed or the client cannot be built.
pub async fn build_client_from_env<F: ServiceFactory>(factory: F) -> AppResult<DefaultClient<F>> {
    let options = SchedulerOptions::from_env().map_err(anyhow::Error::msg)?;
    Ok(build_client(&options, factory).await?)
}
