//! Test configuration helpers.
//!
//! Centralizes the short timeouts integration tests use against local mock
//! servers, so a dead node fails in milliseconds instead of seconds.

use std::time::Duration;

use nsq_proxy::{LogConfig, ProducerConfig, Result, SelectorConfig};

/// Returns broker connection settings tuned for local mocks.
///
/// - `dial_timeout`: 200ms
/// - `read_timeout`: 2s
/// - `write_timeout`: 200ms
/// - `client_id`: `"nsq-proxy-test"`
#[must_use]
pub fn test_producer_config() -> ProducerConfig {
    ProducerConfig::builder()
        .dial_timeout(Duration::from_millis(200))
        .read_timeout(Duration::from_secs(2))
        .write_timeout(Duration::from_millis(200))
        .client_id("nsq-proxy-test")
        .build()
}

/// Builds a selector configuration for tests.
///
/// Defaults: one retry cycle, a 1s discovery timeout, logging disabled, and
/// [`test_producer_config`] for connections.
///
/// # Errors
///
/// Returns the validation error from [`SelectorConfig`] if an endpoint is
/// malformed.
///
/// # Example
///
/// ```no_run
/// use nsq_proxy_test_utils::test_selector_config;
///
/// let config = test_selector_config()
///     .endpoints(vec!["127.0.0.1:4161".to_owned()])
///     .retry_cycles(2)
///     .call()
///     .unwrap();
/// assert_eq!(config.retry_cycles(), 2);
/// ```
#[bon::builder]
pub fn test_selector_config(
    endpoints: Vec<String>,
    #[builder(default = 1)] retry_cycles: u32,
    #[builder(default = Duration::from_secs(1))] discovery_timeout: Duration,
    #[builder(default = LogConfig::disabled())] log: LogConfig,
) -> Result<SelectorConfig> {
    SelectorConfig::builder()
        .with_endpoints(endpoints)
        .with_retry_cycles(retry_cycles)
        .with_discovery_timeout(discovery_timeout)
        .with_producer_config(test_producer_config())
        .with_log_config(log)
        .build()
}
