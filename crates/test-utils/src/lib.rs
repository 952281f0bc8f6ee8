//! Shared test utilities for nsq-proxy.
//!
//! This crate provides common test helpers to reduce boilerplate across test modules:
//!
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`assert_eventually_async`] - Same, for conditions that await
//! - [`test_producer_config`] - Broker connection settings with short timeouts
//! - [`test_selector_config`] - Selector configuration builder for tests
//! - [`strategies`] - Proptest generators for topics, payloads, and nodes

#![deny(unsafe_code)]

mod assertions;
pub use assertions::{assert_eventually, assert_eventually_async};

mod config;
pub use config::{test_producer_config, test_selector_config};

pub mod strategies;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use nsq_proxy::LogLevel;

    use super::*;

    // ============================================
    // assert_eventually tests
    // ============================================

    #[tokio::test]
    async fn test_assert_eventually_immediate_success() {
        let result = assert_eventually(Duration::from_millis(100), || true).await;
        assert!(result, "immediately true condition should succeed");
    }

    #[tokio::test]
    async fn test_assert_eventually_delayed_success() {
        let counter = AtomicUsize::new(0);
        let result = assert_eventually(Duration::from_millis(500), || {
            counter.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;
        assert!(result, "condition should eventually become true");
        assert!(counter.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_assert_eventually_timeout() {
        let result = assert_eventually(Duration::from_millis(50), || false).await;
        assert!(!result, "never-true condition should timeout");
    }

    #[tokio::test]
    async fn test_assert_eventually_async_sees_spawned_change() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&flag);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            setter.store(true, Ordering::SeqCst);
        });

        let result = assert_eventually_async(Duration::from_millis(500), || {
            let flag = Arc::clone(&flag);
            async move { flag.load(Ordering::SeqCst) }
        })
        .await;
        assert!(result, "should detect state change");
    }

    // ============================================
    // Config helper tests
    // ============================================

    #[test]
    fn test_producer_config_uses_short_timeouts() {
        let config = test_producer_config();
        assert!(config.dial_timeout() < Duration::from_secs(1));
        assert_eq!(config.client_id(), Some("nsq-proxy-test"));
    }

    #[test]
    fn test_selector_config_defaults() {
        let config =
            test_selector_config().endpoints(vec!["127.0.0.1:4161".to_owned()]).call().unwrap();

        assert_eq!(config.retry_cycles(), 1);
        assert_eq!(config.discovery_timeout(), Duration::from_secs(1));
        assert_eq!(config.log().level(), LogLevel::Off);
        assert_eq!(config.producer().client_id(), Some("nsq-proxy-test"));
    }

    #[test]
    fn test_selector_config_custom_values() {
        let config = test_selector_config()
            .endpoints(vec!["a:4161".to_owned(), "b:4161".to_owned()])
            .retry_cycles(3)
            .call()
            .unwrap();

        assert_eq!(config.endpoints().len(), 2);
        assert_eq!(config.retry_cycles(), 3);
    }

    #[test]
    fn test_selector_config_rejects_bad_endpoint() {
        let result = test_selector_config().endpoints(vec!["ftp://a:4161".to_owned()]).call();
        assert!(result.is_err());
    }
}
