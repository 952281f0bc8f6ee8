//! Test assertion helpers.
//!
//! Polling-based assertions for scenarios where a mock server observes an
//! effect some time after the client call returns.

use std::{future::Future, time::Duration};

use tokio::time::{Instant, sleep};

/// Default polling interval for [`assert_eventually`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls a condition until it returns true or the timeout expires.
///
/// Returns `true` if the condition held before the timeout, `false`
/// otherwise.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use nsq_proxy::mock::MockNsqd;
/// use nsq_proxy_test_utils::assert_eventually;
///
/// # async fn example(nsqd: MockNsqd) {
/// let arrived = assert_eventually(Duration::from_millis(200), || {
///     nsqd.messages().len() == 3
/// })
/// .await;
/// assert!(arrived, "all messages should reach the broker");
/// # }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(DEFAULT_POLL_INTERVAL).await;
    }

    condition()
}

/// Like [`assert_eventually`], for conditions that must await.
///
/// Useful when the state to inspect sits behind an async lock, such as
/// `Selector::state`.
pub async fn assert_eventually_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        sleep(DEFAULT_POLL_INTERVAL).await;
    }

    condition().await
}
