//! Async helpers shared by integration tests.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Poll `condition` every 10ms until it returns true or `timeout` elapses.
/// Returns whether the condition was met, so assertions stay in the test.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
