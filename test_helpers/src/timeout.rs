//! Bound futures in tests so a wedged task fails the test instead of
//! hanging the suite.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

#[async_trait]
pub trait FutureTimeout: Future + Send + Sized {
    /// Awaits the future, panicking if it does not resolve within `duration`.
    async fn with_timeout_panic(self, duration: Duration) -> Self::Output
    where
        Self::Output: Send,
    {
        tokio::time::timeout(duration, self)
            .await
            .expect("future did not resolve within timeout")
    }

    /// Awaits the future, returning `Err` if it does not resolve within `duration`.
    async fn with_timeout(self, duration: Duration) -> Result<Self::Output, tokio::time::error::Elapsed>
    where
        Self::Output: Send,
    {
        tokio::time::timeout(duration, self).await
    }
}

impl<F: Future + Send + Sized> FutureTimeout for F {}
