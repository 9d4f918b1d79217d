//! Timeout decorator for balance stores
//!
//! A stalled connection must not stall request handling, so every call to
//! the wrapped store is bounded and an elapsed deadline is reported as
//! `Unreachable`, the same as a refused connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::warn;

use crate::domain::result::{Error, Result};
use crate::ports::BalanceStore;

/// Wraps a [`BalanceStore`] and bounds each call with a timeout
pub struct TimeoutBalanceStore {
    inner: Arc<dyn BalanceStore>,
    timeout: Duration,
}

impl TimeoutBalanceStore {
    pub fn new(inner: Arc<dyn BalanceStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T, F>(&self, op: &'static str, user_id: i64, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    op,
                    user_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Durable store call timed out"
                );
                Err(Error::unreachable(format!(
                    "{} timed out after {}ms",
                    op,
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl BalanceStore for TimeoutBalanceStore {
    async fn get_balance(&self, user_id: i64) -> Result<Option<Decimal>> {
        self.bounded("get_balance", user_id, self.inner.get_balance(user_id))
            .await
    }

    async fn create_balance(&self, user_id: i64) -> Result<Decimal> {
        self.bounded("create_balance", user_id, self.inner.create_balance(user_id))
            .await
    }

    async fn set_balance(&self, user_id: i64, value: Decimal) -> Result<Decimal> {
        self.bounded("set_balance", user_id, self.inner.set_balance(user_id, value))
            .await
    }

    async fn apply_transaction(&self, user_id: i64, delta: Decimal) -> Result<Decimal> {
        self.bounded(
            "apply_transaction",
            user_id,
            self.inner.apply_transaction(user_id, delta),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryBalanceStore;

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_reports_unreachable() {
        let memory = Arc::new(MemoryBalanceStore::with_balances([(1, Decimal::TEN)]));
        memory.set_delay(Duration::from_secs(30));
        let store = TimeoutBalanceStore::new(memory.clone(), Duration::from_millis(500));

        let err = store.get_balance(1).await.unwrap_err();
        assert!(err.is_unreachable());
        assert!(err.to_string().contains("get_balance timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_store_passes_through() {
        let memory = Arc::new(MemoryBalanceStore::with_balances([(1, Decimal::TEN)]));
        let store = TimeoutBalanceStore::new(memory, Duration::from_millis(500));

        assert_eq!(store.get_balance(1).await.unwrap(), Some(Decimal::new(1000, 2)));
        let err = store
            .apply_transaction(1, Decimal::new(-20, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
    }
}
