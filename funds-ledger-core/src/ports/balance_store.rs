//! Balance store port - durable storage abstraction

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::result::Result;

/// Durable balance storage
///
/// The authoritative source of balances while it is reachable. Every method
/// may fail with [`Error::Unreachable`](crate::domain::result::Error::Unreachable),
/// which callers treat as a signal to switch to the offline ledger rather
/// than as a hard failure.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Read the balance for a user, `None` if the user has no balance record
    async fn get_balance(&self, user_id: i64) -> Result<Option<Decimal>>;

    /// Create a zero balance record, returning the stored value
    ///
    /// Returns the existing value if the record is already there.
    async fn create_balance(&self, user_id: i64) -> Result<Decimal>;

    /// Overwrite the balance with an absolute value
    async fn set_balance(&self, user_id: i64, value: Decimal) -> Result<Decimal>;

    /// Apply a signed delta as a single durable transaction
    ///
    /// Creates the record if missing. Fails with
    /// [`Error::InsufficientFunds`](crate::domain::result::Error::InsufficientFunds)
    /// when the result would be negative; the stored value is then unchanged.
    async fn apply_transaction(&self, user_id: i64, delta: Decimal) -> Result<Decimal>;

    /// Get the balance, creating a zero record when missing
    async fn get_or_create_balance(&self, user_id: i64) -> Result<Decimal> {
        match self.get_balance(user_id).await? {
            Some(balance) => Ok(balance),
            None => self.create_balance(user_id).await,
        }
    }
}
