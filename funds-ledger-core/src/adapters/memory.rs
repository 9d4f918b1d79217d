//! In-process balance store
//!
//! Behaves like the durable store (same rounding and non-negative check) but
//! keeps everything in a map. Outages are simulated with [`MemoryBalanceStore::set_reachable`],
//! slow connections with [`MemoryBalanceStore::set_delay`], lost acknowledgements
//! with [`MemoryBalanceStore::set_ack_delay`] and rejected writes with
//! [`MemoryBalanceStore::set_failing_writes`], which makes it the store of
//! choice for tests and demos of the offline path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::money::{checked_apply, round_currency, MAX_BALANCE};
use crate::domain::result::{Error, Result};
use crate::ports::BalanceStore;

/// Balance store backed by a `HashMap`
#[derive(Debug, Default)]
pub struct MemoryBalanceStore {
    balances: Mutex<HashMap<i64, Decimal>>,
    unreachable: AtomicBool,
    delay_ms: AtomicU64,
    ack_delay_ms: AtomicU64,
    failing_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with balances
    pub fn with_balances(balances: impl IntoIterator<Item = (i64, Decimal)>) -> Self {
        let store = Self::new();
        {
            let mut map = store.balances.lock().unwrap_or_else(|e| e.into_inner());
            for (user_id, balance) in balances {
                map.insert(user_id, round_currency(balance));
            }
        }
        store
    }

    /// Toggle the simulated connection
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }

    /// Delay every call by `delay` (zero disables)
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay the reply to every successful write by `delay` (zero disables)
    ///
    /// The write itself lands before the delay, like a commit whose
    /// acknowledgement is lost on the way back.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.ack_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every write fail with a database error while the store stays reachable
    pub fn set_failing_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    /// Number of successful mutating calls so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Read a balance bypassing the reachability switch
    pub fn peek(&self, user_id: i64) -> Option<Decimal> {
        self.balances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user_id)
            .copied()
    }

    async fn connect(&self) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.is_reachable() {
            Ok(())
        } else {
            Err(Error::unreachable("connection refused"))
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing_writes.load(Ordering::SeqCst) {
            Err(Error::database("simulated write failure"))
        } else {
            Ok(())
        }
    }

    async fn acknowledge(&self) {
        let delay = self.ack_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    fn balances(&self) -> Result<std::sync::MutexGuard<'_, HashMap<i64, Decimal>>> {
        self.balances
            .lock()
            .map_err(|e| Error::database(format!("Lock poisoned: {}", e)))
    }
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn get_balance(&self, user_id: i64) -> Result<Option<Decimal>> {
        self.connect().await?;
        Ok(self.balances()?.get(&user_id).copied())
    }

    async fn create_balance(&self, user_id: i64) -> Result<Decimal> {
        self.connect().await?;
        self.check_writable()?;
        let value = *self
            .balances()?
            .entry(user_id)
            .or_insert_with(|| round_currency(Decimal::ZERO));
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.acknowledge().await;
        Ok(value)
    }

    async fn set_balance(&self, user_id: i64, value: Decimal) -> Result<Decimal> {
        self.connect().await?;
        self.check_writable()?;
        if value.is_sign_negative() && !value.is_zero() {
            return Err(Error::validation(format!("Negative balance {} for user #{}", value, user_id)));
        }
        let value = round_currency(value);
        if value > MAX_BALANCE {
            return Err(Error::validation(format!(
                "Balance {} for user #{} exceeds the largest storable balance",
                value, user_id
            )));
        }
        self.balances()?.insert(user_id, value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.acknowledge().await;
        Ok(value)
    }

    async fn apply_transaction(&self, user_id: i64, delta: Decimal) -> Result<Decimal> {
        self.connect().await?;
        self.check_writable()?;
        let next = {
            let mut balances = self.balances()?;
            let current = balances
                .get(&user_id)
                .copied()
                .unwrap_or_else(|| round_currency(Decimal::ZERO));
            let next = checked_apply(current, delta)
                .map_err(|rejection| rejection.into_error(current, delta))?;
            balances.insert(user_id, next);
            next
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.acknowledge().await;
        Ok(next)
    }
}
