//! Funds service - balance reads and transactions with offline fallback
//!
//! Each request for a registered user runs under that user's account lock:
//! flush any pending offline delta, refresh the cached baseline from the
//! durable store, do the durable operation. If the store is unreachable at
//! any step the request is served from the offline ledger instead. A user
//! who is still pending after the flush attempt never touches the durable
//! store, so the replayed net delta stays exact.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::domain::money::round_currency;
use crate::domain::result::{Error, Result};
use crate::domain::{FundsOutcome, TransactionOutcome};
use crate::ports::BalanceStore;
use crate::services::engine::TransactionEngine;
use crate::services::ledger::{AccountGuard, OfflineLedger};
use crate::services::reconcile::Reconciler;

pub struct FundsService {
    ledger: Arc<OfflineLedger>,
    store: Arc<dyn BalanceStore>,
    engine: Arc<TransactionEngine>,
    reconciler: Arc<Reconciler>,
}

impl FundsService {
    pub fn new(
        ledger: Arc<OfflineLedger>,
        store: Arc<dyn BalanceStore>,
        engine: Arc<TransactionEngine>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            ledger,
            store,
            engine,
            reconciler,
        }
    }

    /// Register a freshly authenticated user and take a balance baseline
    pub async fn login(&self, user_id: i64, username: &str, token: &str) -> Result<FundsOutcome> {
        self.ledger.register(user_id, username, token).await;
        self.balance(user_id).await
    }

    /// Current balance, from the durable store when reachable
    pub async fn balance(&self, user_id: i64) -> Result<FundsOutcome> {
        let Some(mut guard) = self.ledger.lock(user_id).await else {
            return self.unregistered_balance(user_id).await;
        };

        if self.still_pending(&mut guard).await? {
            return Ok(FundsOutcome::offline(guard.balance()));
        }

        match self.store.get_or_create_balance(user_id).await {
            Ok(balance) => {
                guard.mirror(balance);
                Ok(FundsOutcome::Online {
                    balance: round_currency(balance),
                })
            }
            Err(e) if e.is_unreachable() => {
                warn!(user_id, error = %e, "Durable store unreachable, serving cached balance");
                Ok(FundsOutcome::offline(guard.balance()))
            }
            Err(e) => Err(e),
        }
    }

    /// Apply a signed delta, falling back to the offline ledger
    pub async fn transact(&self, user_id: i64, delta: Decimal) -> Result<FundsOutcome> {
        let delta = round_currency(delta);
        let Some(mut guard) = self.ledger.lock(user_id).await else {
            return self.unregistered_transact(user_id, delta).await;
        };

        if self.still_pending(&mut guard).await? {
            return Ok(self.offline_transact(&mut guard, delta));
        }

        match self.store.get_or_create_balance(user_id).await {
            Ok(balance) => guard.mirror(balance),
            Err(e) if e.is_unreachable() => {
                warn!(user_id, error = %e, "Durable store unreachable, processing offline");
                return Ok(self.offline_transact(&mut guard, delta));
            }
            Err(e) => return Err(e),
        }

        match self.store.apply_transaction(user_id, delta).await {
            Ok(balance) => {
                guard.mirror(balance);
                Ok(FundsOutcome::Online {
                    balance: round_currency(balance),
                })
            }
            Err(Error::InsufficientFunds { balance, delta }) => {
                debug!(user_id, %balance, %delta, "Durable store rejected transaction");
                Ok(FundsOutcome::Rejected { balance, delta })
            }
            Err(e) if e.is_unreachable() => {
                warn!(user_id, error = %e, "Durable store dropped during transaction, processing offline");
                Ok(self.offline_transact(&mut guard, delta))
            }
            Err(e) => Err(e),
        }
    }

    /// Flush pending deltas; true if the user is still pending afterwards
    async fn still_pending(&self, guard: &mut AccountGuard<'_>) -> Result<bool> {
        let outcome = self.reconciler.reconcile_locked(guard).await?;
        debug!(user_id = guard.user_id(), ?outcome, "Pre-request reconciliation");
        Ok(guard.is_pending())
    }

    fn offline_transact(&self, guard: &mut AccountGuard<'_>, delta: Decimal) -> FundsOutcome {
        match self.engine.apply_locked(guard, delta) {
            TransactionOutcome::Applied(balance) => FundsOutcome::offline(balance),
            TransactionOutcome::InsufficientFunds { balance, delta }
            | TransactionOutcome::OutOfRange { balance, delta } => {
                FundsOutcome::OfflineRejected { balance, delta }
            }
            TransactionOutcome::UserUnavailable => FundsOutcome::UserUnavailable,
        }
    }

    async fn unregistered_balance(&self, user_id: i64) -> Result<FundsOutcome> {
        match self.store.get_or_create_balance(user_id).await {
            Ok(balance) => Ok(FundsOutcome::Online {
                balance: round_currency(balance),
            }),
            Err(e) if e.is_unreachable() => {
                warn!(user_id, "Durable store unreachable and user not available offline");
                Ok(FundsOutcome::UserUnavailable)
            }
            Err(e) => Err(e),
        }
    }

    async fn unregistered_transact(&self, user_id: i64, delta: Decimal) -> Result<FundsOutcome> {
        match self.store.apply_transaction(user_id, delta).await {
            Ok(balance) => Ok(FundsOutcome::Online {
                balance: round_currency(balance),
            }),
            Err(Error::InsufficientFunds { balance, delta }) => {
                Ok(FundsOutcome::Rejected { balance, delta })
            }
            Err(e) if e.is_unreachable() => {
                warn!(user_id, "Durable store unreachable and user not available offline");
                Ok(FundsOutcome::UserUnavailable)
            }
            Err(e) => Err(e),
        }
    }
}
