//! Reconciler - flush offline deltas back into the durable store
//!
//! Offline transactions are folded: whatever happened while the store was
//! down, only `cached - durable` is replayed, as a single durable
//! transaction. The account lock is held from the durable read to the
//! pending-set update, so an offline apply can never slip in between.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, error, info};

use crate::domain::money::round_currency;
use crate::domain::result::{Error, Result};
use crate::domain::ReconcileOutcome;
use crate::ports::BalanceStore;
use crate::services::ledger::{AccountGuard, OfflineLedger};
use crate::services::logging::{events, EventRecorder, LogEvent};

pub struct Reconciler {
    ledger: Arc<OfflineLedger>,
    store: Arc<dyn BalanceStore>,
    events: Option<EventRecorder>,
}

impl Reconciler {
    pub fn new(ledger: Arc<OfflineLedger>, store: Arc<dyn BalanceStore>) -> Self {
        Self {
            ledger,
            store,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventRecorder) -> Self {
        self.events = Some(events);
        self
    }

    /// Flush the pending delta for one user, if any
    ///
    /// Fails only with [`Error::ReconciliationFailed`] (the durable store
    /// rejected the replay) or a non-connectivity store error; in both
    /// cases the user stays pending.
    pub async fn reconcile(&self, user_id: i64) -> Result<ReconcileOutcome> {
        let Some(username) = self.ledger.username(user_id) else {
            return Ok(ReconcileOutcome::NotPending);
        };
        if !self.ledger.is_pending(&username) {
            return Ok(ReconcileOutcome::NotPending);
        }

        match self.ledger.lock(user_id).await {
            Some(mut guard) => self.reconcile_locked(&mut guard).await,
            None => Ok(ReconcileOutcome::NotPending),
        }
    }

    /// Reconcile every pending user
    ///
    /// A failure for one user does not stop the pass.
    pub async fn reconcile_all(&self) -> Vec<(i64, Result<ReconcileOutcome>)> {
        let mut results = Vec::new();
        for username in self.ledger.pending_usernames() {
            let Some(user_id) = self.ledger.user_id(&username) else {
                continue;
            };
            let outcome = self.reconcile(user_id).await;
            results.push((user_id, outcome));
        }
        results
    }

    /// Reconcile while the caller holds the account lock
    pub(crate) async fn reconcile_locked(
        &self,
        guard: &mut AccountGuard<'_>,
    ) -> Result<ReconcileOutcome> {
        // re-check: another task may have reconciled while we waited for the lock
        if !guard.is_pending() {
            return Ok(ReconcileOutcome::NotPending);
        }
        let user_id = guard.user_id();

        let durable = match self.store.get_or_create_balance(user_id).await {
            Ok(balance) => round_currency(balance),
            Err(e) if e.is_unreachable() => {
                debug!(user_id, error = %e, "Durable store still unreachable, keeping pending");
                return Ok(ReconcileOutcome::StillOffline);
            }
            Err(e) => return Err(e),
        };

        let cached = guard.balance();
        let delta = round_currency(cached - durable);

        if delta.is_zero() {
            guard.mirror(durable);
            guard.clear_pending();
            info!(user_id, balance = %durable, "Offline balance already in sync");
            return Ok(ReconcileOutcome::InSync { balance: durable });
        }

        match self.store.apply_transaction(user_id, delta).await {
            Ok(balance) => {
                guard.mirror(balance);
                guard.clear_pending();
                info!(user_id, %delta, %balance, "Replayed offline transactions");
                self.record(
                    LogEvent::new(events::RECONCILIATION_REPLAYED)
                        .with_user(user_id)
                        .with_amount(delta),
                );
                Ok(ReconcileOutcome::Replayed { delta, balance })
            }
            Err(e) if e.is_unreachable() => {
                debug!(user_id, error = %e, "Durable store dropped during replay, keeping pending");
                Ok(ReconcileOutcome::StillOffline)
            }
            Err(e) => Err(self.failed(user_id, delta, e)),
        }
    }

    fn failed(&self, user_id: i64, delta: Decimal, cause: Error) -> Error {
        let reason = cause.to_string();
        error!(user_id, %delta, reason = %reason, "Reconciliation failed, user stays pending");
        self.record(
            LogEvent::new(events::RECONCILIATION_FAILED)
                .with_user(user_id)
                .with_amount(delta)
                .with_error(reason.clone()),
        );
        Error::ReconciliationFailed {
            user_id,
            delta,
            reason,
        }
    }

    fn record(&self, event: LogEvent) {
        if let Some(events) = &self.events {
            events.record(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryBalanceStore;
    use crate::services::TransactionEngine;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    struct Fixture {
        ledger: Arc<OfflineLedger>,
        store: Arc<MemoryBalanceStore>,
        engine: TransactionEngine,
        reconciler: Reconciler,
    }

    async fn fixture(balance: &str) -> Fixture {
        let ledger = Arc::new(OfflineLedger::new());
        let store = Arc::new(MemoryBalanceStore::with_balances([(1, dec(balance))]));
        ledger.register(1, "alice", "token").await;
        ledger.mirror_balance(1, dec(balance)).await;
        Fixture {
            engine: TransactionEngine::new(ledger.clone()),
            reconciler: Reconciler::new(ledger.clone(), store.clone()),
            ledger,
            store,
        }
    }

    #[tokio::test]
    async fn test_not_pending_is_noop() {
        let f = fixture("100").await;
        assert_eq!(f.reconciler.reconcile(1).await.unwrap(), ReconcileOutcome::NotPending);
        assert_eq!(f.reconciler.reconcile(99).await.unwrap(), ReconcileOutcome::NotPending);
        assert_eq!(f.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_replays_net_delta() {
        let f = fixture("100").await;
        f.store.set_reachable(false);
        f.engine.apply(1, dec("-30")).await;
        f.engine.apply(1, dec("10")).await;
        f.engine.apply(1, dec("-5.5")).await;

        assert_eq!(
            f.reconciler.reconcile(1).await.unwrap(),
            ReconcileOutcome::StillOffline
        );
        assert!(f.ledger.is_pending("alice"));

        f.store.set_reachable(true);
        let outcome = f.reconciler.reconcile(1).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Replayed {
                delta: dec("-25.50"),
                balance: dec("74.50"),
            }
        );
        assert_eq!(f.store.peek(1), Some(dec("74.50")));
        assert_eq!(f.store.write_count(), 1);
        assert!(!f.ledger.is_pending("alice"));
    }

    #[tokio::test]
    async fn test_in_sync_clears_without_write() {
        let f = fixture("100").await;
        f.engine.apply(1, dec("-30")).await;
        // durable side already caught up by some other path
        f.store.set_balance(1, dec("70")).await.unwrap();
        let writes = f.store.write_count();

        assert_eq!(
            f.reconciler.reconcile(1).await.unwrap(),
            ReconcileOutcome::InSync { balance: dec("70.00") }
        );
        assert_eq!(f.store.write_count(), writes);
        assert!(!f.ledger.is_pending("alice"));
        assert_eq!(f.reconciler.reconcile(1).await.unwrap(), ReconcileOutcome::NotPending);
    }

    #[tokio::test]
    async fn test_missing_durable_record_is_created() {
        let ledger = Arc::new(OfflineLedger::new());
        let store = Arc::new(MemoryBalanceStore::new());
        ledger.register(2, "bob", "token").await;
        let engine = TransactionEngine::new(ledger.clone());
        let reconciler = Reconciler::new(ledger.clone(), store.clone());

        engine.apply(2, dec("15")).await;
        assert_eq!(
            reconciler.reconcile(2).await.unwrap(),
            ReconcileOutcome::Replayed {
                delta: dec("15.00"),
                balance: dec("15.00"),
            }
        );
        assert_eq!(store.peek(2), Some(dec("15.00")));
    }

    /// Memory store whose durable transactions fail for one user
    struct RejectingStore {
        inner: MemoryBalanceStore,
        reject_user: i64,
    }

    #[async_trait::async_trait]
    impl BalanceStore for RejectingStore {
        async fn get_balance(&self, user_id: i64) -> Result<Option<Decimal>> {
            self.inner.get_balance(user_id).await
        }

        async fn create_balance(&self, user_id: i64) -> Result<Decimal> {
            self.inner.create_balance(user_id).await
        }

        async fn set_balance(&self, user_id: i64, value: Decimal) -> Result<Decimal> {
            self.inner.set_balance(user_id, value).await
        }

        async fn apply_transaction(&self, user_id: i64, delta: Decimal) -> Result<Decimal> {
            if user_id == self.reject_user {
                return Err(Error::InsufficientFunds {
                    balance: Decimal::ZERO,
                    delta,
                });
            }
            self.inner.apply_transaction(user_id, delta).await
        }
    }

    async fn rejecting_fixture() -> (Arc<OfflineLedger>, TransactionEngine, Reconciler) {
        let ledger = Arc::new(OfflineLedger::new());
        let store = Arc::new(RejectingStore {
            inner: MemoryBalanceStore::with_balances([(1, dec("100")), (2, dec("0"))]),
            reject_user: 1,
        });
        ledger.register(1, "alice", "token").await;
        ledger.register(2, "bob", "token").await;
        ledger.mirror_balance(1, dec("100")).await;
        (
            ledger.clone(),
            TransactionEngine::new(ledger.clone()),
            Reconciler::new(ledger, store),
        )
    }

    #[tokio::test]
    async fn test_rejected_replay_keeps_pending() {
        let (ledger, engine, reconciler) = rejecting_fixture().await;
        engine.apply(1, dec("-40")).await;

        let err = reconciler.reconcile(1).await.unwrap_err();
        match err {
            Error::ReconciliationFailed { user_id, delta, .. } => {
                assert_eq!(user_id, 1);
                assert_eq!(delta, dec("-40.00"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(ledger.is_pending("alice"));
        assert_eq!(ledger.cached_balance(1).await.unwrap(), dec("60.00"));
    }

    #[tokio::test]
    async fn test_reconcile_all_continues_past_failures() {
        let (ledger, engine, reconciler) = rejecting_fixture().await;
        engine.apply(1, dec("-90")).await;
        engine.apply(2, dec("5")).await;

        let results = reconciler.reconcile_all().await;
        assert_eq!(results.len(), 2);
        let alice = results.iter().find(|(id, _)| *id == 1).unwrap();
        let bob = results.iter().find(|(id, _)| *id == 2).unwrap();
        assert!(alice.1.is_err());
        assert!(bob.1.as_ref().unwrap().cleared());
        assert_eq!(ledger.pending_usernames(), vec!["alice".to_string()]);
    }
}
