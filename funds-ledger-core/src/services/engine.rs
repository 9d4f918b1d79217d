//! Transaction engine - signed deltas against cached balances

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::domain::money::{checked_apply, round_currency, ApplyRejection};
use crate::domain::TransactionOutcome;
use crate::services::ledger::{AccountGuard, OfflineLedger};
use crate::services::logging::{events, EventRecorder, LogEvent};

/// Applies offline transactions to the [`OfflineLedger`]
///
/// A successful apply puts the user in the pending set; the cached balance
/// is then the only record of the change until the reconciler flushes it.
pub struct TransactionEngine {
    ledger: Arc<OfflineLedger>,
    events: Option<EventRecorder>,
}

impl TransactionEngine {
    pub fn new(ledger: Arc<OfflineLedger>) -> Self {
        Self {
            ledger,
            events: None,
        }
    }

    /// Record applied and rejected transactions in the event log
    pub fn with_events(mut self, events: EventRecorder) -> Self {
        self.events = Some(events);
        self
    }

    pub fn ledger(&self) -> &Arc<OfflineLedger> {
        &self.ledger
    }

    /// Apply `delta` to the user's cached balance
    pub async fn apply(&self, user_id: i64, delta: Decimal) -> TransactionOutcome {
        match self.ledger.lock(user_id).await {
            Some(mut guard) => self.apply_locked(&mut guard, delta),
            None => {
                debug!(user_id, "Offline transaction for unknown user");
                TransactionOutcome::UserUnavailable
            }
        }
    }

    /// Apply `delta` while the caller already holds the account lock
    pub(crate) fn apply_locked(
        &self,
        guard: &mut AccountGuard<'_>,
        delta: Decimal,
    ) -> TransactionOutcome {
        let delta = round_currency(delta);
        let balance = guard.balance();

        if delta.is_zero() {
            debug!(user_id = guard.user_id(), "Ignoring zero offline transaction");
            return TransactionOutcome::Applied(balance);
        }

        let next = match checked_apply(balance, delta) {
            Ok(next) => next,
            Err(rejection) => {
                let reason = match rejection {
                    ApplyRejection::Insufficient => "insufficient funds",
                    ApplyRejection::OutOfRange => "balance out of range",
                };
                info!(
                    user_id = guard.user_id(),
                    %balance,
                    %delta,
                    reason,
                    "Rejected offline transaction"
                );
                self.record(
                    LogEvent::new(events::OFFLINE_TRANSACTION_REJECTED)
                        .with_user(guard.user_id())
                        .with_amount(delta),
                );
                return match rejection {
                    ApplyRejection::Insufficient => {
                        TransactionOutcome::InsufficientFunds { balance, delta }
                    }
                    ApplyRejection::OutOfRange => TransactionOutcome::OutOfRange { balance, delta },
                };
            }
        };

        guard.set_balance(next);
        let newly_pending = guard.mark_pending();
        info!(
            user_id = guard.user_id(),
            username = guard.username(),
            %delta,
            balance = %next,
            newly_pending,
            "Applied offline transaction"
        );
        self.record(
            LogEvent::new(events::OFFLINE_TRANSACTION_APPLIED)
                .with_user(guard.user_id())
                .with_amount(delta),
        );

        TransactionOutcome::Applied(next)
    }

    fn record(&self, event: LogEvent) {
        if let Some(events) = &self.events {
            events.record(event);
        }
    }
}
