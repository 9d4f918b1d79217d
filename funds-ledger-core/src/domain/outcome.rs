//! Tagged outcomes of ledger operations
//!
//! Offline conditions are ordinary values, not errors: callers match on these
//! to build a degraded-service response.

use rust_decimal::Decimal;
use serde::Serialize;

/// Message attached to responses served from the offline ledger
pub const OFFLINE_MESSAGE: &str =
    "Service partially down. But your transaction is being processed offline";

/// Result of applying a delta to a cached balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOutcome {
    /// Delta applied; carries the new cached balance
    Applied(Decimal),
    /// The user has not logged in since the process started
    UserUnavailable,
    /// The delta would take the balance below zero; nothing changed
    InsufficientFunds { balance: Decimal, delta: Decimal },
    /// The result would exceed the largest storable balance; nothing changed
    OutOfRange { balance: Decimal, delta: Decimal },
}

impl TransactionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Result of a reconciliation pass for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Nothing to flush (the common case)
    NotPending,
    /// Durable store still unreachable; pending status kept
    StillOffline,
    /// Durable balance already matched the cache; pending cleared without a write
    InSync { balance: Decimal },
    /// Net delta written to the durable store; pending cleared
    Replayed { delta: Decimal, balance: Decimal },
}

impl ReconcileOutcome {
    /// Whether the user left the pending set during this pass
    pub fn cleared(&self) -> bool {
        matches!(self, Self::InSync { .. } | Self::Replayed { .. })
    }
}

/// Response-level outcome of a balance read or write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FundsOutcome {
    /// Served by the durable store
    Online { balance: Decimal },
    /// Durable store rejected the transaction
    Rejected { balance: Decimal, delta: Decimal },
    /// Served from the offline ledger
    Offline { balance: Decimal, message: String },
    /// Offline ledger rejected the transaction
    OfflineRejected { balance: Decimal, delta: Decimal },
    /// Store unreachable and no cached identity to fall back on
    UserUnavailable,
}

impl FundsOutcome {
    pub fn offline(balance: Decimal) -> Self {
        Self::Offline {
            balance,
            message: OFFLINE_MESSAGE.to_string(),
        }
    }

    /// Balance reported to the caller, if any
    pub fn balance(&self) -> Option<Decimal> {
        match self {
            Self::Online { balance }
            | Self::Rejected { balance, .. }
            | Self::Offline { balance, .. }
            | Self::OfflineRejected { balance, .. } => Some(*balance),
            Self::UserUnavailable => None,
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            Self::Offline { .. } | Self::OfflineRejected { .. } | Self::UserUnavailable
        )
    }
}
