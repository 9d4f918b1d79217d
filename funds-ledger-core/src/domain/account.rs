//! Cached account domain model

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::money::round_currency;

/// Per-user state held by the offline ledger
///
/// `balance` mirrors the durable store while it is reachable and becomes the
/// authoritative value while it is not. Pending status lives in the ledger's
/// pending set, not here.
#[derive(Debug, Clone, Serialize)]
pub struct CachedAccount {
    pub username: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub balance: Decimal,
    /// Last time the balance was mirrored from the durable store
    pub mirrored_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CachedAccount {
    /// Create an account with a zero balance
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
            balance: round_currency(Decimal::ZERO),
            mirrored_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Replace the token after a fresh login
    pub fn refresh_token(&mut self, token: impl Into<String>) {
        self.token = token.into();
        self.updated_at = Utc::now();
    }

    /// Set the balance after an offline transaction
    pub fn set_balance(&mut self, balance: Decimal) {
        self.balance = round_currency(balance);
        self.updated_at = Utc::now();
    }

    /// Overwrite the balance with a value read from the durable store
    pub fn mirror(&mut self, balance: Decimal) {
        let now = Utc::now();
        self.balance = round_currency(balance);
        self.mirrored_at = Some(now);
        self.updated_at = now;
    }

    /// Short, non-reversible token fingerprint safe to put in diagnostics
    pub fn token_fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        hex::encode(&digest[..4])
    }
}
