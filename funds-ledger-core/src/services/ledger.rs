//! Offline ledger - identity registry, cached balances and the pending set
//!
//! One instance is shared (behind an `Arc`) by every component for the life
//! of the process. State is keyed by username; each cached account carries
//! its own async mutex, so work for different users never serializes and
//! a reconciliation can hold one user's lock across durable-store I/O.

use std::sync::{Arc, Mutex as StdMutex};

use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::domain::result::{Error, Result};
use crate::domain::{CachedAccount, UserIdentity};

/// What a login did to the identity registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// New user; a zero-balance cached account was created
    Created,
    /// Known user; only the token was refreshed
    Refreshed,
    /// The user id or the username is already paired with someone else;
    /// nothing changed
    Conflict,
}

/// Process-wide in-memory fallback ledger
#[derive(Debug, Default)]
pub struct OfflineLedger {
    /// username -> user_id
    user_ids: DashMap<String, i64>,
    /// user_id -> username
    usernames: DashMap<i64, String>,
    accounts: DashMap<String, Arc<Mutex<CachedAccount>>>,
    /// Usernames with offline transactions not yet written to the durable store
    pending: DashSet<String>,
    /// Serializes registry updates so both maps change together
    registry: StdMutex<()>,
}

impl OfflineLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // === Identity registry ===

    /// Record a successful login
    ///
    /// Creates a zero-balance cached account for a new username; for a known
    /// username only the token is refreshed. The first `user_id <-> username`
    /// pairing wins: a login that would re-pair either side is refused, so a
    /// user can never reach another user's cached balance or strand a
    /// pending account.
    pub async fn register(&self, user_id: i64, username: &str, token: &str) -> Registration {
        if !self.link(user_id, username) {
            return Registration::Conflict;
        }

        let existing = match self.accounts.entry(username.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Arc::clone(entry.get()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(CachedAccount::new(username, token))));
                info!(user_id, username, "Added user to offline ledger");
                return Registration::Created;
            }
        };

        let mut account = existing.lock().await;
        account.refresh_token(token);
        debug!(
            user_id,
            username,
            token = %account.token_fingerprint(),
            "Refreshed offline ledger token"
        );
        Registration::Refreshed
    }

    /// Pair `user_id` with `username`; false if either is paired elsewhere
    fn link(&self, user_id: i64, username: &str) -> bool {
        let _registry = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let known_name = self.usernames.get(&user_id).map(|name| name.clone());
        let known_id = self.user_ids.get(username).map(|id| *id);

        match (known_name, known_id) {
            (Some(name), Some(id)) if name == username && id == user_id => true,
            (None, None) => {
                self.usernames.insert(user_id, username.to_string());
                self.user_ids.insert(username.to_string(), user_id);
                true
            }
            (known_name, known_id) => {
                warn!(
                    user_id,
                    username,
                    known_name = ?known_name,
                    known_id = ?known_id,
                    "Refusing login that would re-pair an offline identity"
                );
                false
            }
        }
    }

    pub fn username(&self, user_id: i64) -> Option<String> {
        self.usernames.get(&user_id).map(|name| name.clone())
    }

    pub fn user_id(&self, username: &str) -> Option<i64> {
        self.user_ids.get(username).map(|id| *id)
    }

    pub fn identity(&self, user_id: i64) -> Option<UserIdentity> {
        self.username(user_id)
            .map(|username| UserIdentity::new(user_id, username))
    }

    /// Number of distinct users registered since start
    pub fn registered_count(&self) -> usize {
        self.usernames.len()
    }

    // === Cached accounts ===

    fn account(&self, user_id: i64) -> Option<(String, Arc<Mutex<CachedAccount>>)> {
        let username = self.username(user_id)?;
        let account = self.accounts.get(&username).map(|a| Arc::clone(a.value()))?;
        Some((username, account))
    }

    /// Lock one user's cached account
    ///
    /// `None` if the user never registered. Pending-set changes go through the
    /// returned guard so they always happen under the account lock.
    pub(crate) async fn lock(&self, user_id: i64) -> Option<AccountGuard<'_>> {
        let (username, account) = self.account(user_id)?;
        let account = account.lock_owned().await;
        Some(AccountGuard {
            ledger: self,
            user_id,
            username,
            account,
        })
    }

    /// Overwrite a cached balance with a trusted durable value
    ///
    /// Ignored (with a diagnostic) for users that never registered, and for
    /// users with pending offline transactions, whose cached balance is the
    /// only record of those transactions until reconciliation. Returns true
    /// if the cache was updated.
    pub async fn mirror_balance(&self, user_id: i64, balance: Decimal) -> bool {
        let Some(mut guard) = self.lock(user_id).await else {
            warn!(
                user_id,
                "User not available for offline processing: not authenticated during this run"
            );
            return false;
        };
        if guard.is_pending() {
            debug!(user_id, "Skipping mirror for user with pending offline transactions");
            return false;
        }
        guard.mirror(balance);
        true
    }

    /// Cached balance of a registered user
    pub async fn cached_balance(&self, user_id: i64) -> Result<Decimal> {
        let (_, account) = self
            .account(user_id)
            .ok_or(Error::UserUnavailable(user_id))?;
        let balance = account.lock().await.balance;
        Ok(balance)
    }

    /// Copy of the cached account
    pub async fn snapshot(&self, user_id: i64) -> Option<CachedAccount> {
        let (_, account) = self.account(user_id)?;
        let snapshot = account.lock().await.clone();
        Some(snapshot)
    }

    /// Last token seen for a username
    pub async fn token(&self, username: &str) -> Option<String> {
        let account = self.accounts.get(username).map(|a| Arc::clone(a.value()))?;
        let token = account.lock().await.token.clone();
        Some(token)
    }

    // === Pending set ===

    pub fn is_pending(&self, username: &str) -> bool {
        self.pending.contains(username)
    }

    /// Number of users awaiting reconciliation
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Point-in-time copy of the pending set
    pub fn pending_usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending.iter().map(|name| name.clone()).collect();
        names.sort();
        names
    }
}

/// Exclusive access to one user's cached account
pub(crate) struct AccountGuard<'a> {
    ledger: &'a OfflineLedger,
    user_id: i64,
    username: String,
    account: OwnedMutexGuard<CachedAccount>,
}

impl AccountGuard<'_> {
    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn balance(&self) -> Decimal {
        self.account.balance
    }

    pub fn set_balance(&mut self, balance: Decimal) {
        self.account.set_balance(balance);
    }

    pub fn mirror(&mut self, balance: Decimal) {
        self.account.mirror(balance);
    }

    pub fn is_pending(&self) -> bool {
        self.ledger.pending.contains(&self.username)
    }

    /// Returns true if the user was not already pending
    pub fn mark_pending(&mut self) -> bool {
        self.ledger.pending.insert(self.username.clone())
    }

    /// Returns true if the user was pending
    pub fn clear_pending(&mut self) -> bool {
        self.ledger.pending.remove(&self.username).is_some()
    }
}
