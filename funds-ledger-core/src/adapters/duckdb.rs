//! DuckDB balance store implementation

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use duckdb::{params, Connection};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::domain::money::{checked_apply, round_currency, MAX_BALANCE};
use crate::domain::result::{Error, Result};
use crate::ports::BalanceStore;
use crate::services::{MigrationResult, MigrationService};

/// Maximum number of retries when database file is locked
const MAX_RETRIES: u32 = 5;

/// Initial retry delay in milliseconds (doubles each retry: 50, 100, 200, 400, 800ms)
const INITIAL_RETRY_DELAY_MS: u64 = 50;

/// Check if an error message indicates a file locking issue that should be retried
fn is_retryable_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    // Windows error messages
    lower.contains("being used by another process")
        || lower.contains("cannot access the file")
        // Unix/macOS error messages
        || lower.contains("resource temporarily unavailable")
        || lower.contains("database is locked")
        || lower.contains("file is already open")
}

/// Check if a statement error means the database itself went away
/// (as opposed to a bad query or constraint violation)
fn is_connection_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    is_retryable_error(&lower)
        || lower.contains("io error")
        || lower.contains("no such file")
        || lower.contains("connection")
        || lower.contains("database has been invalidated")
}

/// DuckDB-backed durable balance store
///
/// Cheap to clone; clones share one connection. Calls run on tokio's
/// blocking pool so they never stall the async scheduler.
#[derive(Clone)]
pub struct DuckDbBalanceStore {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Option<Connection>>,
    db_path: PathBuf,
    /// Set by `disconnect()`; every call fails with `Unreachable` until `reconnect()`
    offline: AtomicBool,
}

impl DuckDbBalanceStore {
    /// Open (or create) the database file
    ///
    /// Includes retry logic with exponential backoff for file locking errors,
    /// which can occur when another process holds the database briefly.
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Self::open_with_retry(db_path)?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(Some(conn)),
                db_path: db_path.to_path_buf(),
                offline: AtomicBool::new(false),
            }),
        })
    }

    fn open_with_retry(db_path: &Path) -> Result<Connection> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match Self::try_open_connection(db_path) {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    let err_msg = e.to_string();
                    if is_retryable_error(&err_msg) && attempt < MAX_RETRIES - 1 {
                        let delay =
                            Duration::from_millis(INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt));
                        warn!(
                            attempt = attempt + 1,
                            max_retries = MAX_RETRIES,
                            delay_ms = delay.as_millis() as u64,
                            error = %err_msg,
                            "Database busy, retrying"
                        );
                        thread::sleep(delay);
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::unreachable(format!("Failed to open database after {} retries", MAX_RETRIES))
        }))
    }

    /// Attempt to open a database connection
    fn try_open_connection(db_path: &Path) -> Result<Connection> {
        // Extension autoloading is disabled; nothing here needs extensions
        let config = duckdb::Config::default()
            .enable_autoload_extension(false)
            .map_err(|e| Error::database(e.to_string()))?;
        Connection::open_with_flags(db_path, config).map_err(|e| Error::unreachable(e.to_string()))
    }

    /// Run pending schema migrations
    pub fn run_migrations(&self) -> Result<MigrationResult> {
        self.inner.with_conn(|conn| MigrationService::new(conn).run_pending())
    }

    /// Ensure database schema exists (runs pending migrations)
    pub fn ensure_schema(&self) -> Result<()> {
        self.run_migrations()?;
        Ok(())
    }

    /// Drop the connection and refuse calls until [`reconnect`](Self::reconnect)
    ///
    /// Used by operators (maintenance windows) and tests to take the store offline.
    pub fn disconnect(&self) {
        self.inner.offline.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.inner.conn.lock() {
            guard.take();
        }
        debug!(path = %self.inner.db_path.display(), "Durable store disconnected");
    }

    /// Reopen the connection after [`disconnect`](Self::disconnect)
    pub fn reconnect(&self) -> Result<()> {
        let conn = Self::open_with_retry(&self.inner.db_path)?;
        *self.inner.lock()? = Some(conn);
        self.inner.offline.store(false, Ordering::SeqCst);
        debug!(path = %self.inner.db_path.display(), "Durable store reconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.offline.load(Ordering::SeqCst)
    }

    pub fn db_path(&self) -> &Path {
        &self.inner.db_path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| Error::database(format!("Blocking task failed: {}", e)))?
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|e| Error::database(format!("Lock poisoned: {}", e)))
    }

    /// Run `f` against the live connection, reopening it if a previous
    /// failure dropped it. Connection-level failures surface as `Unreachable`.
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::unreachable("durable store is disconnected"));
        }

        let mut guard = self.lock()?;
        if guard.is_none() {
            *guard = Some(DuckDbBalanceStore::try_open_connection(&self.db_path)?);
        }
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => return Err(Error::unreachable("no connection")),
        };

        match f(conn) {
            Err(Error::Database(msg)) if is_connection_error(&msg) => {
                warn!(error = %msg, "Durable store connection lost");
                guard.take();
                Err(Error::Unreachable(msg))
            }
            other => other,
        }
    }

    fn read_balance(conn: &Connection, user_id: i64) -> Result<Option<Decimal>> {
        let mut stmt = conn.prepare("SELECT value::VARCHAR FROM balances WHERE user_id = ?")?;
        let value: Option<String> = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))?
            .next()
            .transpose()?;

        value
            .map(|v| {
                v.parse::<Decimal>()
                    .map_err(|e| Error::database(format!("Invalid balance '{}': {}", v, e)))
            })
            .transpose()
    }

    fn insert_balance(conn: &Connection, user_id: i64, value: Decimal) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO balances (user_id, value, created_at)
             VALUES (?, CAST(? AS DECIMAL(18,2)), current_timestamp)",
            params![user_id, value.to_string()],
        )?;
        Ok(())
    }

    fn update_balance(conn: &Connection, user_id: i64, value: Decimal) -> Result<()> {
        conn.execute(
            "UPDATE balances SET value = CAST(? AS DECIMAL(18,2)), updated_at = current_timestamp
             WHERE user_id = ?",
            params![value.to_string(), user_id],
        )?;
        Ok(())
    }

    fn get_balance(&self, user_id: i64) -> Result<Option<Decimal>> {
        self.with_conn(|conn| Self::read_balance(conn, user_id))
    }

    fn create_balance(&self, user_id: i64) -> Result<Decimal> {
        self.with_conn(|conn| {
            Self::insert_balance(conn, user_id, round_currency(Decimal::ZERO))?;
            Self::read_balance(conn, user_id)?
                .ok_or_else(|| Error::not_found(format!("Balance for user #{}", user_id)))
        })
    }

    fn set_balance(&self, user_id: i64, value: Decimal) -> Result<Decimal> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(Error::validation(format!(
                "Negative balance {} for user #{}",
                value, user_id
            )));
        }
        let value = round_currency(value);
        if value > MAX_BALANCE {
            return Err(Error::validation(format!(
                "Balance {} for user #{} exceeds the largest storable balance",
                value, user_id
            )));
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if Self::read_balance(&tx, user_id)?.is_some() {
                Self::update_balance(&tx, user_id, value)?;
            } else {
                Self::insert_balance(&tx, user_id, value)?;
            }
            tx.commit()?;
            Ok(value)
        })
    }

    fn apply_transaction(&self, user_id: i64, delta: Decimal) -> Result<Decimal> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let existing = Self::read_balance(&tx, user_id)?;
            let current = existing.unwrap_or_else(|| round_currency(Decimal::ZERO));

            // Dropping `tx` without commit rolls back
            let next = checked_apply(current, delta)
                .map_err(|rejection| rejection.into_error(current, delta))?;

            if existing.is_some() {
                Self::update_balance(&tx, user_id, next)?;
            } else {
                Self::insert_balance(&tx, user_id, next)?;
            }
            tx.commit()?;
            Ok(next)
        })
    }
}

#[async_trait]
impl BalanceStore for DuckDbBalanceStore {
    async fn get_balance(&self, user_id: i64) -> Result<Option<Decimal>> {
        self.blocking(move |inner| inner.get_balance(user_id)).await
    }

    async fn create_balance(&self, user_id: i64) -> Result<Decimal> {
        self.blocking(move |inner| inner.create_balance(user_id)).await
    }

    async fn set_balance(&self, user_id: i64, value: Decimal) -> Result<Decimal> {
        self.blocking(move |inner| inner.set_balance(user_id, value)).await
    }

    async fn apply_transaction(&self, user_id: i64, delta: Decimal) -> Result<Decimal> {
        self.blocking(move |inner| inner.apply_transaction(user_id, delta))
            .await
    }
}
