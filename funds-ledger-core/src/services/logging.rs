//! Logging - tracing setup and the structured event log
//!
//! Two sinks:
//! - `tracing` diagnostics, installed once per process by [`init_tracing`]
//! - [`LoggingService`], a privacy-safe event log in `logs.duckdb` recording
//!   offline-subsystem events (offline writes, reconciliation results)
//!
//! Request paths never write to the database themselves: they hand events to
//! an [`EventRecorder`], whose writer task does the inserts on the blocking
//! pool.
//!
//! The event log never stores usernames, tokens or balances: only the event
//! name, the numeric user id, the transaction amount and error text.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use duckdb::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::domain::result::{Error, Result};
use crate::log_migrations::LOG_MIGRATIONS;
use crate::services::MigrationService;

/// Install the global fmt subscriber
///
/// `RUST_LOG` wins over the configured level. Calling this more than once
/// (or after another subscriber was installed) is harmless.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.effective_level()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Counter for generating unique IDs within the same millisecond
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique ID based on timestamp + counter
fn generate_id() -> u64 {
    let timestamp = now_ms() as u64;
    // Lower 16 bits: counter (65536 unique IDs per millisecond)
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
    (timestamp << 16) | counter
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn detect_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "unknown"
    }
}

/// Well-known event names
pub mod events {
    pub const OFFLINE_TRANSACTION_APPLIED: &str = "offline_transaction_applied";
    pub const OFFLINE_TRANSACTION_REJECTED: &str = "offline_transaction_rejected";
    pub const RECONCILIATION_REPLAYED: &str = "reconciliation_replayed";
    pub const RECONCILIATION_FAILED: &str = "reconciliation_failed";
    pub const PENDING_BACKLOG: &str = "pending_backlog";
}

/// A log event to be recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl LogEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            user_id: None,
            amount: None,
            error_message: None,
        }
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// A log entry as stored in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: i64,
    pub app_version: String,
    pub platform: String,
    pub event: String,
    pub user_id: Option<i64>,
    pub amount: Option<Decimal>,
    pub error_message: Option<String>,
}

/// Structured event log stored in `logs.duckdb`
pub struct LoggingService {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    app_version: String,
    platform: &'static str,
}

impl LoggingService {
    /// Open or create `logs.duckdb` in `data_dir` and run pending migrations
    pub fn new(data_dir: &Path, app_version: impl Into<String>) -> Result<Self> {
        let db_path = data_dir.join("logs.duckdb");
        let conn = Connection::open(&db_path)?;
        MigrationService::with_migrations(&conn, LOG_MIGRATIONS).run_pending()?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            app_version: app_version.into(),
            platform: detect_platform(),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::database(format!("Lock poisoned: {}", e)))
    }

    /// Log an event
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO sys_logs (
                id, timestamp, app_version, platform, event, user_id, amount, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            duckdb::params![
                generate_id(),
                now_ms(),
                &self.app_version,
                self.platform,
                &event.event,
                event.user_id,
                event.amount.map(|a| a.to_string()),
                &event.error_message,
            ],
        )?;
        Ok(())
    }

    /// Log an event, swallowing sink failures
    ///
    /// Called by the [`EventRecorder`] writer task; a broken event log must
    /// never fail a request.
    pub fn record(&self, event: LogEvent) {
        let name = event.event.clone();
        if let Err(e) = self.log(event) {
            debug!(event = %name, error = %e, "Failed to write event log entry");
        }
    }

    /// Log a simple event with just a name
    pub fn log_event(&self, event: &str) -> Result<()> {
        self.log(LogEvent::new(event))
    }

    /// Most recent entries, newest first
    pub fn get_recent(&self, limit: usize) -> Result<Vec<LogEntry>> {
        self.query_entries("", limit)
    }

    /// Most recent entries carrying an error, newest first
    pub fn get_errors(&self, limit: usize) -> Result<Vec<LogEntry>> {
        self.query_entries("WHERE error_message IS NOT NULL", limit)
    }

    fn query_entries(&self, filter: &str, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT id, timestamp, app_version, platform, event, user_id, amount, error_message
             FROM sys_logs {} ORDER BY timestamp DESC, id DESC LIMIT ?",
            filter
        );
        let mut stmt = conn.prepare(&sql)?;

        let entries = stmt
            .query_map([limit as i64], |row| {
                let amount: Option<String> = row.get(6)?;
                Ok(LogEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    app_version: row.get(2)?,
                    platform: row.get(3)?,
                    event: row.get(4)?,
                    user_id: row.get(5)?,
                    amount: amount.and_then(|a| a.parse().ok()),
                    error_message: row.get(7)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(entries)
    }

    /// Total number of log entries
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM sys_logs", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Delete entries older than `timestamp_ms` (unix ms)
    pub fn delete_before(&self, timestamp_ms: i64) -> Result<u64> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM sys_logs WHERE timestamp < ?", [timestamp_ms])?;
        Ok(deleted as u64)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

/// Events queued beyond this are dropped
const EVENT_QUEUE_CAPACITY: usize = 1024;

enum Command {
    Record(LogEvent),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking handle for writing to a [`LoggingService`]
///
/// `record` never waits: events go through a bounded channel to a single
/// writer task. A full queue or a stopped writer drops the event.
#[derive(Clone)]
pub struct EventRecorder {
    tx: mpsc::Sender<Command>,
}

impl EventRecorder {
    /// Start the writer task on the current tokio runtime
    ///
    /// The task ends once every recorder clone is dropped.
    pub fn spawn(log: Arc<LoggingService>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let handle = tokio::spawn(write_events(log, rx));
        (Self { tx }, handle)
    }

    pub fn record(&self, event: LogEvent) {
        if let Err(e) = self.tx.try_send(Command::Record(event)) {
            let (reason, event) = match e {
                mpsc::error::TrySendError::Full(Command::Record(ev)) => ("queue full", ev.event),
                mpsc::error::TrySendError::Closed(Command::Record(ev)) => ("writer stopped", ev.event),
                _ => return,
            };
            debug!(event = %event, reason, "Dropped event log entry");
        }
    }

    /// Wait until every event recorded so far has been written
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

async fn write_events(log: Arc<LoggingService>, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(event) => {
                let log = Arc::clone(&log);
                if let Err(e) = tokio::task::spawn_blocking(move || log.record(event)).await {
                    debug!(error = %e, "Event log writer task failed");
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
