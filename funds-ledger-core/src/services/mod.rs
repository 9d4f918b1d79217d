//! Service layer - business logic orchestration
//!
//! Services coordinate domain logic and port interactions. The offline
//! subsystem is built leaf-first: the ledger is shared state, the engine and
//! reconciler operate on it, the funds service ties them to the durable store
//! and the monitor watches the pending backlog.

pub mod engine;
pub mod funds;
pub mod ledger;
pub mod logging;
pub mod migration;
pub mod monitor;
pub mod reconcile;

pub use engine::TransactionEngine;
pub use funds::FundsService;
pub use ledger::{OfflineLedger, Registration};
pub use logging::{init_tracing, EventRecorder, LogEntry, LogEvent, LoggingService};
pub use migration::{MigrationResult, MigrationService};
pub use monitor::PendingMonitor;
pub use reconcile::Reconciler;
