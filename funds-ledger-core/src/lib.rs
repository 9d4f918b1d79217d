//! Funds Ledger Core - offline-resilient funds transactions
//!
//! This crate implements the offline fallback of a funds API following
//! hexagonal architecture:
//!
//! - **domain**: Core entities and outcomes (CachedAccount, TransactionOutcome, etc.)
//! - **ports**: Trait definitions for external dependencies (BalanceStore)
//! - **services**: Offline ledger, transaction engine, reconciler, monitor
//! - **adapters**: Concrete stores (DuckDB, in-memory, timeout decorator)
//!
//! While the durable store answers, requests go to it and the cached
//! balances follow along. When it stops answering, registered users keep
//! transacting against the cached balance; the first request after recovery
//! folds the offline deltas back into the durable store.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod log_migrations;
pub mod migrations;
pub mod ports;
pub mod services;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use adapters::duckdb::DuckDbBalanceStore;
use adapters::timeout::TimeoutBalanceStore;
use config::Config;
use services::*;

// Re-export commonly used types at crate root
pub use domain::result::Error;
pub use domain::{
    CachedAccount, FundsOutcome, ReconcileOutcome, TransactionOutcome, UserIdentity,
    OFFLINE_MESSAGE,
};
pub use ports::BalanceStore;

/// Main context for funds operations
///
/// Builds the single shared [`OfflineLedger`] and hands it to every
/// component that needs it.
pub struct FundsContext {
    pub config: Config,
    pub ledger: Arc<OfflineLedger>,
    /// Durable store as seen by the services (timeout-bounded)
    pub store: Arc<dyn BalanceStore>,
    /// Direct handle on the DuckDB store, for disconnect/reconnect
    pub durable: Option<DuckDbBalanceStore>,
    pub engine: Arc<TransactionEngine>,
    pub reconciler: Arc<Reconciler>,
    pub funds_service: FundsService,
    pub logging_service: Option<Arc<LoggingService>>,
    /// Queue into the event log; `None` when the event log is disabled
    pub events: Option<EventRecorder>,
}

impl FundsContext {
    /// Create a context backed by a DuckDB file in `data_dir`
    ///
    /// Must be called inside a tokio runtime when the event log is enabled.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let config = Config::load(data_dir)?;
        init_tracing(&config.logging);

        let db_path = data_dir.join(&config.database);
        let durable = DuckDbBalanceStore::new(&db_path)?;
        durable.ensure_schema()?;

        let logging = if config.logging.event_log {
            tokio::runtime::Handle::try_current()
                .context("The event log writer needs a tokio runtime")?;
            let log = Arc::new(LoggingService::new(data_dir, env!("CARGO_PKG_VERSION"))?);
            // the writer drains the queue and exits once every recorder is dropped
            let (recorder, _writer) = EventRecorder::spawn(Arc::clone(&log));
            Some((log, recorder))
        } else {
            None
        };

        info!(path = %db_path.display(), "Opened durable balance store");

        let mut context = Self::assemble(config, Arc::new(durable.clone()), logging);
        context.durable = Some(durable);
        Ok(context)
    }

    /// Create a context around any balance store, without an event log
    pub fn with_store(config: Config, store: Arc<dyn BalanceStore>) -> Self {
        Self::assemble(config, store, None)
    }

    fn assemble(
        config: Config,
        store: Arc<dyn BalanceStore>,
        logging: Option<(Arc<LoggingService>, EventRecorder)>,
    ) -> Self {
        let (logging_service, events) = logging.unzip();
        let store: Arc<dyn BalanceStore> =
            Arc::new(TimeoutBalanceStore::new(store, config.durable_timeout));
        let ledger = Arc::new(OfflineLedger::new());

        let mut engine = TransactionEngine::new(Arc::clone(&ledger));
        let mut reconciler = Reconciler::new(Arc::clone(&ledger), Arc::clone(&store));
        if let Some(recorder) = &events {
            engine = engine.with_events(recorder.clone());
            reconciler = reconciler.with_events(recorder.clone());
        }
        let engine = Arc::new(engine);
        let reconciler = Arc::new(reconciler);

        let funds_service = FundsService::new(
            Arc::clone(&ledger),
            Arc::clone(&store),
            Arc::clone(&engine),
            Arc::clone(&reconciler),
        );

        Self {
            config,
            ledger,
            store,
            durable: None,
            engine,
            reconciler,
            funds_service,
            logging_service,
            events,
        }
    }

    /// Start the background pending monitor on the current runtime
    pub fn spawn_monitor(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut monitor = PendingMonitor::new(Arc::clone(&self.ledger), self.config.pool_interval);
        if let Some(recorder) = &self.events {
            monitor = monitor.with_events(recorder.clone());
        }
        monitor.spawn(shutdown)
    }

    /// Wait until every queued event has reached the event log
    pub async fn flush_events(&self) {
        if let Some(recorder) = &self.events {
            recorder.flush().await;
        }
    }
}
