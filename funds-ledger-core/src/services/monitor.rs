//! Background monitor - periodic report of the pending backlog

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::services::ledger::OfflineLedger;
use crate::services::logging::{events, EventRecorder, LogEvent};

/// Reports the size of the pending set on a fixed interval
///
/// Read-only with respect to the ledger. The event log only gets a
/// backlog entry when the backlog size changes.
pub struct PendingMonitor {
    ledger: Arc<OfflineLedger>,
    interval: Duration,
    events: Option<EventRecorder>,
    last_reported: AtomicUsize,
}

impl PendingMonitor {
    pub fn new(ledger: Arc<OfflineLedger>, interval: Duration) -> Self {
        Self {
            ledger,
            interval,
            events: None,
            last_reported: AtomicUsize::new(0),
        }
    }

    pub fn with_events(mut self, events: EventRecorder) -> Self {
        self.events = Some(events);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Emit one report and return the observed backlog size
    pub fn tick(&self) -> usize {
        let pending = self.ledger.pending_count();
        let previous = self.last_reported.swap(pending, Ordering::Relaxed);
        if pending > 0 {
            warn!(pending, "Users with offline transactions awaiting reconciliation");
            if pending != previous {
                if let Some(log) = &self.events {
                    log.record(LogEvent::new(events::PENDING_BACKLOG));
                }
            }
        } else {
            info!(pending, "No offline transactions pending");
        }
        pending
    }

    /// Tick until `shutdown` turns true or its sender is dropped
    ///
    /// The first report comes one full interval after start.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval_secs = self.interval.as_secs_f64(), "Pending monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Pending monitor stopped");
    }

    /// Run on the current tokio runtime
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::logging::LoggingService;
    use crate::services::TransactionEngine;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_tick_reports_backlog() {
        let ledger = Arc::new(OfflineLedger::new());
        let monitor = PendingMonitor::new(ledger.clone(), Duration::from_secs(5));
        assert_eq!(monitor.tick(), 0);

        ledger.register(1, "alice", "t").await;
        TransactionEngine::new(ledger.clone())
            .apply(1, Decimal::ONE)
            .await;
        assert_eq!(monitor.tick(), 1);
        assert_eq!(ledger.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_backlog_recorded_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(LoggingService::new(dir.path(), "test").unwrap());
        let (recorder, _writer) = EventRecorder::spawn(log.clone());
        let ledger = Arc::new(OfflineLedger::new());
        let monitor =
            PendingMonitor::new(ledger.clone(), Duration::from_secs(5)).with_events(recorder.clone());
        let engine = TransactionEngine::new(ledger.clone());

        ledger.register(1, "alice", "t").await;
        ledger.register(2, "bob", "t").await;
        engine.apply(1, Decimal::ONE).await;

        // a steady backlog is reported once
        for _ in 0..5 {
            assert_eq!(monitor.tick(), 1);
        }
        recorder.flush().await;
        assert_eq!(log.count().unwrap(), 1);

        engine.apply(2, Decimal::ONE).await;
        monitor.tick();
        monitor.tick();
        recorder.flush().await;
        assert_eq!(log.count().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let ledger = Arc::new(OfflineLedger::new());
        let (tx, rx) = watch::channel(false);
        let handle = PendingMonitor::new(ledger, Duration::from_secs(5)).spawn(rx);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!handle.is_finished());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_sender_dropped() {
        let ledger = Arc::new(OfflineLedger::new());
        let (tx, rx) = watch::channel(false);
        let handle = PendingMonitor::new(ledger, Duration::from_secs(5)).spawn(rx);

        drop(tx);
        handle.await.unwrap();
    }
}
