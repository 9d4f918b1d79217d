//! Integration tests for funds-ledger-core services
//!
//! Outages are simulated with the in-memory store's reachability switch and
//! with a real DuckDB store that is disconnected and reconnected.
//!
//! Run with: cargo test --test integration_tests -- --nocapture

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tempfile::TempDir;

use funds_ledger_core::adapters::memory::MemoryBalanceStore;
use funds_ledger_core::config::Config;
use funds_ledger_core::services::logging::events;
use funds_ledger_core::{
    BalanceStore, FundsContext, FundsOutcome, ReconcileOutcome, TransactionOutcome,
    OFFLINE_MESSAGE,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Context around a memory store pre-loaded with `balances`
fn memory_context(balances: &[(i64, &str)]) -> (FundsContext, Arc<MemoryBalanceStore>) {
    let store = Arc::new(MemoryBalanceStore::with_balances(
        balances.iter().map(|(id, b)| (*id, dec(b))),
    ));
    let ctx = FundsContext::with_store(Config::default(), store.clone());
    (ctx, store)
}

// ============================================================================
// Offline ledger scenarios
// ============================================================================

#[tokio::test]
async fn test_alice_offline_and_recovery() {
    let (ctx, store) = memory_context(&[(1, "100")]);
    ctx.funds_service.login(1, "alice", "token").await.unwrap();
    assert_eq!(ctx.ledger.cached_balance(1).await.unwrap(), dec("100.00"));

    store.set_reachable(false);

    assert_eq!(
        ctx.engine.apply(1, dec("-30")).await,
        TransactionOutcome::Applied(dec("70.00"))
    );
    assert_eq!(
        ctx.engine.apply(1, dec("-80")).await,
        TransactionOutcome::InsufficientFunds {
            balance: dec("70.00"),
            delta: dec("-80.00"),
        }
    );
    assert!(ctx.ledger.is_pending("alice"));

    store.set_reachable(true);
    assert_eq!(store.peek(1), Some(dec("100.00")));

    let outcome = ctx.reconciler.reconcile(1).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Replayed {
            delta: dec("-30.00"),
            balance: dec("70.00"),
        }
    );
    assert_eq!(store.peek(1), Some(dec("70.00")));
    assert!(!ctx.ledger.is_pending("alice"));
}

#[tokio::test]
async fn test_reconcile_twice_is_idempotent() {
    let (ctx, store) = memory_context(&[(1, "100")]);
    ctx.funds_service.login(1, "alice", "token").await.unwrap();

    store.set_reachable(false);
    ctx.engine.apply(1, dec("12.5")).await;
    store.set_reachable(true);

    let first = ctx.reconciler.reconcile(1).await.unwrap();
    assert!(first.cleared());
    let writes = store.write_count();

    let second = ctx.reconciler.reconcile(1).await.unwrap();
    assert_eq!(second, ReconcileOutcome::NotPending);
    assert_eq!(store.write_count(), writes);
    assert_eq!(store.peek(1), Some(dec("112.50")));
    assert_eq!(ctx.ledger.cached_balance(1).await.unwrap(), dec("112.50"));
}

#[tokio::test]
async fn test_unknown_user_cannot_transact_offline() {
    let (ctx, store) = memory_context(&[(2, "50")]);
    store.set_reachable(false);

    assert_eq!(
        ctx.engine.apply(2, dec("-1")).await,
        TransactionOutcome::UserUnavailable
    );
    assert_eq!(
        ctx.funds_service.transact(2, dec("-1")).await.unwrap(),
        FundsOutcome::UserUnavailable
    );
    assert_eq!(ctx.ledger.pending_count(), 0);
}

#[tokio::test]
async fn test_funds_service_flushes_before_next_request() {
    let (ctx, store) = memory_context(&[(1, "100"), (2, "20")]);
    ctx.funds_service.login(1, "alice", "a").await.unwrap();
    ctx.funds_service.login(2, "bob", "b").await.unwrap();

    store.set_reachable(false);
    let offline = ctx.funds_service.transact(1, dec("-10")).await.unwrap();
    assert_eq!(
        offline,
        FundsOutcome::Offline {
            balance: dec("90.00"),
            message: OFFLINE_MESSAGE.to_string(),
        }
    );
    ctx.funds_service.transact(2, dec("5")).await.unwrap();
    assert_eq!(ctx.ledger.pending_usernames(), vec!["alice", "bob"]);

    store.set_reachable(true);
    // a read for alice flushes alice only
    assert_eq!(
        ctx.funds_service.balance(1).await.unwrap(),
        FundsOutcome::Online { balance: dec("90.00") }
    );
    assert_eq!(ctx.ledger.pending_usernames(), vec!["bob"]);

    let results = ctx.reconciler.reconcile_all().await;
    assert_eq!(results.len(), 1);
    assert_eq!(store.peek(2), Some(dec("25.00")));
    assert_eq!(ctx.ledger.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_store_is_treated_as_offline() {
    let (ctx, store) = memory_context(&[(1, "40")]);
    ctx.funds_service.login(1, "alice", "token").await.unwrap();

    store.set_delay(Duration::from_secs(60));
    let outcome = ctx.funds_service.transact(1, dec("-15")).await.unwrap();
    assert_eq!(outcome, FundsOutcome::offline(dec("25.00")));

    store.set_delay(Duration::ZERO);
    let outcome = ctx.funds_service.balance(1).await.unwrap();
    assert_eq!(outcome, FundsOutcome::Online { balance: dec("25.00") });
    assert_eq!(store.peek(1), Some(dec("25.00")));
}

#[tokio::test]
async fn test_mirror_keeps_offline_baseline_correct() {
    let (ctx, store) = memory_context(&[(1, "10")]);
    ctx.funds_service.login(1, "alice", "token").await.unwrap();

    // durable balance changes through another path while online
    store.set_balance(1, dec("60")).await.unwrap();
    ctx.funds_service.balance(1).await.unwrap();

    store.set_reachable(false);
    assert_eq!(
        ctx.funds_service.transact(1, dec("-50")).await.unwrap(),
        FundsOutcome::offline(dec("10.00"))
    );
}

// ============================================================================
// DuckDB-backed context
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duckdb_context_offline_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = FundsContext::new(temp_dir.path()).unwrap();
    let durable = ctx.durable.clone().unwrap();

    ctx.funds_service.login(1, "alice", "token").await.unwrap();
    assert_eq!(
        ctx.funds_service.transact(1, dec("100")).await.unwrap(),
        FundsOutcome::Online { balance: dec("100.00") }
    );

    durable.disconnect();
    assert!(ctx.store.get_balance(1).await.unwrap_err().is_unreachable());
    assert_eq!(
        ctx.funds_service.transact(1, dec("-30")).await.unwrap(),
        FundsOutcome::offline(dec("70.00"))
    );
    assert_eq!(
        ctx.funds_service.transact(1, dec("-80")).await.unwrap(),
        FundsOutcome::OfflineRejected {
            balance: dec("70.00"),
            delta: dec("-80.00"),
        }
    );

    durable.reconnect().unwrap();
    assert_eq!(
        ctx.reconciler.reconcile(1).await.unwrap(),
        ReconcileOutcome::Replayed {
            delta: dec("-30.00"),
            balance: dec("70.00"),
        }
    );
    assert_eq!(durable.get_balance(1).await.unwrap(), Some(dec("70.00")));

    ctx.flush_events().await;
    let log = ctx.logging_service.as_ref().unwrap();
    let names: Vec<String> = log
        .get_recent(50)
        .unwrap()
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert!(names.iter().any(|n| n == events::OFFLINE_TRANSACTION_APPLIED));
    assert!(names.iter().any(|n| n == events::OFFLINE_TRANSACTION_REJECTED));
    assert!(names.iter().any(|n| n == events::RECONCILIATION_REPLAYED));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duckdb_context_respects_settings() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(
        temp_dir.path().join("settings.json"),
        r#"{"database": "ledger.duckdb", "eventLog": false}"#,
    )
    .unwrap();

    let ctx = FundsContext::new(temp_dir.path()).unwrap();
    assert!(ctx.logging_service.is_none());
    assert!(temp_dir.path().join("ledger.duckdb").exists());
    assert!(!temp_dir.path().join("logs.duckdb").exists());
}

#[test]
fn test_duckdb_context_needs_runtime_for_event_log() {
    let temp_dir = TempDir::new().unwrap();
    assert!(FundsContext::new(temp_dir.path()).is_err());

    std::fs::write(temp_dir.path().join("settings.json"), r#"{"eventLog": false}"#).unwrap();
    assert!(FundsContext::new(temp_dir.path()).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duckdb_context_overflow_is_rejected_offline() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = FundsContext::new(temp_dir.path()).unwrap();
    let durable = ctx.durable.clone().unwrap();

    ctx.funds_service.login(1, "alice", "token").await.unwrap();
    durable.disconnect();

    let huge = Decimal::MAX / Decimal::TWO;
    for _ in 0..3 {
        assert!(matches!(
            ctx.funds_service.transact(1, huge).await.unwrap(),
            FundsOutcome::OfflineRejected { .. }
        ));
    }
    assert!(!ctx.ledger.is_pending("alice"));
}

#[tokio::test(start_paused = true)]
async fn test_context_monitor_runs_until_shutdown() {
    let (ctx, _store) = memory_context(&[]);
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = ctx.spawn_monitor(rx);

    tokio::time::sleep(ctx.config.pool_interval * 3).await;
    assert!(!handle.is_finished());

    tx.send(true).unwrap();
    handle.await.unwrap();
}
