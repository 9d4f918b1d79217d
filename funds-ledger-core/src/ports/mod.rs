//! Port definitions (hexagonal architecture)
//!
//! Ports define the interfaces for external dependencies. The offline ledger
//! depends only on these traits, not on concrete stores.

mod balance_store;

pub use balance_store::BalanceStore;
