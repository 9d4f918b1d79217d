//! Adapter implementations
//!
//! Adapters implement the port traits with concrete technologies:
//! - DuckDB for the BalanceStore port
//! - In-process map for tests and demos, with a simulated outage switch
//! - Timeout decorator around any other store

pub mod duckdb;
pub mod memory;
pub mod timeout;
