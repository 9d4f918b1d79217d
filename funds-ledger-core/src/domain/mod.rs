//! Core domain entities
//!
//! Pure data structures and arithmetic - no I/O or locking.

mod account;
pub mod money;
pub mod outcome;
pub mod result;
mod user;

pub use account::CachedAccount;
pub use outcome::{FundsOutcome, ReconcileOutcome, TransactionOutcome, OFFLINE_MESSAGE};
pub use user::UserIdentity;
