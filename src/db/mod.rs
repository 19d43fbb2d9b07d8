//! History store: SQLite-backed, append-only record of executed actions.
//!
//! The exchange is the source of truth; a failed insert here is logged by
//! callers and never blocks execution.

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::HistoryStore;
