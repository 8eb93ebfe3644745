//! chainrevert-storage: reversible block transactions on a relational store.
//!
//! ```text
//! ContractDb (one per reader)
//!   └── start_transaction(current_block) → ContractDbTransaction
//!          ├── insert / update / delete / replace / query
//!          ├── rollback log        (inverse of every reversible write)
//!          └── fork replay         (rollback_reversible_blocks, clear_fork_database)
//! ```
//!
//! Backends:
//! - [`sqlite`]: SQLite via `sqlx` (default feature)
//! - `postgres`: PostgreSQL via `sqlx` (feature `postgres`)

pub mod connection;
pub mod reader;
pub mod registry;
mod replay;
pub mod schema;
pub mod transaction;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use connection::{ConnectionSource, SqlConnection};
pub use reader::ContractDb;
pub use registry::{OpenTransaction, TransactionRegistry};
pub use transaction::{ContractDbTransaction, TxState};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
