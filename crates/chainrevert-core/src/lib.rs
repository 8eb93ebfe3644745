//! chainrevert-core: building blocks for a fork-aware relational index.
//!
//! # Architecture
//!
//! ```text
//! contract processors ──► ContractDbTransaction (chainrevert-storage)
//!                              ├── sql        (statement building)
//!                              ├── value      (typed column values, rows)
//!                              └── rollback   (inverse operations per block)
//! ```
//!
//! This crate has no database dependency; backends live in
//! `chainrevert-storage`.

pub mod config;
pub mod error;
pub mod rollback;
pub mod sql;
pub mod types;
pub mod value;

pub use config::TransactionConfig;
pub use error::DbError;
pub use rollback::{Condition, RollbackEntry, RollbackOperation, UndoAction};
pub use types::{AbiVersion, ActionTrace, ReaderPosition, ReversibleBlock};
pub use value::{diff_columns, row, Row, Value};
