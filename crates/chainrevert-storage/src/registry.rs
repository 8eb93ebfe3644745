//! Registry of transactions that still hold a connection.
//!
//! Owned by the application context and handed to every [`ContractDb`]
//! that should be covered by the same shutdown hook. On shutdown call
//! [`TransactionRegistry::abort_all`] so no connection goes back to its pool
//! in the middle of a transaction.
//!
//! [`ContractDb`]: crate::reader::ContractDb

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use chainrevert_core::error::DbError;

/// A transaction the registry can force to abort.
#[async_trait]
pub trait OpenTransaction: Send + Sync {
    fn reader(&self) -> &str;

    /// Roll back and release the connection. A no-op once finished.
    async fn force_abort(&self) -> Result<(), DbError>;
}

#[derive(Clone, Default)]
pub struct TransactionRegistry {
    open: Arc<Mutex<HashMap<u64, Arc<dyn OpenTransaction>>>>,
    next_id: Arc<AtomicU64>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self) -> MutexGuard<'_, HashMap<u64, Arc<dyn OpenTransaction>>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, id: u64, tx: Arc<dyn OpenTransaction>) {
        self.open().insert(id, tx);
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.open().remove(&id);
    }

    /// Number of transactions not yet committed or aborted.
    pub fn len(&self) -> usize {
        self.open().len()
    }

    pub fn is_empty(&self) -> bool {
        self.open().is_empty()
    }

    /// Readers that currently have an open transaction.
    pub fn open_readers(&self) -> Vec<String> {
        self.open().values().map(|tx| tx.reader().to_string()).collect()
    }

    /// Abort every open transaction. Returns how many were aborted.
    pub async fn abort_all(&self) -> usize {
        let open: Vec<_> = self.open().values().cloned().collect();
        if open.is_empty() {
            return 0;
        }

        info!(count = open.len(), "aborting open transactions");
        let results = join_all(open.iter().map(|tx| tx.force_abort())).await;

        let mut aborted = 0;
        for (tx, result) in open.iter().zip(results) {
            match result {
                Ok(()) => aborted += 1,
                Err(e) => warn!(reader = tx.reader(), error = %e, "abort failed"),
            }
        }
        aborted
    }
}
