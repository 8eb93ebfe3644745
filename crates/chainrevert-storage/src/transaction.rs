//! Block transactions with rollback logging.
//!
//! A [`ContractDbTransaction`] owns one pooled connection for its whole life
//! and applies the writes of one block. When it is bound to a block number,
//! every reversible mutation also appends its inverse to the rollback log in
//! the same database transaction:
//!
//! ```text
//! insert  rows          →  delete  by primary key, one entry per row
//! update  values        →  update  back to the prior values of changed columns
//! delete  condition     →  insert  of the complete rows that were removed
//! ```
//!
//! Statements on one transaction never interleave: every public method holds
//! the transaction's lock for its whole duration, and composite operations
//! (`replace`, fork replay) call the primitives with the lock already held.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use chainrevert_core::config::TransactionConfig;
use chainrevert_core::error::DbError;
use chainrevert_core::rollback::{Condition, RollbackEntry, UndoAction};
use chainrevert_core::sql::{self, Statement};
use chainrevert_core::types::ActionTrace;
use chainrevert_core::value::{diff_columns, row, Row, Value};

use crate::connection::{execute_logged, fetch_logged, SqlConnection};
use crate::registry::{OpenTransaction, TransactionRegistry};
use crate::schema;

/// Lifecycle of a block transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Connection held, `BEGIN` not issued yet.
    NotStarted,
    InTransaction,
    Committed,
    Aborted,
}

impl TxState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::InTransaction => write!(f, "in transaction"),
            Self::Committed => write!(f, "committed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

// ─── Locked state ─────────────────────────────────────────────────────────────

/// Everything behind the transaction lock.
pub(crate) struct TxInner<C> {
    conn: Option<C>,
    state: TxState,
    traces: Vec<ActionTrace>,
}

impl<C: SqlConnection> TxInner<C> {
    fn conn(&mut self) -> Result<&mut C, DbError> {
        match (self.state, self.conn.as_mut()) {
            (state, _) if state.is_finished() => Err(DbError::TransactionClosed {
                state: state.to_string(),
            }),
            (_, Some(conn)) => Ok(conn),
            (state, None) => Err(DbError::TransactionClosed {
                state: state.to_string(),
            }),
        }
    }

    pub(crate) async fn execute(&mut self, stmt: &Statement) -> Result<u64, DbError> {
        execute_logged(self.conn()?, stmt).await
    }

    pub(crate) async fn fetch(&mut self, stmt: &Statement) -> Result<Vec<Row>, DbError> {
        fetch_logged(self.conn()?, stmt).await
    }

    /// Issue `BEGIN` on first use.
    pub(crate) async fn begin(&mut self) -> Result<(), DbError> {
        if self.state == TxState::NotStarted {
            self.execute(&plain("BEGIN")).await?;
            self.state = TxState::InTransaction;
        }
        self.conn().map(|_| ())
    }
}

pub(crate) fn plain(sql: &str) -> Statement {
    Statement {
        sql: sql.to_string(),
        params: Vec::new(),
    }
}

fn owned(cols: &[&str]) -> Vec<String> {
    cols.iter().map(|c| c.to_string()).collect()
}

// ─── Shared transaction state ─────────────────────────────────────────────────

pub(crate) struct TxShared<C> {
    pub(crate) id: u64,
    pub(crate) reader: String,
    pub(crate) current_block: Option<u64>,
    pub(crate) config: TransactionConfig,
    registry: TransactionRegistry,
    pub(crate) inner: Mutex<TxInner<C>>,
}

impl<C: SqlConnection> TxShared<C> {
    /// The block to log against, if this mutation is to be logged at all.
    pub(crate) fn rollback_block(&self, reversible: bool) -> Option<u64> {
        self.current_block.filter(|_| reversible)
    }

    fn entry(&self, block_num: u64, table: &str, action: UndoAction) -> RollbackEntry {
        RollbackEntry {
            reader: self.reader.clone(),
            block_num,
            table: table.to_string(),
            action,
        }
    }

    pub(crate) async fn insert_locked(
        &self,
        inner: &mut TxInner<C>,
        table: &str,
        rows: Vec<Row>,
        primary_key: &[String],
        reversible: bool,
    ) -> Result<Vec<Row>, DbError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let stmt = sql::insert_statement(table, &rows, primary_key)?;

        inner.begin().await?;
        let inserted = if primary_key.is_empty() {
            inner.execute(&stmt).await?;
            Vec::new()
        } else {
            inner.fetch(&stmt).await?
        };

        if let Some(block) = self.rollback_block(reversible) {
            // RETURNING gives generated keys too; without a key every column identifies the row
            let entries = if primary_key.is_empty() {
                let key: Vec<String> = rows[0].keys().cloned().collect();
                rows.iter()
                    .map(|r| self.entry(block, table, UndoAction::Delete {
                        condition: sql::primary_condition(r, &key),
                    }))
                    .collect()
            } else {
                inserted
                    .iter()
                    .map(|r| self.entry(block, table, UndoAction::Delete {
                        condition: sql::primary_condition(r, primary_key),
                    }))
                    .collect()
            };
            self.save_rollback_entries(inner, entries).await?;
        }

        Ok(inserted)
    }

    pub(crate) async fn update_locked(
        &self,
        inner: &mut TxInner<C>,
        table: &str,
        values: Row,
        condition: &Condition,
        primary_key: &[String],
        reversible: bool,
    ) -> Result<u64, DbError> {
        let stmt = sql::update_statement(table, &values, condition)?;
        let block = self.rollback_block(reversible);

        inner.begin().await?;
        let previous = match block {
            // without a key each row is identified by its full image
            Some(_) if primary_key.is_empty() => {
                inner.fetch(&sql::select_statement(table, None, condition)).await?
            }
            Some(_) => {
                let mut columns: Vec<String> = values.keys().cloned().collect();
                for pk in primary_key {
                    if !columns.contains(pk) {
                        columns.push(pk.clone());
                    }
                }
                inner
                    .fetch(&sql::select_statement(table, Some(&columns), condition))
                    .await?
            }
            None => Vec::new(),
        };

        let affected = inner.execute(&stmt).await?;
        if affected == 0 {
            return Err(DbError::NoRowsAffected {
                table: table.to_string(),
                condition: condition.to_string(),
            });
        }

        if let Some(block) = block {
            let mut entries = Vec::new();
            for prev in &previous {
                let restore: Row = diff_columns(&values, prev, primary_key)
                    .into_iter()
                    .filter_map(|col| prev.get(&col).cloned().map(|v| (col, v)))
                    .collect();
                if restore.is_empty() {
                    continue;
                }
                let undo_condition = if primary_key.is_empty() {
                    let mut after = prev.clone();
                    after.extend(values.iter().map(|(col, v)| (col.clone(), v.clone())));
                    let columns: Vec<String> = after.keys().cloned().collect();
                    sql::primary_condition(&after, &columns)
                } else {
                    sql::primary_condition(prev, primary_key)
                };
                entries.push(self.entry(block, table, UndoAction::Update {
                    values: restore,
                    condition: undo_condition,
                }));
            }
            self.save_rollback_entries(inner, entries).await?;
        }

        Ok(affected)
    }

    pub(crate) async fn delete_locked(
        &self,
        inner: &mut TxInner<C>,
        table: &str,
        condition: &Condition,
        reversible: bool,
    ) -> Result<u64, DbError> {
        let block = self.rollback_block(reversible);

        inner.begin().await?;
        let captured = match block {
            Some(_) => inner.fetch(&sql::select_statement(table, None, condition)).await?,
            None => Vec::new(),
        };

        let affected = inner.execute(&sql::delete_statement(table, condition)).await?;

        if let Some(block) = block {
            if !captured.is_empty() {
                let entry = self.entry(block, table, UndoAction::Insert { rows: captured });
                self.save_rollback_entries(inner, vec![entry]).await?;
            }
        }

        Ok(affected)
    }

    pub(crate) async fn replace_locked(
        &self,
        inner: &mut TxInner<C>,
        table: &str,
        values: Row,
        primary_key: &[String],
        update_blacklist: &[String],
        reversible: bool,
    ) -> Result<(), DbError> {
        if primary_key.is_empty() {
            return Err(DbError::EmptyStatement {
                table: table.to_string(),
            });
        }
        let condition = sql::primary_condition(&values, primary_key);

        inner.begin().await?;
        let existing = inner
            .fetch(&sql::select_statement(table, Some(primary_key), &condition))
            .await?;

        if existing.is_empty() {
            self.insert_locked(inner, table, vec![values], primary_key, reversible)
                .await?;
            return Ok(());
        }

        let changes: Row = values
            .into_iter()
            .filter(|(col, _)| !primary_key.contains(col) && !update_blacklist.contains(col))
            .collect();
        if changes.is_empty() {
            return Ok(());
        }

        self.update_locked(inner, table, changes, &condition, primary_key, reversible)
            .await?;
        Ok(())
    }

    pub(crate) async fn update_reader_position_locked(
        &self,
        inner: &mut TxInner<C>,
        block_num: u64,
        block_time: DateTime<Utc>,
        live: bool,
    ) -> Result<(), DbError> {
        let values = row([
            ("block_num", Value::from(block_num)),
            ("block_time", Value::from(block_time.timestamp_millis())),
            ("updated", Value::from(Utc::now().timestamp_millis())),
            ("live", Value::from(live)),
        ]);
        let condition = Condition::new("\"name\" = ?", vec![Value::from(self.reader.as_str())]);
        let stmt = sql::update_statement(schema::READERS, &values, &condition)?;

        inner.begin().await?;
        if inner.execute(&stmt).await? == 0 {
            return Err(DbError::ReaderNotFound(self.reader.clone()));
        }
        Ok(())
    }

    async fn flush_traces(&self, inner: &mut TxInner<C>) -> Result<(), DbError> {
        let traces = std::mem::take(&mut inner.traces);
        if traces.is_empty() {
            return Ok(());
        }
        let key = owned(&["global_sequence"]);
        let batch = self.config.trace_batch_size.max(1);
        for chunk in traces.chunks(batch) {
            let rows = chunk.iter().map(ActionTrace::to_row).collect();
            self.insert_locked(inner, schema::TRACES, rows, &key, true).await?;
        }
        debug!(reader = %self.reader, count = traces.len(), "action traces flushed");
        Ok(())
    }

    async fn commit_steps(&self, inner: &mut TxInner<C>) -> Result<(), DbError> {
        self.flush_traces(inner).await?;
        if inner.state == TxState::InTransaction {
            inner.execute(&plain("COMMIT")).await?;
        }
        Ok(())
    }

    async fn commit_locked(&self, inner: &mut TxInner<C>) -> Result<(), DbError> {
        inner.conn()?;

        let result = self.commit_steps(inner).await;
        match &result {
            Ok(()) => inner.state = TxState::Committed,
            Err(_) => {
                if inner.state == TxState::InTransaction {
                    if let Err(e) = inner.execute(&plain("ROLLBACK")).await {
                        warn!(reader = %self.reader, error = %e, "rollback after failed commit failed");
                    }
                }
                inner.state = TxState::Aborted;
            }
        }
        self.release(inner);
        result
    }

    async fn abort_locked(&self, inner: &mut TxInner<C>) -> Result<(), DbError> {
        inner.conn()?;

        let result = if inner.state == TxState::InTransaction {
            inner.execute(&plain("ROLLBACK")).await.map(|_| ())
        } else {
            Ok(())
        };
        inner.state = TxState::Aborted;
        self.release(inner);
        result
    }

    /// Give the connection back to its pool and leave the registry.
    fn release(&self, inner: &mut TxInner<C>) {
        inner.traces.clear();
        drop(inner.conn.take());
        self.registry.deregister(self.id);
    }
}

#[async_trait]
impl<C: SqlConnection> OpenTransaction for TxShared<C> {
    fn reader(&self) -> &str {
        &self.reader
    }

    async fn force_abort(&self) -> Result<(), DbError> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_finished() {
            return Ok(());
        }
        self.abort_locked(&mut inner).await
    }
}

// ─── Public handle ────────────────────────────────────────────────────────────

/// The writes of one block for one reader.
///
/// Created by [`ContractDb::start_transaction`]. Must end with
/// [`commit`](Self::commit) or [`abort`](Self::abort); a transaction dropped
/// while still open is aborted in the background.
///
/// [`ContractDb::start_transaction`]: crate::reader::ContractDb::start_transaction
pub struct ContractDbTransaction<C: SqlConnection> {
    pub(crate) shared: Arc<TxShared<C>>,
}

impl<C: SqlConnection> ContractDbTransaction<C> {
    pub(crate) fn new(
        conn: C,
        reader: String,
        current_block: Option<u64>,
        config: TransactionConfig,
        registry: TransactionRegistry,
    ) -> Self {
        let id = registry.next_id();
        let shared = Arc::new(TxShared {
            id,
            reader,
            current_block,
            config,
            registry: registry.clone(),
            inner: Mutex::new(TxInner {
                conn: Some(conn),
                state: TxState::NotStarted,
                traces: Vec::new(),
            }),
        });
        registry.register(id, shared.clone());
        Self { shared }
    }

    pub fn reader(&self) -> &str {
        &self.shared.reader
    }

    /// The block this transaction logs rollback entries against, if any.
    pub fn current_block(&self) -> Option<u64> {
        self.shared.current_block
    }

    pub async fn state(&self) -> TxState {
        self.shared.inner.lock().await.state
    }

    /// Issue `BEGIN` now instead of on the first write.
    pub async fn begin(&self) -> Result<(), DbError> {
        self.shared.inner.lock().await.begin().await
    }

    /// Run any statement inside this transaction.
    pub async fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>, DbError> {
        let mut inner = self.shared.inner.lock().await;
        inner.begin().await?;
        inner
            .fetch(&Statement {
                sql: sql.to_string(),
                params,
            })
            .await
    }

    /// Insert rows that all share the same columns.
    ///
    /// Returns the `primary_key` columns of each inserted row (empty when no
    /// key is given).
    pub async fn insert(
        &self,
        table: &str,
        rows: Vec<Row>,
        primary_key: &[&str],
        reversible: bool,
    ) -> Result<Vec<Row>, DbError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared
            .insert_locked(&mut inner, table, rows, &owned(primary_key), reversible)
            .await
    }

    /// Update rows matching `condition`. Fails if nothing matched.
    pub async fn update(
        &self,
        table: &str,
        values: Row,
        condition: &Condition,
        primary_key: &[&str],
        reversible: bool,
    ) -> Result<u64, DbError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared
            .update_locked(&mut inner, table, values, condition, &owned(primary_key), reversible)
            .await
    }

    /// Delete rows matching `condition`, returning how many were removed.
    pub async fn delete(
        &self,
        table: &str,
        condition: &Condition,
        reversible: bool,
    ) -> Result<u64, DbError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared
            .delete_locked(&mut inner, table, condition, reversible)
            .await
    }

    /// Insert `values`, or update the existing row with the same primary key.
    ///
    /// On update, primary-key columns and columns in `update_blacklist` keep
    /// their stored values.
    pub async fn replace(
        &self,
        table: &str,
        values: Row,
        primary_key: &[&str],
        update_blacklist: &[&str],
        reversible: bool,
    ) -> Result<(), DbError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared
            .replace_locked(
                &mut inner,
                table,
                values,
                &owned(primary_key),
                &owned(update_blacklist),
                reversible,
            )
            .await
    }

    /// Move this reader's position. Becomes visible only on commit.
    pub async fn update_reader_position(
        &self,
        block_num: u64,
        block_time: DateTime<Utc>,
        live: bool,
    ) -> Result<(), DbError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared
            .update_reader_position_locked(&mut inner, block_num, block_time, live)
            .await
    }

    /// Record a block in the reversible window. Ignored when the transaction
    /// is not bound to a block.
    pub async fn add_reversible_block(&self, block_num: u64, block_id: &[u8]) -> Result<(), DbError> {
        if self.shared.current_block.is_none() {
            return Ok(());
        }
        let rows = vec![row([
            ("reader", Value::from(self.shared.reader.as_str())),
            ("block_num", Value::from(block_num)),
            ("block_id", Value::from(block_id)),
        ])];
        let mut inner = self.shared.inner.lock().await;
        self.shared
            .insert_locked(&mut inner, schema::REVERSIBLE_BLOCKS, rows, &[], false)
            .await?;
        Ok(())
    }

    /// Queue an action trace; traces are written just before `COMMIT`.
    pub async fn log_trace(&self, trace: ActionTrace) -> Result<(), DbError> {
        let mut inner = self.shared.inner.lock().await;
        inner.conn()?;
        inner.traces.push(trace);
        Ok(())
    }

    /// Flush queued traces, commit, and release the connection.
    pub async fn commit(&self) -> Result<(), DbError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.commit_locked(&mut inner).await
    }

    /// Roll back and release the connection.
    pub async fn abort(&self) -> Result<(), DbError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.abort_locked(&mut inner).await
    }
}

impl<C: SqlConnection> Drop for ContractDbTransaction<C> {
    fn drop(&mut self) {
        let open = match self.shared.inner.try_lock() {
            Ok(inner) => !inner.state.is_finished(),
            Err(_) => true,
        };
        if !open {
            return;
        }

        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(reader = %shared.reader, "transaction dropped while open, aborting");
                handle.spawn(async move {
                    if let Err(e) = shared.force_abort().await {
                        warn!(reader = %shared.reader, error = %e, "background abort failed");
                    }
                });
            }
            Err(_) => warn!(
                reader = %shared.reader,
                "transaction dropped outside a runtime; left to the registry"
            ),
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use sqlx::pool::PoolConnection;
    use sqlx::Sqlite;

    use super::*;
    use crate::connection::ConnectionSource;
    use crate::reader::ContractDb;
    use crate::sqlite::SqliteStorage;

    const READER: &str = "unit";

    async fn setup() -> (tempfile::TempDir, Arc<SqliteStorage>, ContractDb<SqliteStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let store = Arc::new(SqliteStorage::open(path.to_str().unwrap()).await.unwrap());
        let mut conn = store.acquire().await.unwrap();
        conn.execute(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, data BLOB,
             seen_at DATETIME, meta TEXT, created TEXT)",
            &[],
        )
        .await
        .unwrap();
        drop(conn);

        let db = ContractDb::new(READER, store.clone(), TransactionRegistry::new());
        db.init_reader(0).await.unwrap();
        (dir, store, db)
    }

    async fn select(store: &SqliteStorage, sql: &str) -> Vec<Row> {
        let mut conn = store.acquire().await.unwrap();
        conn.fetch_all(sql, &[]).await.unwrap()
    }

    async fn log_len(store: &SqliteStorage) -> i64 {
        select(store, "SELECT COUNT(*) AS n FROM reversible_queries").await[0]["n"]
            .as_i64()
            .unwrap()
    }

    fn by_id(id: i64) -> Condition {
        Condition::new("\"id\" = ?", vec![Value::from(id)])
    }

    #[tokio::test]
    async fn insert_returns_keys_and_logs_each_row() {
        let (_dir, store, db) = setup().await;
        let tx = db.start_transaction(Some(10)).await.unwrap();
        let keys = tx
            .insert(
                "items",
                vec![
                    row([("id", Value::from(1i64)), ("name", Value::from("a"))]),
                    row([("id", Value::from(2i64)), ("name", Value::from("b"))]),
                ],
                &["id"],
                true,
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(keys, vec![row([("id", 1i64)]), row([("id", 2i64)])]);
        let log = select(&store, "SELECT operation, block_num FROM reversible_queries").await;
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|r| r["operation"] == Value::from("delete")));
        assert!(log.iter().all(|r| r["block_num"] == Value::from(10i64)));
    }

    #[tokio::test]
    async fn mixed_column_batch_is_rejected_before_begin() {
        let (_dir, _store, db) = setup().await;
        let tx = db.start_transaction(Some(1)).await.unwrap();
        let err = tx
            .insert(
                "items",
                vec![row([("id", 1i64)]), row([("name", 2i64)])],
                &["id"],
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidBatch { .. }));
        assert_eq!(tx.state().await, TxState::NotStarted);
        tx.abort().await.unwrap();
    }

    #[tokio::test]
    async fn update_matching_nothing_is_fatal() {
        let (_dir, _store, db) = setup().await;
        let tx = db.start_transaction(Some(1)).await.unwrap();
        let err = tx
            .update("items", row([("name", "x")]), &by_id(404), &["id"], true)
            .await
            .unwrap_err();
        assert!(err.is_invariant_violation());
        tx.abort().await.unwrap();
    }

    #[tokio::test]
    async fn update_to_identical_values_logs_nothing() {
        let (_dir, store, db) = setup().await;
        let seen = Value::from_millis(1_650_000_000_000).unwrap();
        let original = row([
            ("id", Value::from(1i64)),
            ("name", Value::from("a")),
            ("data", Value::Bytes(vec![1, 2, 3])),
            ("seen_at", seen.clone()),
            ("meta", Value::NULL),
            ("created", Value::from("genesis")),
        ]);

        let tx = db.start_transaction(None).await.unwrap();
        tx.insert("items", vec![original], &["id"], true).await.unwrap();
        tx.commit().await.unwrap();

        let tx = db.start_transaction(Some(5)).await.unwrap();
        let same = row([
            ("name", Value::from("a")),
            ("data", Value::Bytes(vec![1, 2, 3])),
            ("seen_at", seen),
        ]);
        assert_eq!(tx.update("items", same, &by_id(1), &["id"], true).await.unwrap(), 1);
        tx.commit().await.unwrap();

        assert_eq!(log_len(&store).await, 0);
    }

    #[tokio::test]
    async fn update_logs_prior_values_of_changed_columns_only() {
        let (_dir, store, db) = setup().await;
        let tx = db.start_transaction(None).await.unwrap();
        tx.insert(
            "items",
            vec![row([("id", Value::from(1i64)), ("name", Value::from("a")), ("meta", Value::from("m"))])],
            &["id"],
            false,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let tx = db.start_transaction(Some(7)).await.unwrap();
        tx.update(
            "items",
            row([("name", Value::from("b")), ("meta", Value::from("m"))]),
            &by_id(1),
            &["id"],
            true,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let log = select(&store, "SELECT * FROM reversible_queries").await;
        assert_eq!(log.len(), 1);
        let entry = RollbackEntry::from_stored(
            READER,
            7,
            log[0]["table"].as_str().unwrap(),
            log[0]["operation"].as_str().unwrap(),
            log[0]["values"].as_str(),
            log[0]["condition"].as_str(),
        )
        .unwrap();
        assert_eq!(
            entry.action,
            UndoAction::Update {
                values: row([("name", "a")]),
                condition: by_id(1),
            }
        );
    }

    #[tokio::test]
    async fn replace_inserts_then_updates_outside_blacklist() {
        let (_dir, store, db) = setup().await;

        let tx = db.start_transaction(Some(3)).await.unwrap();
        tx.replace(
            "items",
            row([("id", Value::from(1i64)), ("name", Value::from("a")), ("created", Value::from("block 3"))]),
            &["id"],
            &["created"],
            true,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let tx = db.start_transaction(Some(4)).await.unwrap();
        tx.replace(
            "items",
            row([("id", Value::from(1i64)), ("name", Value::from("b")), ("created", Value::from("block 4"))]),
            &["id"],
            &["created"],
            true,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let rows = select(&store, "SELECT id, name, created FROM items").await;
        assert_eq!(
            rows,
            vec![row([
                ("id", Value::from(1i64)),
                ("name", Value::from("b")),
                ("created", Value::from("block 3")),
            ])]
        );
        let ops = select(&store, "SELECT operation FROM reversible_queries ORDER BY id").await;
        assert_eq!(ops, vec![row([("operation", "delete")]), row([("operation", "update")])]);
    }

    #[tokio::test]
    async fn delete_logs_complete_rows() {
        let (_dir, store, db) = setup().await;
        let tx = db.start_transaction(None).await.unwrap();
        tx.insert(
            "items",
            vec![row([("id", Value::from(2i64)), ("name", Value::from("x")), ("data", Value::Bytes(vec![9]))])],
            &[],
            true,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let tx = db.start_transaction(Some(50)).await.unwrap();
        assert_eq!(tx.delete("items", &by_id(2), true).await.unwrap(), 1);
        tx.commit().await.unwrap();

        let log = select(&store, "SELECT operation, \"values\" FROM reversible_queries").await;
        assert_eq!(log[0]["operation"], Value::from("insert"));
        let rows: Vec<Row> = serde_json::from_str(log[0]["values"].as_str().unwrap()).unwrap();
        assert_eq!(rows[0]["data"], Value::Bytes(vec![9]));
        assert_eq!(rows[0]["name"], Value::from("x"));
        assert_eq!(rows[0]["seen_at"], Value::NULL);
    }

    #[tokio::test]
    async fn unbound_or_irreversible_writes_are_not_logged() {
        let (_dir, store, db) = setup().await;
        let tx = db.start_transaction(None).await.unwrap();
        tx.insert("items", vec![row([("id", 1i64)])], &["id"], true).await.unwrap();
        tx.commit().await.unwrap();

        let tx = db.start_transaction(Some(9)).await.unwrap();
        tx.insert("items", vec![row([("id", 2i64)])], &["id"], false).await.unwrap();
        tx.delete("items", &by_id(1), false).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(log_len(&store).await, 0);
    }

    #[tokio::test]
    async fn commit_finishes_exactly_once() {
        let (_dir, _store, db) = setup().await;
        let tx = db.start_transaction(Some(1)).await.unwrap();
        tx.insert("items", vec![row([("id", 1i64)])], &["id"], true).await.unwrap();
        assert_eq!(db.registry().len(), 1);

        tx.commit().await.unwrap();
        assert_eq!(tx.state().await, TxState::Committed);
        assert!(db.registry().is_empty());

        assert!(matches!(tx.commit().await, Err(DbError::TransactionClosed { .. })));
        assert!(matches!(tx.abort().await, Err(DbError::TransactionClosed { .. })));
        assert!(matches!(
            tx.insert("items", vec![row([("id", 2i64)])], &["id"], true).await,
            Err(DbError::TransactionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn abort_discards_writes_and_log() {
        let (_dir, store, db) = setup().await;
        let tx = db.start_transaction(Some(1)).await.unwrap();
        tx.insert("items", vec![row([("id", 1i64)])], &["id"], true).await.unwrap();
        tx.abort().await.unwrap();

        assert!(select(&store, "SELECT * FROM items").await.is_empty());
        assert_eq!(log_len(&store).await, 0);
        assert!(db.registry().is_empty());
    }

    #[tokio::test]
    async fn reader_position_moves_only_on_commit() {
        let (_dir, _store, db) = setup().await;
        let block_time = Value::from_millis(1_700_000_000_000).unwrap().as_date().unwrap();

        let tx = db.start_transaction(Some(11)).await.unwrap();
        tx.update_reader_position(11, block_time, true).await.unwrap();
        tx.abort().await.unwrap();
        assert_eq!(db.get_reader_position().await.unwrap().unwrap().block_num, 0);

        let tx = db.start_transaction(Some(11)).await.unwrap();
        tx.update_reader_position(11, block_time, true).await.unwrap();
        tx.commit().await.unwrap();
        let pos = db.get_reader_position().await.unwrap().unwrap();
        assert_eq!(pos.block_num, 11);
        assert_eq!(pos.block_time, block_time);
        assert!(pos.live);
    }

    #[tokio::test]
    async fn unknown_reader_cannot_advance() {
        let (_dir, store, _db) = setup().await;
        let other = ContractDb::new("never-initialised", store, TransactionRegistry::new());
        let tx = other.start_transaction(Some(1)).await.unwrap();
        let err = tx
            .update_reader_position(1, Utc::now(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ReaderNotFound(name) if name == "never-initialised"));
        tx.abort().await.unwrap();
    }

    #[tokio::test]
    async fn traces_are_flushed_at_commit() {
        let (_dir, store, db) = setup().await;
        let tx = db.start_transaction(Some(20)).await.unwrap();
        for seq in 1..=3u64 {
            tx.log_trace(ActionTrace {
                global_sequence: seq,
                account: "eosio.token".into(),
                name: "transfer".into(),
                metadata: serde_json::json!({ "memo": format!("#{seq}") }),
                block_num: 20,
                block_time: Utc::now(),
            })
            .await
            .unwrap();
        }
        assert!(select(&store, "SELECT * FROM contract_traces").await.is_empty());

        tx.commit().await.unwrap();
        let traces = select(&store, "SELECT global_sequence FROM contract_traces ORDER BY 1").await;
        assert_eq!(traces.len(), 3);
        assert_eq!(log_len(&store).await, 3);
    }

    #[tokio::test]
    async fn registry_aborts_open_transactions() {
        let (_dir, store, db) = setup().await;
        let tx = db.start_transaction(Some(1)).await.unwrap();
        tx.insert("items", vec![row([("id", 1i64)])], &["id"], true).await.unwrap();

        assert_eq!(db.registry().open_readers(), vec![READER.to_string()]);
        assert_eq!(db.registry().abort_all().await, 1);
        assert_eq!(tx.state().await, TxState::Aborted);
        assert!(db.registry().is_empty());
        assert!(select(&store, "SELECT * FROM items").await.is_empty());
    }

    #[tokio::test]
    async fn dropped_transaction_is_aborted_in_background() {
        let (_dir, store, db) = setup().await;
        {
            let tx = db.start_transaction(Some(1)).await.unwrap();
            tx.insert("items", vec![row([("id", 1i64)])], &["id"], true).await.unwrap();
        }
        for _ in 0..100 {
            if db.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(db.registry().is_empty());
        assert!(select(&store, "SELECT * FROM items").await.is_empty());
    }

    // ─── Lock ordering ────────────────────────────────────────────────────────

    type EventLog = Arc<StdMutex<Vec<String>>>;

    struct Traced {
        conn: PoolConnection<Sqlite>,
        events: EventLog,
    }

    #[async_trait]
    impl SqlConnection for Traced {
        async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
            let events = self.events.clone();
            events.lock().unwrap().push(format!("start {sql}"));
            if sql.contains("slow") {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let out = self.conn.execute(sql, params).await;
            events.lock().unwrap().push(format!("end {sql}"));
            out
        }

        async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
            let events = self.events.clone();
            events.lock().unwrap().push(format!("start {sql}"));
            if sql.contains("slow") {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let out = self.conn.fetch_all(sql, params).await;
            events.lock().unwrap().push(format!("end {sql}"));
            out
        }
    }

    struct TracedSource {
        store: Arc<SqliteStorage>,
        events: EventLog,
    }

    #[async_trait]
    impl ConnectionSource for TracedSource {
        type Connection = Traced;

        async fn acquire(&self) -> Result<Traced, DbError> {
            Ok(Traced {
                conn: self.store.acquire().await?,
                events: self.events.clone(),
            })
        }
    }

    #[tokio::test]
    async fn concurrent_calls_never_interleave() {
        let (_dir, store, _db) = setup().await;
        let events = EventLog::default();
        let source = Arc::new(TracedSource {
            store,
            events: events.clone(),
        });
        let db = ContractDb::new(READER, source, TransactionRegistry::new());
        let tx = db.start_transaction(Some(1)).await.unwrap();

        let (slow, fast) = tokio::join!(
            tx.query("SELECT 1 AS slow", vec![]),
            tx.query("SELECT 2 AS fast", vec![]),
        );
        slow.unwrap();
        fast.unwrap();
        tx.commit().await.unwrap();

        let events = events.lock().unwrap().clone();
        let pos = |e: &str| events.iter().position(|x| x == e).unwrap();
        assert!(pos("end SELECT 1 AS slow") < pos("start SELECT 2 AS fast"));
        assert!(pos("end BEGIN") < pos("start SELECT 1 AS slow"));
    }
}
