//! The rollback log and fork replay.
//!
//! Entries are appended in mutation order, so `(block_num DESC, id DESC)` is
//! exactly the reverse of the order in which the forward writes happened.
//! Replaying in that order unwinds the writes like a stack.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use chainrevert_core::error::DbError;
use chainrevert_core::rollback::{Condition, RollbackEntry, UndoAction};
use chainrevert_core::sql::{self, quote_ident, Statement};
use chainrevert_core::value::{row, Row, Value};

use crate::connection::SqlConnection;
use crate::schema;
use crate::transaction::{ContractDbTransaction, TxInner, TxShared};

impl<C: SqlConnection> TxShared<C> {
    /// Append entries to the rollback log in batches.
    pub(crate) async fn save_rollback_entries(
        &self,
        inner: &mut TxInner<C>,
        entries: Vec<RollbackEntry>,
    ) -> Result<(), DbError> {
        if entries.is_empty() || self.current_block.is_none() {
            return Ok(());
        }

        let batch = self.config.rollback_batch_size.max(1);
        for chunk in entries.chunks(batch) {
            let rows = chunk.iter().map(log_row).collect::<Result<Vec<_>, _>>()?;
            let stmt = sql::insert_statement(schema::ROLLBACK_LOG, &rows, &[])?;
            inner.begin().await?;
            inner.execute(&stmt).await?;
        }

        debug!(reader = %self.reader, count = entries.len(), "rollback entries saved");
        Ok(())
    }

    /// Undo every logged mutation at or after `target_block`, newest first.
    pub(crate) async fn rollback_locked(
        &self,
        inner: &mut TxInner<C>,
        target_block: u64,
    ) -> Result<(), DbError> {
        inner.begin().await?;

        let range = self.range_params(target_block);
        let logged = inner
            .fetch(&Statement {
                sql: format!(
                    "SELECT \"id\", \"block_num\", \"operation\", \"table\", \"values\", \"condition\"
                     FROM {} WHERE \"reader\" = ? AND \"block_num\" >= ?
                     ORDER BY \"block_num\" DESC, \"id\" DESC",
                    quote_ident(schema::ROLLBACK_LOG)
                ),
                params: range.clone(),
            })
            .await?;

        info!(
            reader = %self.reader,
            target_block,
            entries = logged.len(),
            "rolling back reversible blocks"
        );

        let slow = self.config.slow_step_warning();
        let every = self.config.progress_interval();
        let started = Instant::now();
        let mut last_report = started;

        for (done, stored) in logged.iter().enumerate() {
            let entry = stored_entry(&self.reader, stored)?;
            let step = Instant::now();

            match entry.action {
                UndoAction::Insert { rows } => {
                    self.insert_locked(inner, &entry.table, rows, &[], false).await?;
                }
                UndoAction::Update { values, condition } => {
                    self.update_locked(inner, &entry.table, values, &condition, &[], false)
                        .await?;
                }
                UndoAction::Delete { condition } => {
                    self.delete_locked(inner, &entry.table, &condition, false).await?;
                }
            }

            let took = step.elapsed();
            if took > slow {
                warn!(
                    reader = %self.reader,
                    table = %entry.table,
                    block_num = entry.block_num,
                    elapsed_ms = millis(took),
                    "slow rollback step"
                );
            }
            if last_report.elapsed() >= every {
                info!(
                    reader = %self.reader,
                    done = done + 1,
                    total = logged.len(),
                    elapsed_ms = millis(started.elapsed()),
                    "rollback progress"
                );
                last_report = Instant::now();
            }
        }

        for table in [schema::ROLLBACK_LOG, schema::REVERSIBLE_BLOCKS] {
            inner
                .execute(&Statement {
                    sql: format!(
                        "DELETE FROM {} WHERE \"reader\" = ? AND \"block_num\" >= ?",
                        quote_ident(table)
                    ),
                    params: range.clone(),
                })
                .await?;
        }

        let position = row([
            ("block_num", Value::from(target_block.saturating_sub(1))),
            ("updated", Value::from(chrono::Utc::now().timestamp_millis())),
        ]);
        let reader = Condition::new("\"name\" = ?", vec![Value::from(self.reader.as_str())]);
        if inner
            .execute(&sql::update_statement(schema::READERS, &position, &reader)?)
            .await?
            == 0
        {
            warn!(reader = %self.reader, "no reader row to rewind");
        }

        info!(
            reader = %self.reader,
            target_block,
            elapsed_ms = millis(started.elapsed()),
            "rollback complete"
        );
        Ok(())
    }

    /// Drop log entries and window rows that can no longer be rolled back to.
    pub(crate) async fn clear_fork_locked(
        &self,
        inner: &mut TxInner<C>,
        last_irreversible_block: u64,
    ) -> Result<(), DbError> {
        inner.begin().await?;
        for table in [schema::ROLLBACK_LOG, schema::REVERSIBLE_BLOCKS] {
            inner
                .execute(&Statement {
                    sql: format!(
                        "DELETE FROM {} WHERE \"reader\" = ? AND \"block_num\" <= ?",
                        quote_ident(table)
                    ),
                    params: self.range_params(last_irreversible_block),
                })
                .await?;
        }
        Ok(())
    }

    fn range_params(&self, block_num: u64) -> Vec<Value> {
        vec![Value::from(self.reader.as_str()), Value::from(block_num)]
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn log_row(entry: &RollbackEntry) -> Result<Row, DbError> {
    Ok(row([
        ("reader", Value::from(entry.reader.as_str())),
        ("block_num", Value::from(entry.block_num)),
        ("operation", Value::from(entry.operation().as_str())),
        ("table", Value::from(entry.table.as_str())),
        ("values", Value::from(entry.values_json()?)),
        ("condition", Value::from(entry.condition_json()?)),
    ]))
}

fn stored_entry(reader: &str, stored: &Row) -> Result<RollbackEntry, DbError> {
    let text = |col: &str| stored.get(col).and_then(Value::as_str);
    let block_num = stored
        .get("block_num")
        .and_then(Value::as_u64)
        .ok_or_else(|| DbError::Serialization("rollback entry without block_num".into()))?;
    RollbackEntry::from_stored(
        reader,
        block_num,
        text("table").unwrap_or_default(),
        text("operation").unwrap_or_default(),
        text("values"),
        text("condition"),
    )
}

impl<C: SqlConnection> ContractDbTransaction<C> {
    /// Append rollback entries to the log. A no-op when the transaction is
    /// not bound to a block.
    pub async fn save_rollback_entries(&self, entries: Vec<RollbackEntry>) -> Result<(), DbError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.save_rollback_entries(&mut inner, entries).await
    }

    /// Undo everything logged for this reader at or after `target_block` and
    /// rewind the reader to `target_block - 1`.
    pub async fn rollback_reversible_blocks(&self, target_block: u64) -> Result<(), DbError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.rollback_locked(&mut inner, target_block).await
    }

    /// Prune rollback history up to and including `last_irreversible_block`.
    pub async fn clear_fork_database(&self, last_irreversible_block: u64) -> Result<(), DbError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared
            .clear_fork_locked(&mut inner, last_irreversible_block)
            .await
    }
}
