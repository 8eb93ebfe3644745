//! Rollback log entries: the stored inverse of one forward mutation.
//!
//! Forward `insert` is undone by a `delete`, forward `delete` by an `insert`
//! of the captured rows, and forward `update` by an `update` back to the
//! captured prior values. Entries are persisted as text (`values` and
//! `condition` are JSON) and replayed newest-first on a fork.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::value::{Row, Value};

/// A `WHERE` clause with `?` placeholders and the values bound to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "str")]
    pub sql: String,
    pub values: Vec<Value>,
}

impl Condition {
    pub fn new(sql: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            values,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.sql, self.values)
    }
}

/// Operation tag stored in the `operation` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOperation {
    Insert,
    Update,
    Delete,
}

impl RollbackOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for RollbackOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollbackOperation {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(DbError::UnknownRollbackOperation(other.to_string())),
        }
    }
}

/// What replaying an entry does to its table.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoAction {
    /// Reinsert complete rows removed by a forward delete.
    Insert { rows: Vec<Row> },
    /// Restore the prior values of the columns a forward update changed.
    Update { values: Row, condition: Condition },
    /// Remove a row added by a forward insert.
    Delete { condition: Condition },
}

/// One row of the rollback log.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackEntry {
    pub reader: String,
    pub block_num: u64,
    pub table: String,
    pub action: UndoAction,
}

impl RollbackEntry {
    pub fn operation(&self) -> RollbackOperation {
        match self.action {
            UndoAction::Insert { .. } => RollbackOperation::Insert,
            UndoAction::Update { .. } => RollbackOperation::Update,
            UndoAction::Delete { .. } => RollbackOperation::Delete,
        }
    }

    /// JSON text for the `values` column.
    pub fn values_json(&self) -> Result<Option<String>, DbError> {
        Ok(match &self.action {
            UndoAction::Insert { rows } => Some(serde_json::to_string(rows)?),
            UndoAction::Update { values, .. } => Some(serde_json::to_string(values)?),
            UndoAction::Delete { .. } => None,
        })
    }

    /// JSON text for the `condition` column.
    pub fn condition_json(&self) -> Result<Option<String>, DbError> {
        Ok(match &self.action {
            UndoAction::Insert { .. } => None,
            UndoAction::Update { condition, .. } | UndoAction::Delete { condition } => {
                Some(serde_json::to_string(condition)?)
            }
        })
    }

    /// Rebuild an entry from its stored columns.
    pub fn from_stored(
        reader: impl Into<String>,
        block_num: u64,
        table: impl Into<String>,
        operation: &str,
        values: Option<&str>,
        condition: Option<&str>,
    ) -> Result<Self, DbError> {
        let table = table.into();
        let missing = |col: &str| {
            DbError::Serialization(format!(
                "rollback {operation} on '{table}' is missing its {col}"
            ))
        };

        let action = match operation.parse::<RollbackOperation>()? {
            RollbackOperation::Insert => UndoAction::Insert {
                rows: serde_json::from_str(values.ok_or_else(|| missing("values"))?)?,
            },
            RollbackOperation::Update => UndoAction::Update {
                values: serde_json::from_str(values.ok_or_else(|| missing("values"))?)?,
                condition: serde_json::from_str(condition.ok_or_else(|| missing("condition"))?)?,
            },
            RollbackOperation::Delete => UndoAction::Delete {
                condition: serde_json::from_str(condition.ok_or_else(|| missing("condition"))?)?,
            },
        };

        Ok(Self {
            reader: reader.into(),
            block_num,
            table,
            action,
        })
    }
}
