//! SQLite backend.
//!
//! Uses `sqlx` with WAL mode so readers are not blocked by the block
//! transaction that is currently writing.
//!
//! # Usage
//! ```rust,no_run
//! use chainrevert_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./index.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row as _, Sqlite, SqlitePool, TypeInfo, ValueRef};
use tracing::debug;

use chainrevert_core::error::DbError;
use chainrevert_core::value::{Row, Value};

use crate::connection::{ConnectionSource, SqlConnection};

/// SQLite connection pool with the write-layer schema in place.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db"`).
    pub async fn open(path: &str) -> Result<Self, DbError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| DbError::Database(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| DbError::Database(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// The database only lives while a connection to it is open, so the pool
    /// keeps a single connection that never expires. Only one transaction
    /// can be open at a time.
    pub async fn in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| DbError::Database(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create the bookkeeping tables if they don't already exist.
    async fn init_schema(&self) -> Result<(), DbError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS contract_readers (
                name       TEXT    NOT NULL PRIMARY KEY,
                block_num  INTEGER NOT NULL,
                block_time INTEGER NOT NULL,
                updated    INTEGER NOT NULL,
                live       BOOLEAN NOT NULL DEFAULT 0
            );",
            "CREATE TABLE IF NOT EXISTS reversible_blocks (
                reader    TEXT    NOT NULL,
                block_num INTEGER NOT NULL,
                block_id  BLOB    NOT NULL,
                PRIMARY KEY (reader, block_num)
            );",
            "CREATE TABLE IF NOT EXISTS reversible_queries (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                reader    TEXT    NOT NULL,
                block_num INTEGER NOT NULL,
                operation TEXT    NOT NULL,
                \"table\"   TEXT    NOT NULL,
                \"values\"  TEXT,
                condition TEXT
            );",
            "CREATE INDEX IF NOT EXISTS idx_reversible_queries_reader_block
             ON reversible_queries (reader, block_num);",
            "CREATE TABLE IF NOT EXISTS contract_abis (
                account   TEXT    NOT NULL,
                block_num INTEGER NOT NULL,
                abi       BLOB    NOT NULL,
                PRIMARY KEY (account, block_num)
            );",
            "CREATE TABLE IF NOT EXISTS contract_traces (
                global_sequence  INTEGER NOT NULL PRIMARY KEY,
                account          TEXT    NOT NULL,
                name             TEXT    NOT NULL,
                metadata         TEXT    NOT NULL,
                created_at_block INTEGER NOT NULL,
                created_at_time  INTEGER NOT NULL
            );",
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Database(e.to_string()))?;
        }

        debug!("SqliteStorage schema initialized");
        Ok(())
    }

    /// Get the underlying connection pool (for custom queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionSource for SqliteStorage {
    type Connection = PoolConnection<Sqlite>;

    async fn acquire(&self) -> Result<Self::Connection, DbError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| DbError::Database(format!("sqlite acquire: {e}")))
    }
}

#[async_trait]
impl SqlConnection for PoolConnection<Sqlite> {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        let result = bind_all(sqlx::query(sql), params)
            .execute(&mut **self)
            .await
            .map_err(|e| DbError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&mut **self)
            .await
            .map_err(|e| DbError::Database(e.to_string()))?;
        rows.iter().map(decode_row).collect()
    }
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_all<'q>(mut query: SqliteQuery<'q>, params: &'q [Value]) -> SqliteQuery<'q> {
    for value in params {
        query = match value {
            Value::Bytes(b) => query.bind(b.as_slice()),
            Value::Date(d) => query.bind(*d),
            Value::Raw(serde_json::Value::Null) => query.bind(None::<i64>),
            Value::Raw(serde_json::Value::Bool(b)) => query.bind(*b),
            Value::Raw(serde_json::Value::Number(n)) => match n.as_i64() {
                Some(i) => query.bind(i),
                // beyond i64: keep every digit as text
                None if n.is_u64() => query.bind(n.to_string()),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::Raw(serde_json::Value::String(s)) => query.bind(s.as_str()),
            Value::Raw(other) => query.bind(other.to_string()),
        };
    }
    query
}

/// Decode by declared column type first (dates and booleans have no storage
/// class of their own), then by the value's storage class.
fn decode_row(row: &SqliteRow) -> Result<Row, DbError> {
    let mut out = Row::new();
    for (i, col) in row.columns().iter().enumerate() {
        let name = col.name().to_string();
        let raw = row
            .try_get_raw(i)
            .map_err(|e| DbError::Database(e.to_string()))?;
        if raw.is_null() {
            out.insert(name, Value::NULL);
            continue;
        }
        let storage = raw.type_info().name().to_string();
        let declared = col.type_info().name().to_string();

        let value = match (declared.as_str(), storage.as_str()) {
            ("DATETIME" | "DATE", "TEXT" | "INTEGER" | "REAL") => {
                Value::Date(get::<DateTime<Utc>>(row, i)?)
            }
            ("BOOLEAN", "INTEGER") => Value::from(get::<bool>(row, i)?),
            (_, "INTEGER") => Value::from(get::<i64>(row, i)?),
            (_, "REAL") => Value::from(get::<f64>(row, i)?),
            (_, "TEXT") => Value::from(get::<String>(row, i)?),
            (_, "BLOB") => Value::Bytes(get::<Vec<u8>>(row, i)?),
            _ => {
                return Err(DbError::UnsupportedColumnType {
                    column: name,
                    type_name: storage,
                })
            }
        };
        out.insert(name, value);
    }
    Ok(out)
}

fn get<'r, T>(row: &'r SqliteRow, i: usize) -> Result<T, DbError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get_unchecked(i)
        .map_err(|e| DbError::Database(e.to_string()))
}
