//! Records for the bookkeeping tables the write layer owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::value::{row, Row, Value};

/// How far one reader has progressed (`contract_readers`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderPosition {
    pub name: String,
    /// Last block whose transaction committed.
    pub block_num: u64,
    pub block_time: DateTime<Utc>,
    /// When the position last moved.
    pub updated: DateTime<Utc>,
    /// Whether the reader is following the head (as opposed to backfilling).
    pub live: bool,
}

impl ReaderPosition {
    pub fn from_row(r: &Row) -> Result<Self, DbError> {
        Ok(Self {
            name: text(r, "name")?,
            block_num: unsigned(r, "block_num")?,
            block_time: date(r, "block_time")?,
            updated: date(r, "updated")?,
            live: column(r, "live")?
                .as_bool()
                .ok_or_else(|| malformed("live"))?,
        })
    }
}

/// A not-yet-final block in a reader's window (`reversible_blocks`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversibleBlock {
    pub reader: String,
    pub block_num: u64,
    pub block_id: Vec<u8>,
}

impl ReversibleBlock {
    pub fn from_row(r: &Row) -> Result<Self, DbError> {
        Ok(Self {
            reader: text(r, "reader")?,
            block_num: unsigned(r, "block_num")?,
            block_id: column(r, "block_id")?
                .as_bytes()
                .ok_or_else(|| malformed("block_id"))?
                .to_vec(),
        })
    }
}

/// A contract interface as of a block (`contract_abis`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiVersion {
    pub account: String,
    pub block_num: u64,
    pub abi: Vec<u8>,
}

impl AbiVersion {
    pub fn from_row(r: &Row) -> Result<Self, DbError> {
        Ok(Self {
            account: text(r, "account")?,
            block_num: unsigned(r, "block_num")?,
            abi: column(r, "abi")?
                .as_bytes()
                .ok_or_else(|| malformed("abi"))?
                .to_vec(),
        })
    }
}

/// One action trace appended to the `contract_traces` log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTrace {
    pub global_sequence: u64,
    pub account: String,
    pub name: String,
    pub metadata: serde_json::Value,
    pub block_num: u64,
    pub block_time: DateTime<Utc>,
}

impl ActionTrace {
    pub fn to_row(&self) -> Row {
        row([
            ("global_sequence", Value::from(self.global_sequence)),
            ("account", Value::from(self.account.as_str())),
            ("name", Value::from(self.name.as_str())),
            // stored as text so both backends accept it
            ("metadata", Value::from(self.metadata.to_string())),
            ("created_at_block", Value::from(self.block_num)),
            ("created_at_time", Value::from(self.block_time.timestamp_millis())),
        ])
    }
}

fn malformed(col: &str) -> DbError {
    DbError::Serialization(format!("column '{col}' is missing or has the wrong type"))
}

fn column<'a>(r: &'a Row, col: &str) -> Result<&'a Value, DbError> {
    r.get(col).ok_or_else(|| malformed(col))
}

fn text(r: &Row, col: &str) -> Result<String, DbError> {
    column(r, col)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| malformed(col))
}

fn unsigned(r: &Row, col: &str) -> Result<u64, DbError> {
    column(r, col)?.as_u64().ok_or_else(|| malformed(col))
}

fn date(r: &Row, col: &str) -> Result<DateTime<Utc>, DbError> {
    column(r, col)?.as_date().ok_or_else(|| malformed(col))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_position_from_sqlite_style_row() {
        let r = row([
            ("name", Value::from("atomic")),
            ("block_num", Value::from(120i64)),
            ("block_time", Value::from(1_700_000_000_000i64)),
            ("updated", Value::from(1_700_000_000_500i64)),
            ("live", Value::from(1i64)),
        ]);
        let pos = ReaderPosition::from_row(&r).unwrap();
        assert_eq!(pos.block_num, 120);
        assert!(pos.live);
        assert_eq!(pos.block_time.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn abi_requires_bytes() {
        let r = row([
            ("account", Value::from("eosio.token")),
            ("block_num", Value::from(5i64)),
            ("abi", Value::from("not bytes")),
        ]);
        assert!(matches!(AbiVersion::from_row(&r), Err(DbError::Serialization(_))));
    }
}
