//! Per-reader entry point.
//!
//! A [`ContractDb`] binds a connection source to one named reader. It opens
//! block transactions and answers the lookups the chain-stream client needs
//! to resume (position, reversible window) and to decode history (ABIs).

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use chainrevert_core::config::TransactionConfig;
use chainrevert_core::error::DbError;
use chainrevert_core::sql::{quote_ident, Statement};
use chainrevert_core::types::{AbiVersion, ReaderPosition, ReversibleBlock};
use chainrevert_core::value::{Row, Value};

use crate::connection::{fetch_logged, execute_logged, ConnectionSource};
use crate::registry::TransactionRegistry;
use crate::schema;
use crate::transaction::ContractDbTransaction;

pub struct ContractDb<S: ConnectionSource> {
    name: String,
    source: Arc<S>,
    registry: TransactionRegistry,
    config: TransactionConfig,
}

impl<S: ConnectionSource> ContractDb<S> {
    pub fn new(name: impl Into<String>, source: Arc<S>, registry: TransactionRegistry) -> Self {
        Self {
            name: name.into(),
            source,
            registry,
            config: TransactionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: TransactionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    /// Acquire a connection and open a transaction on it.
    ///
    /// With `current_block = None` nothing is written to the rollback log,
    /// which is what an initial backfill of final blocks wants.
    pub async fn start_transaction(
        &self,
        current_block: Option<u64>,
    ) -> Result<ContractDbTransaction<S::Connection>, DbError> {
        let conn = self.source.acquire().await?;
        Ok(ContractDbTransaction::new(
            conn,
            self.name.clone(),
            current_block,
            self.config.clone(),
            self.registry.clone(),
        ))
    }

    async fn fetch(&self, sql: String, params: Vec<Value>) -> Result<Vec<Row>, DbError> {
        let mut conn = self.source.acquire().await?;
        fetch_logged(&mut conn, &Statement { sql, params }).await
    }

    /// Create the reader row at `start_block` unless it already exists, and
    /// return the stored position.
    pub async fn init_reader(&self, start_block: u64) -> Result<ReaderPosition, DbError> {
        let now = Utc::now().timestamp_millis();
        let stmt = Statement {
            sql: format!(
                "INSERT INTO {} (\"name\", \"block_num\", \"block_time\", \"updated\", \"live\")
                 VALUES (?, ?, ?, ?, ?) ON CONFLICT (\"name\") DO NOTHING",
                quote_ident(schema::READERS)
            ),
            params: vec![
                Value::from(self.name.as_str()),
                Value::from(start_block),
                Value::from(0i64),
                Value::from(now),
                Value::from(false),
            ],
        };
        let mut conn = self.source.acquire().await?;
        if execute_logged(&mut conn, &stmt).await? > 0 {
            info!(reader = %self.name, start_block, "reader created");
        }
        drop(conn);

        self.get_reader_position()
            .await?
            .ok_or_else(|| DbError::ReaderNotFound(self.name.clone()))
    }

    pub async fn get_reader_position(&self) -> Result<Option<ReaderPosition>, DbError> {
        let rows = self
            .fetch(
                format!(
                    "SELECT * FROM {} WHERE \"name\" = ?",
                    quote_ident(schema::READERS)
                ),
                vec![Value::from(self.name.as_str())],
            )
            .await?;
        rows.first().map(ReaderPosition::from_row).transpose()
    }

    /// The reader's reversible window, oldest block first.
    pub async fn get_last_reader_blocks(&self) -> Result<Vec<ReversibleBlock>, DbError> {
        let rows = self
            .fetch(
                format!(
                    "SELECT \"reader\", \"block_num\", \"block_id\" FROM {}
                     WHERE \"reader\" = ? ORDER BY \"block_num\" ASC",
                    quote_ident(schema::REVERSIBLE_BLOCKS)
                ),
                vec![Value::from(self.name.as_str())],
            )
            .await?;
        rows.iter().map(ReversibleBlock::from_row).collect()
    }

    /// The ABI in effect at `block_num`: the newest version at or before it.
    pub async fn fetch_abi(&self, account: &str, block_num: u64) -> Result<Option<AbiVersion>, DbError> {
        self.abi_lookup(account, block_num, "<=", "DESC").await
    }

    /// The first ABI version deployed after `block_num`.
    pub async fn fetch_next_abi(
        &self,
        account: &str,
        block_num: u64,
    ) -> Result<Option<AbiVersion>, DbError> {
        self.abi_lookup(account, block_num, ">", "ASC").await
    }

    async fn abi_lookup(
        &self,
        account: &str,
        block_num: u64,
        cmp: &'static str,
        order: &'static str,
    ) -> Result<Option<AbiVersion>, DbError> {
        let rows = self
            .fetch(
                format!(
                    "SELECT \"account\", \"block_num\", \"abi\" FROM {}
                     WHERE \"account\" = ? AND \"block_num\" {cmp} ?
                     ORDER BY \"block_num\" {order} LIMIT 1",
                    quote_ident(schema::ABIS)
                ),
                vec![Value::from(account), Value::from(block_num)],
            )
            .await?;
        rows.first().map(AbiVersion::from_row).transpose()
    }

    /// Store an ABI version, replacing one already recorded at the same block.
    pub async fn save_abi(&self, abi: &AbiVersion) -> Result<(), DbError> {
        let stmt = Statement {
            sql: format!(
                "INSERT INTO {} (\"account\", \"block_num\", \"abi\") VALUES (?, ?, ?)
                 ON CONFLICT (\"account\", \"block_num\") DO UPDATE SET \"abi\" = excluded.\"abi\"",
                quote_ident(schema::ABIS)
            ),
            params: vec![
                Value::from(abi.account.as_str()),
                Value::from(abi.block_num),
                Value::Bytes(abi.abi.clone()),
            ],
        };
        let mut conn = self.source.acquire().await?;
        execute_logged(&mut conn, &stmt).await?;
        Ok(())
    }
}
