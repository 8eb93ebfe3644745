//! Names of the tables the write layer keeps for itself.
//!
//! Backends create them in `init_schema`; contract tables belong to the
//! processors that write them.

/// One row per reader: `name, block_num, block_time, updated, live`.
pub const READERS: &str = "contract_readers";

/// Window of not-yet-final blocks: `reader, block_num, block_id`.
pub const REVERSIBLE_BLOCKS: &str = "reversible_blocks";

/// The rollback log: `id, reader, block_num, operation, table, values, condition`.
pub const ROLLBACK_LOG: &str = "reversible_queries";

/// ABI history: `account, block_num, abi`.
pub const ABIS: &str = "contract_abis";

/// Append-only action-trace log, keyed by `global_sequence`.
pub const TRACES: &str = "contract_traces";
