//! Write-layer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for block transactions and fork replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Rollback entries written per bulk insert.
    pub rollback_batch_size: usize,
    /// A single replay step slower than this is logged as a warning (milliseconds).
    pub slow_step_warn_ms: u64,
    /// How often fork replay reports progress (milliseconds).
    pub progress_interval_ms: u64,
    /// Action-trace rows written per insert when flushing at commit.
    pub trace_batch_size: usize,
}

impl TransactionConfig {
    pub fn slow_step_warning(&self) -> Duration {
        Duration::from_millis(self.slow_step_warn_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            rollback_batch_size: 100,
            slow_step_warn_ms: 30_000,
            progress_interval_ms: 5_000,
            trace_batch_size: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: TransactionConfig =
            serde_json::from_str(r#"{ "rollback_batch_size": 10 }"#).unwrap();
        assert_eq!(cfg.rollback_batch_size, 10);
        assert_eq!(cfg.slow_step_warning(), Duration::from_secs(30));
        assert_eq!(cfg.progress_interval(), Duration::from_secs(5));
    }
}
