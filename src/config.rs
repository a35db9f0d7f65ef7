use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, loaded from the environment with defaults for
/// local development.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the durable store snapshots.
    pub data_dir: PathBuf,
    /// Bound on every remote mirror call.
    pub remote_timeout: Duration,
    /// Cadence of the liquidation sweep loop.
    pub sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("DATA_DIR")
            .unwrap_or_else(|_| "./data".to_string())
            .into();

        let remote_timeout_secs = std::env::var("REMOTE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5);

        let sweep_interval_ms = std::env::var("SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(2000);

        Self {
            data_dir,
            remote_timeout: Duration::from_secs(remote_timeout_secs),
            sweep_interval: Duration::from_millis(sweep_interval_ms),
        }
    }

    pub fn positions_path(&self) -> PathBuf {
        self.data_dir.join("positions.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("deposits.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
            remote_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(2000),
        }
    }
}
