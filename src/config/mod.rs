//! Configuration Management
//!
//! Process-wide settings for the bridge plus the on-disk layout of the data directory.
//!
//! # Data Directory
//! - Default: `<user config dir>/querybridge` (e.g. `~/.config/querybridge`)
//! - Override: `--data-dir` or `QUERYBRIDGE_DATA_DIR`
//!
//! The directory holds `databases.json` (saved profiles) and `credentials.json`
//! (passwords keyed by credential id). Both are plain pretty-printed JSON and are
//! rewritten through a temp file + rename so a crash never leaves a torn file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Rows per batch when a query does not ask for a size
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Upper bound for caller-requested batch sizes
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Per-fetch timeout for streaming queries
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Handshake timeout for connections that do not set `connectTimeoutMs`
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum spacing between `query.progress` notifications
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// How long shutdown waits for in-flight queries to wind down
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const REGISTRY_FILE: &str = "databases.json";
const CREDENTIALS_FILE: &str = "credentials.json";

/// Bridge configuration
///
/// Built by the binary from CLI flags; tests construct it directly.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Directory holding the registry files (ignored when `ephemeral`)
    pub data_dir: PathBuf,

    /// Keep the database registry in memory only
    pub ephemeral: bool,

    pub default_batch_size: usize,
    pub max_batch_size: usize,
    pub fetch_timeout: Duration,
    pub connect_timeout: Duration,
    pub progress_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().unwrap_or_else(|_| PathBuf::from(".querybridge")),
            ephemeral: false,
            default_batch_size: DEFAULT_BATCH_SIZE,
            max_batch_size: MAX_BATCH_SIZE,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl BridgeConfig {
    /// In-memory configuration used by tests and `--ephemeral`
    #[must_use]
    pub fn ephemeral() -> Self {
        Self { ephemeral: true, ..Self::default() }
    }

    /// Path to the saved-profile file
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(REGISTRY_FILE)
    }

    /// Path to the credential file
    #[must_use]
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join(CREDENTIALS_FILE)
    }

    /// Effective batch size for a caller-supplied value
    ///
    /// Absent uses the default, non-positive becomes 1, oversized values are clamped.
    #[must_use]
    pub fn batch_size_for(&self, requested: Option<i64>) -> usize {
        let max = self.max_batch_size.max(1);
        match requested {
            None => self.default_batch_size.clamp(1, max),
            Some(n) if n <= 0 => 1,
            Some(n) => usize::try_from(n).map_or(max, |n| n.min(max)),
        }
    }

    /// Effective per-fetch timeout for a caller-supplied `timeoutMs`
    #[must_use]
    pub fn fetch_timeout_for(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => self.fetch_timeout,
        }
    }
}

/// Get the default data directory (`<config dir>/querybridge`)
pub fn default_data_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| BridgeError::config_error("Could not determine user config directory"))?;

    Ok(config_dir.join("querybridge"))
}

/// Load a JSON document, returning the default value when the file does not exist
pub fn load_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }

    let contents = fs::read_to_string(path).map_err(|e| {
        BridgeError::config_error(format!("Could not read {}: {e}", path.display()))
    })?;

    if contents.trim().is_empty() {
        return Ok(T::default());
    }

    serde_json::from_str(&contents).map_err(|e| {
        BridgeError::config_error(format!("Invalid file format in {}: {e}", path.display()))
    })
}

/// Save a JSON document atomically (write temp file, then rename over the target)
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            BridgeError::config_error(format!("Could not create data directory: {e}"))
        })?;
    }

    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| BridgeError::config_error(format!("Could not serialize data: {e}")))?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)
        .map_err(|e| BridgeError::config_error(format!("Could not write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        BridgeError::config_error(format!("Could not replace {}: {e}", path.display()))
    })?;

    Ok(())
}
