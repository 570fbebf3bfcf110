pub mod catalog;
pub mod core;
pub mod error;
pub mod model;
pub mod modules;
pub mod normalize;
pub mod report;
pub mod utils;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::catalog::fsio::LockPolicy;
pub use crate::catalog::index::{FileIndex, IndexBackend, MemoryIndex, StatusFilter};
pub use crate::catalog::meta::OrgMeta;
pub use crate::catalog::Catalog;
pub use crate::core::runner::{scan_org, RunOutput, ScanRunner};
pub use crate::error::{CatalogError, Op, Result};
pub use crate::model::{Clock, FixedClock, OrgStatus, Platform, SystemClock, TimestampId, TrackedOrg};
pub use crate::normalize::ResultKind;
pub use crate::report::{DashboardRow, KindDiff, Staleness};

pub const CONFIG_FILE: &str = "config.json";

/// Catalog settings, read from `<root>/config.json`. Every field is optional
/// in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogConfig {
    pub stale_days: u32,
    pub compress: bool,
    pub lock_attempts: u32,
    pub lock_backoff_ms: u64,
    pub lock_max_backoff_ms: u64,
    pub jobs: usize,
    pub commit_limit: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            stale_days: 7,
            compress: false,
            lock_attempts: 8,
            lock_backoff_ms: 50,
            lock_max_backoff_ms: 2000,
            jobs: 4,
            commit_limit: 200,
        }
    }
}

impl CatalogConfig {
    /// Defaults when the file is absent.
    pub fn load(root: &Path) -> Result<Self> {
        let op = Op::new("load-config", "*");
        let path = root.join(CONFIG_FILE);
        match catalog::fsio::read_optional(op, &path)? {
            None => Ok(Self::default()),
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| CatalogError::malformed(op, &path, e)),
        }
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            attempts: self.lock_attempts.max(1),
            initial_backoff: Duration::from_millis(self.lock_backoff_ms),
            max_backoff: Duration::from_millis(self.lock_max_backoff_ms.max(self.lock_backoff_ms)),
        }
    }
}

/// Output abstraction for the scan pipeline.
pub trait ScanEventSink: Send + Sync {
    fn on_log(&self, level: &str, message: &str);
    fn on_progress(&self, phase: &str, current: usize, total: usize);
}

pub type SinkRef = Arc<dyn ScanEventSink>;

/// Terminal output sink.
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new_ref() -> SinkRef {
        Arc::new(Self)
    }
}

impl ScanEventSink for ConsoleSink {
    fn on_log(&self, level: &str, message: &str) {
        use colored::*;
        let colored = match level {
            "success" => message.green().to_string(),
            "error" => message.red().to_string(),
            "warn" => message.yellow().to_string(),
            "phase" => message.bright_cyan().bold().to_string(),
            _ => message.to_string(),
        };
        eprintln!("{}", colored);
    }

    fn on_progress(&self, phase: &str, current: usize, total: usize) {
        use colored::*;
        if total > 0 {
            eprintln!("{}", format!("[*] {} ({}/{})", phase, current, total).bright_cyan());
        } else {
            eprintln!("{}", format!("[*] {}", phase).bright_cyan());
        }
    }
}

/// Discards every event.
pub struct NullSink;

impl NullSink {
    pub fn new_ref() -> SinkRef {
        Arc::new(Self)
    }
}

impl ScanEventSink for NullSink {
    fn on_log(&self, _level: &str, _message: &str) {}

    fn on_progress(&self, _phase: &str, _current: usize, _total: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults_when_absent() {
        let dir = TempDir::new().unwrap();
        assert_eq!(CatalogConfig::load(dir.path()).unwrap(), CatalogConfig::default());
    }

    #[test]
    fn test_config_partial_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"staleDays": 14, "compress": true}"#).unwrap();
        let config = CatalogConfig::load(dir.path()).unwrap();
        assert_eq!(config.stale_days, 14);
        assert!(config.compress);
        assert_eq!(config.jobs, 4);
    }

    #[test]
    fn test_config_malformed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{staleDays").unwrap();
        assert_eq!(CatalogConfig::load(dir.path()).unwrap_err().kind(), "MalformedStore");
    }

    #[test]
    fn test_config_negative_stale_days() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"staleDays": -1}"#).unwrap();
        assert_eq!(CatalogConfig::load(dir.path()).unwrap_err().kind(), "MalformedStore");
    }

    #[test]
    fn test_lock_policy_from_config() {
        let config = CatalogConfig {
            lock_attempts: 0,
            ..CatalogConfig::default()
        };
        let policy = config.lock_policy();
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.initial_backoff, Duration::from_millis(50));
    }
}
