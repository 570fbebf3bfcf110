use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::model::TimestampId;

/// Errors raised by catalog operations.
///
/// Every variant names the operation that was attempted (`action`) and the
/// org it was attempted on, so the CLI can print a self-contained message.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{action}: org '{org}' is not tracked")]
    NotTracked { action: &'static str, org: String },

    #[error("{action}: org '{org}' is already tracked")]
    AlreadyTracked { action: &'static str, org: String },

    #[error(
        "{action}: snapshot {timestamp} already exists for org '{org}' \
         (timestamps have minute granularity, wait a minute and retry)"
    )]
    DuplicateTimestamp {
        action: &'static str,
        org: String,
        timestamp: TimestampId,
    },

    #[error("{action}: invalid org name '{org}' (allowed: letters, digits, '-' and '_')")]
    InvalidName { action: &'static str, org: String },

    #[error("{action} '{org}': {detail}")]
    InvalidInput {
        action: &'static str,
        org: String,
        detail: String,
    },

    #[error("{action} '{org}': I/O failure on {}: {source}", .path.display())]
    Io {
        action: &'static str,
        org: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{action} '{org}': malformed store {}: {detail}", .path.display())]
    MalformedStore {
        action: &'static str,
        org: String,
        path: PathBuf,
        detail: String,
    },
}

impl CatalogError {
    /// Taxonomy name printed by the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotTracked { .. } => "NotTracked",
            Self::AlreadyTracked { .. } => "AlreadyTracked",
            Self::DuplicateTimestamp { .. } => "DuplicateTimestamp",
            Self::InvalidName { .. } => "InvalidName",
            Self::InvalidInput { .. } => "InvalidInput",
            Self::Io { .. } => "IOFailure",
            Self::MalformedStore { .. } => "MalformedStore",
        }
    }

    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotTracked { .. } => 2,
            Self::AlreadyTracked { .. } => 3,
            Self::DuplicateTimestamp { .. } => 4,
            Self::InvalidName { .. } | Self::InvalidInput { .. } => 5,
            Self::Io { .. } => 6,
            Self::MalformedStore { .. } => 7,
        }
    }

    pub fn io(op: Op<'_>, path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            action: op.action,
            org: op.org.to_string(),
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn malformed(op: Op<'_>, path: impl AsRef<Path>, detail: impl ToString) -> Self {
        Self::MalformedStore {
            action: op.action,
            org: op.org.to_string(),
            path: path.as_ref().to_path_buf(),
            detail: detail.to_string(),
        }
    }

    pub fn invalid(op: Op<'_>, detail: impl ToString) -> Self {
        Self::InvalidInput {
            action: op.action,
            org: op.org.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn not_tracked(op: Op<'_>) -> Self {
        Self::NotTracked {
            action: op.action,
            org: op.org.to_string(),
        }
    }

    pub fn duplicate(op: Op<'_>, timestamp: TimestampId) -> Self {
        Self::DuplicateTimestamp {
            action: op.action,
            org: op.org.to_string(),
            timestamp,
        }
    }
}

/// The operation an error is reported against.
#[derive(Debug, Clone, Copy)]
pub struct Op<'a> {
    pub action: &'static str,
    pub org: &'a str,
}

impl<'a> Op<'a> {
    pub fn new(action: &'static str, org: &'a str) -> Self {
        Self { action, org }
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
