//! Atomic file primitives shared by the catalog stores.
//!
//! Every write lands in a temp file in the destination directory and is
//! renamed over the target, so readers observe either the old or the new
//! content. A temp file left behind by a killed process is never read.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use fs4::FileExt;
use log::{debug, warn};
use tempfile::NamedTempFile;

use crate::error::{CatalogError, Op, Result};

pub(crate) fn write_atomic(op: Op<'_>, path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| CatalogError::io(op, parent, e))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| CatalogError::io(op, parent, e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| CatalogError::io(op, tmp.path(), e))?;
    // dropping an unpersisted NamedTempFile removes it
    tmp.persist(path)
        .map_err(|e| CatalogError::io(op, path, e.error))?;
    debug!("{} {}: wrote {} ({} bytes)", op.action, op.org, path.display(), bytes.len());
    Ok(())
}

/// Reads a whole file, mapping "not found" to `None`.
pub(crate) fn read_optional(op: Op<'_>, path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CatalogError::io(op, path, e)),
    }
}

pub(crate) fn remove_file_if_exists(op: Op<'_>, path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CatalogError::io(op, path, e)),
    }
}

/// Bounded exponential backoff for lock acquisition.
///
/// Delays run `initial, 2*initial, 4*initial, ...` capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: 8,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(2000),
        }
    }
}

impl LockPolicy {
    /// Delay to wait after the `failures`-th failed attempt (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << shift);
        delay.min(self.max_backoff)
    }
}

/// Exclusive advisory lock held for the lifetime of the value.
///
/// The lock is released when the file handle closes, which happens on every
/// exit path including unwinding.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(op: Op<'_>, path: &Path, policy: &LockPolicy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CatalogError::io(op, parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CatalogError::io(op, path, e))?;

        let attempts = policy.attempts.max(1);
        for attempt in 1..=attempts {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("{} {}: acquired {}", op.action, op.org, path.display());
                    return Ok(Self {
                        _file: file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if is_contended(&e) => {
                    if attempt == attempts {
                        break;
                    }
                    let delay = policy.delay_after(attempt);
                    warn!(
                        "{} {}: {} is held by another writer, retrying in {}ms ({}/{})",
                        op.action,
                        op.org,
                        path.display(),
                        delay.as_millis(),
                        attempt,
                        attempts
                    );
                    thread::sleep(delay);
                }
                Err(e) => return Err(CatalogError::io(op, path, e)),
            }
        }

        Err(CatalogError::io(
            op,
            path,
            io::Error::new(
                ErrorKind::WouldBlock,
                format!("lock still held after {} attempts", attempts),
            ),
        ))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        debug!("released {}", self.path.display());
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == fs4::lock_contended_error().raw_os_error()
}
