//! Scan Snapshot Store: `tracked/<org>/scans/<timestamp_id>/<kind>.json[.gz]`.
//!
//! A snapshot is assembled in `scans/.<timestamp_id>.partial/` and renamed
//! into place by `commit`, so listings only ever show complete runs.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};

use super::fsio;
use crate::error::{CatalogError, Op, Result};
use crate::model::{validate_name, TimestampId};
use crate::normalize::{self, ResultKind};

pub const SCANS_DIR: &str = "scans";
const PARTIAL_SUFFIX: &str = ".partial";

/// Snapshot that has been allocated but not yet committed.
#[derive(Debug)]
pub struct SnapshotHandle {
    org: String,
    timestamp: TimestampId,
    staging: PathBuf,
    target: PathBuf,
    written: Vec<ResultKind>,
}

impl SnapshotHandle {
    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn timestamp(&self) -> TimestampId {
        self.timestamp
    }

    /// Kinds written so far, in write order.
    pub fn written(&self) -> &[ResultKind] {
        &self.written
    }
}

pub struct SnapshotStore {
    tracked_dir: PathBuf,
    compress: bool,
}

impl SnapshotStore {
    pub fn new(tracked_dir: &Path, compress: bool) -> Self {
        Self {
            tracked_dir: tracked_dir.to_path_buf(),
            compress,
        }
    }

    pub fn scans_dir(&self, org: &str) -> PathBuf {
        self.tracked_dir.join(org).join(SCANS_DIR)
    }

    pub fn snapshot_dir(&self, org: &str, timestamp: TimestampId) -> PathBuf {
        self.scans_dir(org).join(timestamp.to_string())
    }

    /// Allocates a snapshot. Exactly one of several concurrent callers with
    /// the same `(org, timestamp)` succeeds; the others get
    /// `DuplicateTimestamp`.
    pub fn create_snapshot(&self, org: &str, timestamp: TimestampId) -> Result<SnapshotHandle> {
        let op = Op::new("create-snapshot", org);
        validate_name(op.action, org)?;

        let scans = self.scans_dir(org);
        fs::create_dir_all(&scans).map_err(|e| CatalogError::io(op, &scans, e))?;

        let staging = scans.join(format!(".{}{}", timestamp, PARTIAL_SUFFIX));
        let target = self.snapshot_dir(org, timestamp);

        // create_dir is the exclusive step; the target check must come after it
        match fs::create_dir(&staging) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(CatalogError::duplicate(op, timestamp));
            }
            Err(e) => return Err(CatalogError::io(op, &staging, e)),
        }
        if target.exists() {
            let _ = fs::remove_dir_all(&staging);
            return Err(CatalogError::duplicate(op, timestamp));
        }

        debug!("allocated snapshot {} for {}", timestamp, org);
        Ok(SnapshotHandle {
            org: org.to_string(),
            timestamp,
            staging,
            target,
            written: Vec::new(),
        })
    }

    /// Normalizes `content` and writes it into the pending snapshot. Writing
    /// the same kind twice replaces the earlier content.
    pub fn write_result_set(
        &self,
        handle: &mut SnapshotHandle,
        kind: ResultKind,
        content: &[u8],
    ) -> Result<()> {
        let op = Op::new("write-result-set", &handle.org);
        let normalized = normalize::normalize(kind, content)
            .map_err(|e| CatalogError::invalid(op, format!("{} output: {}", kind, e)))?;

        let (name, bytes) = if self.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&normalized)
                .map_err(|e| CatalogError::io(op, &handle.staging, e))?;
            let gz = encoder
                .finish()
                .map_err(|e| CatalogError::io(op, &handle.staging, e))?;
            (format!("{}.json.gz", kind), gz)
        } else {
            (format!("{}.json", kind), normalized)
        };

        // drop a stale sibling in the other encoding
        let other = if self.compress {
            format!("{}.json", kind)
        } else {
            format!("{}.json.gz", kind)
        };
        fsio::remove_file_if_exists(op, &handle.staging.join(other))?;
        fsio::write_atomic(op, &handle.staging.join(name), &bytes)?;
        if !handle.written.contains(&kind) {
            handle.written.push(kind);
        }
        Ok(())
    }

    /// Publishes the snapshot under its final name.
    pub fn commit(&self, handle: SnapshotHandle) -> Result<TimestampId> {
        let op = Op::new("commit-snapshot", &handle.org);
        if handle.target.exists() {
            let _ = fs::remove_dir_all(&handle.staging);
            return Err(CatalogError::duplicate(op, handle.timestamp));
        }
        fs::rename(&handle.staging, &handle.target)
            .map_err(|e| CatalogError::io(op, &handle.target, e))?;
        info!(
            "committed snapshot {} for {} ({} result set(s))",
            handle.timestamp,
            handle.org,
            handle.written.len()
        );
        Ok(handle.timestamp)
    }

    /// Abandons a pending snapshot.
    pub fn discard(&self, handle: SnapshotHandle) -> Result<()> {
        let op = Op::new("discard-snapshot", &handle.org);
        match fs::remove_dir_all(&handle.staging) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CatalogError::io(op, &handle.staging, e)),
        }
    }

    /// Removes a committed snapshot. Only used to roll back a scan whose
    /// recording failed.
    pub(crate) fn remove_snapshot(&self, org: &str, timestamp: TimestampId) -> Result<()> {
        let op = Op::new("remove-snapshot", org);
        let dir = self.snapshot_dir(org, timestamp);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CatalogError::io(op, &dir, e)),
        }
    }

    /// Committed snapshot ids, ascending.
    pub fn list_snapshots(&self, org: &str) -> Result<Vec<TimestampId>> {
        let op = Op::new("list-snapshots", org);
        let scans = self.scans_dir(org);
        let entries = match fs::read_dir(&scans) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CatalogError::io(op, &scans, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CatalogError::io(op, &scans, e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !is_dir || name.starts_with('.') {
                continue;
            }
            match name.parse::<TimestampId>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!("ignoring unexpected directory {} in {}", name, scans.display()),
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn latest_snapshot(&self, org: &str) -> Result<Option<TimestampId>> {
        Ok(self.list_snapshots(org)?.last().copied())
    }

    /// Second-most-recent snapshot; `None` with fewer than two.
    pub fn previous_snapshot(&self, org: &str) -> Result<Option<TimestampId>> {
        let ids = self.list_snapshots(org)?;
        Ok(ids.len().checked_sub(2).map(|i| ids[i]))
    }

    pub fn has_snapshot(&self, org: &str, timestamp: TimestampId) -> bool {
        self.snapshot_dir(org, timestamp).is_dir()
    }

    /// Contents of one result set, decompressed; `None` if that scanner was
    /// not part of the snapshot.
    pub fn read_result_set(
        &self,
        org: &str,
        timestamp: TimestampId,
        kind: ResultKind,
    ) -> Result<Option<Vec<u8>>> {
        let op = Op::new("read-result-set", org);
        let dir = self.snapshot_dir(org, timestamp);

        if let Some(bytes) = fsio::read_optional(op, &dir.join(format!("{}.json", kind)))? {
            return Ok(Some(bytes));
        }
        let gz_path = dir.join(format!("{}.json.gz", kind));
        let Some(compressed) = fsio::read_optional(op, &gz_path)? else {
            return Ok(None);
        };
        let mut out = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| CatalogError::malformed(op, &gz_path, e))?;
        Ok(Some(out))
    }

    /// Kinds present in a committed snapshot.
    pub fn result_kinds(&self, org: &str, timestamp: TimestampId) -> Result<Vec<ResultKind>> {
        let dir = self.snapshot_dir(org, timestamp);
        Ok(ResultKind::ALL
            .into_iter()
            .filter(|k| {
                dir.join(format!("{}.json", k)).is_file() || dir.join(format!("{}.json.gz", k)).is_file()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn ts(s: &str) -> TimestampId {
        s.parse().unwrap()
    }

    fn semgrep(results: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({ "results": results })).unwrap()
    }

    #[test]
    fn test_duplicate_create_fails() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let handle = store.create_snapshot("acme", ts("2025-01-01-0900")).unwrap();
        let err = store.create_snapshot("acme", ts("2025-01-01-0900")).unwrap_err();
        assert_eq!(err.kind(), "DuplicateTimestamp");

        store.commit(handle).unwrap();
        let err = store.create_snapshot("acme", ts("2025-01-01-0900")).unwrap_err();
        assert_eq!(err.kind(), "DuplicateTimestamp");
    }

    #[test]
    fn test_concurrent_create_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::new(dir.path(), false));
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.create_snapshot("acme", ts("2025-01-01-0900")).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_pending_snapshot_is_invisible_until_commit() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let mut handle = store.create_snapshot("acme", ts("2025-01-01-0900")).unwrap();
        store
            .write_result_set(&mut handle, ResultKind::Semgrep, &semgrep(json!([])))
            .unwrap();

        assert!(store.list_snapshots("acme").unwrap().is_empty());
        assert!(store
            .read_result_set("acme", ts("2025-01-01-0900"), ResultKind::Semgrep)
            .unwrap()
            .is_none());

        store.commit(handle).unwrap();
        assert_eq!(store.list_snapshots("acme").unwrap(), [ts("2025-01-01-0900")]);
    }

    #[test]
    fn test_discard_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let handle = store.create_snapshot("acme", ts("2025-01-01-0900")).unwrap();
        store.discard(handle).unwrap();
        assert!(store.list_snapshots("acme").unwrap().is_empty());
        assert!(store.create_snapshot("acme", ts("2025-01-01-0900")).is_ok());
    }

    #[test]
    fn test_list_latest_previous() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        assert_eq!(store.latest_snapshot("acme").unwrap(), None);

        for id in ["2025-01-03-0900", "2024-12-31-2300", "2025-01-01-0900"] {
            let handle = store.create_snapshot("acme", ts(id)).unwrap();
            store.commit(handle).unwrap();
            if id == "2025-01-03-0900" {
                assert_eq!(store.previous_snapshot("acme").unwrap(), None);
            }
        }
        fs::create_dir_all(store.scans_dir("acme").join("not-a-timestamp")).unwrap();

        assert_eq!(
            store.list_snapshots("acme").unwrap(),
            [ts("2024-12-31-2300"), ts("2025-01-01-0900"), ts("2025-01-03-0900")]
        );
        assert_eq!(store.latest_snapshot("acme").unwrap(), Some(ts("2025-01-03-0900")));
        assert_eq!(store.previous_snapshot("acme").unwrap(), Some(ts("2025-01-01-0900")));
    }

    #[test]
    fn test_result_sets_are_normalized_on_write() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let findings = json!([
            {"path": "b.py", "start": {"line": 1}, "check_id": "x"},
            {"path": "a.py", "start": {"line": 5}, "check_id": "x"}
        ]);

        let mut handle = store.create_snapshot("acme", ts("2025-01-01-0900")).unwrap();
        store
            .write_result_set(&mut handle, ResultKind::Semgrep, &semgrep(findings))
            .unwrap();
        store.commit(handle).unwrap();

        let stored = store
            .read_result_set("acme", ts("2025-01-01-0900"), ResultKind::Semgrep)
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_slice(&stored).unwrap();
        assert_eq!(value["results"][0]["path"], "a.py");
        assert_eq!(
            store.result_kinds("acme", ts("2025-01-01-0900")).unwrap(),
            [ResultKind::Semgrep]
        );
        assert!(store
            .read_result_set("acme", ts("2025-01-01-0900"), ResultKind::Kics)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_compressed_result_sets_read_back() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), true);
        let raw = b"{\"DetectorName\":\"AWS\",\"Raw\":\"AKIA\"}\n";

        let mut handle = store.create_snapshot("acme", ts("2025-01-01-0900")).unwrap();
        store
            .write_result_set(&mut handle, ResultKind::Trufflehog, raw)
            .unwrap();
        store.commit(handle).unwrap();

        let dir_path = store.snapshot_dir("acme", ts("2025-01-01-0900"));
        assert!(dir_path.join("trufflehog.json.gz").is_file());
        let back = store
            .read_result_set("acme", ts("2025-01-01-0900"), ResultKind::Trufflehog)
            .unwrap()
            .unwrap();
        assert_eq!(back, normalize::normalize(ResultKind::Trufflehog, raw).unwrap());
    }

    #[test]
    fn test_invalid_content_rejected() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let mut handle = store.create_snapshot("acme", ts("2025-01-01-0900")).unwrap();
        let err = store
            .write_result_set(&mut handle, ResultKind::Semgrep, b"{not json")
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
        assert!(handle.written().is_empty());
    }

    #[test]
    fn test_invalid_org_name_rejected() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let err = store.create_snapshot("../evil", ts("2025-01-01-0900")).unwrap_err();
        assert_eq!(err.kind(), "InvalidName");
    }
}
