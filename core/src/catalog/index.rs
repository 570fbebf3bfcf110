//! Index Store: the list of tracked orgs.
//!
//! Mutations run inside `IndexBackend::transact`, which gives the closure an
//! exclusive, consistent copy of the document and commits it only when the
//! closure succeeds.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;
use log::info;

use super::fsio::{self, FileLock, LockPolicy};
use crate::error::{CatalogError, Op, Result};
use crate::model::{IndexDocument, OrgStatus, Platform, TimestampId, TrackedOrg};

pub const INDEX_FILE: &str = "index.json";
pub const INDEX_LOCK_FILE: &str = "index.json.lock";

/// Storage behind the Index Store.
pub trait IndexBackend: Send + Sync {
    /// Reads one consistent version of the document.
    fn load(&self, op: Op<'_>) -> Result<IndexDocument>;

    /// Runs `apply` against the current document under mutual exclusion and
    /// commits the result if `apply` returns `Ok`. On error nothing is
    /// written.
    fn transact(
        &self,
        op: Op<'_>,
        apply: &mut dyn FnMut(&mut IndexDocument) -> Result<()>,
    ) -> Result<IndexDocument>;
}

/// `index.json` on disk, guarded by `index.json.lock`.
pub struct FileIndex {
    path: PathBuf,
    lock_path: PathBuf,
    policy: LockPolicy,
}

impl FileIndex {
    pub fn new(root: &Path, policy: LockPolicy) -> Self {
        Self {
            path: root.join(INDEX_FILE),
            lock_path: root.join(INDEX_LOCK_FILE),
            policy,
        }
    }

    fn read_document(&self, op: Op<'_>) -> Result<IndexDocument> {
        let Some(bytes) = fsio::read_optional(op, &self.path)? else {
            return Ok(IndexDocument::default());
        };
        let doc: IndexDocument = serde_json::from_slice(&bytes)
            .map_err(|e| CatalogError::malformed(op, &self.path, e))?;
        doc.check_invariants()
            .map_err(|detail| CatalogError::malformed(op, &self.path, detail))?;
        Ok(doc)
    }
}

impl IndexBackend for FileIndex {
    fn load(&self, op: Op<'_>) -> Result<IndexDocument> {
        self.read_document(op)
    }

    fn transact(
        &self,
        op: Op<'_>,
        apply: &mut dyn FnMut(&mut IndexDocument) -> Result<()>,
    ) -> Result<IndexDocument> {
        let _lock = FileLock::acquire(op, &self.lock_path, &self.policy)?;
        let mut doc = self.read_document(op)?;
        apply(&mut doc)?;
        let mut bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| CatalogError::malformed(op, &self.path, e))?;
        bytes.push(b'\n');
        fsio::write_atomic(op, &self.path, &bytes)?;
        Ok(doc)
    }
}

/// In-process backend for tests.
#[derive(Default)]
pub struct MemoryIndex {
    doc: Mutex<IndexDocument>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexBackend for MemoryIndex {
    fn load(&self, _op: Op<'_>) -> Result<IndexDocument> {
        Ok(self.doc.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn transact(
        &self,
        _op: Op<'_>,
        apply: &mut dyn FnMut(&mut IndexDocument) -> Result<()>,
    ) -> Result<IndexDocument> {
        let mut guard = self.doc.lock().unwrap_or_else(|p| p.into_inner());
        let mut working = guard.clone();
        apply(&mut working)?;
        *guard = working.clone();
        Ok(working)
    }
}

/// Filter for `list` and the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Active,
    Archived,
}

impl StatusFilter {
    pub fn matches(&self, org: &TrackedOrg) -> bool {
        match self {
            StatusFilter::Active => org.status == OrgStatus::Active,
            StatusFilter::Archived => org.status == OrgStatus::Archived,
        }
    }
}

/// Typed operations over an `IndexBackend`.
pub struct IndexStore<B: IndexBackend> {
    backend: B,
}

impl<B: IndexBackend> IndexStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn track(
        &self,
        name: &str,
        platform: Platform,
        program_url: Option<String>,
        today: NaiveDate,
    ) -> Result<TrackedOrg> {
        self.track_with_history(name, platform, program_url, today, &[])
    }

    /// Tracks `name`, adopting snapshots already on disk so that
    /// `scan_count` keeps matching the snapshot store.
    pub fn track_with_history(
        &self,
        name: &str,
        platform: Platform,
        program_url: Option<String>,
        today: NaiveDate,
        existing: &[TimestampId],
    ) -> Result<TrackedOrg> {
        let op = Op::new("track", name);
        let mut org = TrackedOrg::new(name, platform, program_url, today);
        org.scan_count = existing.len() as u64;
        org.last_scan = existing.iter().max().copied();

        self.backend.transact(op, &mut |doc| {
            if doc.contains(name) {
                return Err(CatalogError::AlreadyTracked {
                    action: op.action,
                    org: name.to_string(),
                });
            }
            doc.tracked_orgs.push(org.clone());
            Ok(())
        })?;
        info!("tracking {} ({})", name, platform);
        Ok(org)
    }

    pub fn untrack(&self, name: &str) -> Result<TrackedOrg> {
        let op = Op::new("untrack", name);
        let mut removed = None;
        self.backend.transact(op, &mut |doc| {
            let pos = doc
                .tracked_orgs
                .iter()
                .position(|o| o.name == name)
                .ok_or_else(|| CatalogError::not_tracked(op))?;
            removed = Some(doc.tracked_orgs.remove(pos));
            Ok(())
        })?;
        info!("untracked {}", name);
        removed.ok_or_else(|| CatalogError::not_tracked(op))
    }

    /// Records a completed scan. The id must be newer than `last_scan`.
    pub fn record_scan(&self, name: &str, timestamp: TimestampId) -> Result<TrackedOrg> {
        let op = Op::new("record-scan", name);
        let doc = self.backend.transact(op, &mut |doc| {
            let org = doc.get_mut(name).ok_or_else(|| CatalogError::not_tracked(op))?;
            if org.last_scan.is_some_and(|last| last >= timestamp) {
                return Err(CatalogError::duplicate(op, timestamp));
            }
            org.last_scan = Some(timestamp);
            org.scan_count += 1;
            Ok(())
        })?;
        let org = doc.get(name).cloned().ok_or_else(|| CatalogError::not_tracked(op))?;
        info!("recorded scan {} for {} (scan #{})", timestamp, name, org.scan_count);
        Ok(org)
    }

    pub fn set_status(&self, name: &str, status: OrgStatus, today: NaiveDate) -> Result<TrackedOrg> {
        self.set_status_with(name, status, today, &mut |_, _| Ok(()))
    }

    /// `set_status` with a hook run inside the transaction whenever the
    /// status actually changes. A hook error aborts the index commit.
    pub fn set_status_with(
        &self,
        name: &str,
        status: OrgStatus,
        today: NaiveDate,
        on_change: &mut dyn FnMut(&TrackedOrg, &TrackedOrg) -> Result<()>,
    ) -> Result<TrackedOrg> {
        let op = Op::new("set-status", name);
        let current = self.get(name)?.ok_or_else(|| CatalogError::not_tracked(op))?;
        if current.status == status {
            return Ok(current);
        }

        let doc = self.backend.transact(op, &mut |doc| {
            let org = doc.get_mut(name).ok_or_else(|| CatalogError::not_tracked(op))?;
            let before = org.clone();
            if org.apply_status(status, today) {
                on_change(&before, org)?;
            }
            Ok(())
        })?;
        let org = doc.get(name).cloned().ok_or_else(|| CatalogError::not_tracked(op))?;
        info!("{} is now {}", name, org.status);
        Ok(org)
    }

    /// Tracked orgs sorted by name.
    pub fn list(&self, filter: Option<StatusFilter>) -> Result<Vec<TrackedOrg>> {
        let doc = self.backend.load(Op::new("list", "*"))?;
        let mut orgs: Vec<TrackedOrg> = doc
            .tracked_orgs
            .into_iter()
            .filter(|o| filter.map_or(true, |f| f.matches(o)))
            .collect();
        orgs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(orgs)
    }

    pub fn get(&self, name: &str) -> Result<Option<TrackedOrg>> {
        let doc = self.backend.load(Op::new("get", name))?;
        Ok(doc.get(name).cloned())
    }

    pub fn require(&self, action: &'static str, name: &str) -> Result<TrackedOrg> {
        let doc = self.backend.load(Op::new(action, name))?;
        doc.get(name)
            .cloned()
            .ok_or_else(|| CatalogError::not_tracked(Op::new(action, name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    fn ts(s: &str) -> TimestampId {
        s.parse().unwrap()
    }

    fn memory_store() -> IndexStore<MemoryIndex> {
        IndexStore::new(MemoryIndex::new())
    }

    #[test]
    fn test_track_twice_fails_already_tracked() {
        let store = memory_store();
        store.track("acme", Platform::Hackerone, None, day(1)).unwrap();
        let err = store.track("acme", Platform::Bugcrowd, None, day(2)).unwrap_err();
        assert_eq!(err.kind(), "AlreadyTracked");
        assert_eq!(store.list(None).unwrap().len(), 1);
        assert_eq!(store.get("acme").unwrap().unwrap().platform, Platform::Hackerone);
    }

    #[test]
    fn test_new_org_defaults() {
        let store = memory_store();
        let org = store.track("acme", Platform::Intigriti, None, day(3)).unwrap();
        assert_eq!(org.scan_count, 0);
        assert_eq!(org.status, OrgStatus::Active);
        assert_eq!(org.last_scan, None);
        assert_eq!(org.added_date, day(3));
    }

    #[test]
    fn test_untrack_unknown_fails() {
        let store = memory_store();
        assert_eq!(store.untrack("ghost").unwrap_err().kind(), "NotTracked");
        store.track("acme", Platform::Hackerone, None, day(1)).unwrap();
        store.untrack("acme").unwrap();
        assert!(store.get("acme").unwrap().is_none());
    }

    #[test]
    fn test_record_scan_bumps_count_and_rejects_replay() {
        let store = memory_store();
        store.track("acme", Platform::Hackerone, None, day(1)).unwrap();

        let org = store.record_scan("acme", ts("2025-01-01-0900")).unwrap();
        assert_eq!(org.scan_count, 1);
        assert_eq!(org.last_scan, Some(ts("2025-01-01-0900")));

        let err = store.record_scan("acme", ts("2025-01-01-0900")).unwrap_err();
        assert_eq!(err.kind(), "DuplicateTimestamp");
        let err = store.record_scan("acme", ts("2024-12-31-0900")).unwrap_err();
        assert_eq!(err.kind(), "DuplicateTimestamp");

        let org = store.record_scan("acme", ts("2025-01-02-0900")).unwrap();
        assert_eq!(org.scan_count, 2);
        assert_eq!(store.record_scan("ghost", ts("2025-01-02-0900")).unwrap_err().kind(), "NotTracked");
    }

    #[test]
    fn test_set_status_round_trip() {
        let store = memory_store();
        store.track("acme", Platform::Hackerone, None, day(1)).unwrap();

        let org = store.set_status("acme", OrgStatus::Archived, day(4)).unwrap();
        assert_eq!(org.archived_date, Some(day(4)));

        let org = store.set_status("acme", OrgStatus::Archived, day(9)).unwrap();
        assert_eq!(org.archived_date, Some(day(4)));

        let org = store.set_status("acme", OrgStatus::Active, day(9)).unwrap();
        assert_eq!(org.archived_date, None);
        assert_eq!(store.set_status("ghost", OrgStatus::Active, day(9)).unwrap_err().kind(), "NotTracked");
    }

    #[test]
    fn test_hook_error_aborts_status_change() {
        let store = memory_store();
        store.track("acme", Platform::Hackerone, None, day(1)).unwrap();
        let err = store
            .set_status_with("acme", OrgStatus::Archived, day(2), &mut |_, after| {
                Err(CatalogError::invalid(Op::new("set-status", &after.name), "hook failed"))
            })
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
        assert_eq!(store.get("acme").unwrap().unwrap().status, OrgStatus::Active);
    }

    #[test]
    fn test_list_filters_and_sorts() {
        let store = memory_store();
        for name in ["zeta", "alpha", "mid"] {
            store.track(name, Platform::Hackerone, None, day(1)).unwrap();
        }
        store.set_status("mid", OrgStatus::Archived, day(2)).unwrap();

        let names = |orgs: Vec<TrackedOrg>| orgs.into_iter().map(|o| o.name).collect::<Vec<_>>();
        assert_eq!(names(store.list(None).unwrap()), ["alpha", "mid", "zeta"]);
        assert_eq!(names(store.list(Some(StatusFilter::Active)).unwrap()), ["alpha", "zeta"]);
        assert_eq!(names(store.list(Some(StatusFilter::Archived)).unwrap()), ["mid"]);
    }

    #[test]
    fn test_track_adopts_existing_history() {
        let store = memory_store();
        let history = [ts("2025-01-01-0900"), ts("2025-01-03-0900")];
        let org = store
            .track_with_history("acme", Platform::Hackerone, None, day(5), &history)
            .unwrap();
        assert_eq!(org.scan_count, 2);
        assert_eq!(org.last_scan, Some(ts("2025-01-03-0900")));
    }

    #[test]
    fn test_file_index_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(FileIndex::new(dir.path(), LockPolicy::default()));
        store
            .track("acme", Platform::Yeswehack, Some("https://yeswehack.com/acme".into()), day(1))
            .unwrap();
        store.record_scan("acme", ts("2025-01-01-0900")).unwrap();

        let reopened = IndexStore::new(FileIndex::new(dir.path(), LockPolicy::default()));
        let org = reopened.get("acme").unwrap().unwrap();
        assert_eq!(org.scan_count, 1);
        assert_eq!(org.program_url.as_deref(), Some("https://yeswehack.com/acme"));

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join(INDEX_FILE)).unwrap()).unwrap();
        assert_eq!(raw["tracked_orgs"][0]["last_scan"], "2025-01-01-0900");
    }

    #[test]
    fn test_file_index_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(FileIndex::new(dir.path(), LockPolicy::default()));
        assert!(store.list(None).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_index_is_refused() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(INDEX_FILE), "{ \"tracked_orgs\": [ { \"name\": 5 } ] }").unwrap();
        let store = IndexStore::new(FileIndex::new(dir.path(), LockPolicy::default()));

        let err = store.list(None).unwrap_err();
        assert_eq!(err.kind(), "MalformedStore");
        let err = store.track("acme", Platform::Hackerone, None, day(1)).unwrap_err();
        assert_eq!(err.kind(), "MalformedStore");

        let untouched = fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        assert!(untouched.contains("\"name\": 5"));
    }

    #[test]
    fn test_concurrent_writers_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let root = Arc::new(dir.path().to_path_buf());
        let policy = LockPolicy {
            attempts: 200,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(10),
        };

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let root = Arc::clone(&root);
                thread::spawn(move || {
                    let store = IndexStore::new(FileIndex::new(&root, policy));
                    store
                        .track(&format!("org{}", i), Platform::Hackerone, None, day(1))
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let store = IndexStore::new(FileIndex::new(&root, policy));
        assert_eq!(store.list(None).unwrap().len(), 8);
    }

    #[test]
    fn test_memory_backend_concurrent_scans_count_exactly() {
        let store = Arc::new(memory_store());
        store.track("acme", Platform::Hackerone, None, day(1)).unwrap();

        let handles: Vec<_> = (0..10u32)
            .map(|minute| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let id = ts(&format!("2025-01-01-09{:02}", minute));
                    store.record_scan("acme", id).is_ok()
                })
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        let org = store.get("acme").unwrap().unwrap();
        assert_eq!(org.scan_count as usize, successes);
        assert!(successes >= 1);
    }
}
