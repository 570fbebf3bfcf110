pub mod fsio;
pub mod index;
pub mod meta;
pub mod snapshot;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde_json::{Map, Value};

use crate::error::{CatalogError, Op, Result};
use crate::model::{
    validate_name, validate_program_url, Clock, OrgStatus, Platform, SystemClock, TimestampId,
    TrackedOrg,
};
use crate::normalize::ResultKind;
use crate::report::diff::{self, KindDiff};
use crate::report::status::{self, DashboardRow, Staleness};
use crate::CatalogConfig;

use index::{FileIndex, IndexBackend, IndexStore, StatusFilter};
use meta::{MetaStore, OrgMeta};
use snapshot::{SnapshotHandle, SnapshotStore};

pub const TRACKED_DIR: &str = "tracked";
pub const TRASH_DIR: &str = ".trash";

/// The catalog: index, per-org metadata and scan snapshots under one root.
///
/// Operations that touch more than one store are sequenced here so that a
/// failure part-way leaves the stores consistent with each other.
pub struct Catalog<B: IndexBackend = FileIndex> {
    root: PathBuf,
    index: IndexStore<B>,
    meta: MetaStore,
    snapshots: SnapshotStore,
    clock: Box<dyn Clock>,
}

impl Catalog<FileIndex> {
    /// Opens the catalog at `root` with the file-backed index and the system
    /// clock. The directory is created on first write.
    pub fn open(root: &Path, config: CatalogConfig) -> Self {
        let backend = FileIndex::new(root, config.lock_policy());
        Self::with_backend(root, config, backend, Box::new(SystemClock))
    }
}

impl<B: IndexBackend> Catalog<B> {
    pub fn with_backend(root: &Path, config: CatalogConfig, backend: B, clock: Box<dyn Clock>) -> Self {
        let tracked = root.join(TRACKED_DIR);
        Self {
            root: root.to_path_buf(),
            index: IndexStore::new(backend),
            meta: MetaStore::new(&tracked),
            snapshots: SnapshotStore::new(&tracked, config.compress),
            clock,
        }
    }

    pub fn index(&self) -> &IndexStore<B> {
        &self.index
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn org_dir(&self, name: &str) -> PathBuf {
        self.root.join(TRACKED_DIR).join(name)
    }

    /// Starts tracking an org and seeds its metadata file.
    ///
    /// Snapshots left on disk by an earlier non-cascading untrack are
    /// adopted, so `scan_count` reflects them.
    pub fn track(&self, name: &str, platform: Platform, program_url: Option<&str>) -> Result<TrackedOrg> {
        let op = Op::new("track", name);
        validate_name(op.action, name)?;
        let program_url = program_url
            .map(|raw| validate_program_url(op, raw))
            .transpose()?;

        let history = self.snapshots.list_snapshots(name)?;
        // a meta.json that does not parse is reported, never overwritten
        let previous_meta = self.meta.read_raw(op, name)?.map(|(_, bytes)| bytes);

        let org = self
            .index
            .track_with_history(name, platform, program_url, self.clock.today(), &history)?;

        let mut seed = OrgMeta::seed(&org).extra;
        seed.retain(|_, v| !v.is_null());
        if let Err(e) = self.meta.write_meta(&org, &seed) {
            warn!("track {}: metadata write failed, rolling back index entry", name);
            if let Err(restore) = self.meta.restore(op, name, previous_meta.as_deref()) {
                warn!("track {}: previous metadata could not be restored: {}", name, restore);
            }
            if let Err(rollback) = self.index.untrack(name) {
                warn!("track {}: index entry could not be rolled back: {}", name, rollback);
            }
            return Err(e);
        }
        Ok(org)
    }

    /// Stops tracking an org. With `cascade`, its metadata and every snapshot
    /// are deleted as well; either all of that happens or none of it.
    pub fn untrack(&self, name: &str, cascade: bool) -> Result<TrackedOrg> {
        let op = Op::new("untrack", name);
        validate_name(op.action, name)?;
        self.index.require(op.action, name)?;

        if !cascade {
            return self.index.untrack(name);
        }

        let org_dir = self.org_dir(name);
        let trash_root = self.root.join(TRASH_DIR);
        let staged = trash_root.join(format!(
            "{}.{}",
            name,
            self.clock.now().format("%Y%m%d%H%M%S%f")
        ));

        let moved = match fs::create_dir_all(&trash_root).and_then(|_| fs::rename(&org_dir, &staged)) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound && !org_dir.exists() => false,
            Err(e) => return Err(CatalogError::io(op, &org_dir, e)),
        };

        match self.index.untrack(name) {
            Ok(org) => {
                if moved {
                    if let Err(e) = fs::remove_dir_all(&staged) {
                        warn!(
                            "untrack {}: entry removed but {} could not be deleted: {}",
                            name,
                            staged.display(),
                            e
                        );
                    }
                }
                info!("untracked {} and deleted its data", name);
                Ok(org)
            }
            Err(err) => {
                if moved {
                    fs::rename(&staged, &org_dir).map_err(|e| CatalogError::io(op, &org_dir, e))?;
                }
                Err(err)
            }
        }
    }

    /// Changes an org's status in the index and its metadata together.
    pub fn set_status(&self, name: &str, status: OrgStatus) -> Result<TrackedOrg> {
        let op = Op::new("set-status", name);
        validate_name(op.action, name)?;

        // Some(previous bytes) once meta.json has been rewritten
        let mut meta_written: Option<Option<Vec<u8>>> = None;
        let meta = &self.meta;
        let result = self.index.set_status_with(name, status, self.clock.today(), &mut |_, after| {
            let previous = meta.read_raw(op, name)?;
            let (mut doc, bytes) = match previous {
                Some((doc, bytes)) => (doc, Some(bytes)),
                None => (OrgMeta::seed(after), None),
            };
            doc.mirror(after);
            meta.store(op, name, &doc)?;
            meta_written = Some(bytes);
            Ok(())
        });

        match result {
            Ok(org) => Ok(org),
            Err(err) => {
                if let Some(previous) = meta_written {
                    self.meta.restore(op, name, previous.as_deref())?;
                }
                Err(err)
            }
        }
    }

    /// Merges a patch into the org's metadata.
    pub fn write_meta(&self, name: &str, patch: &Map<String, Value>) -> Result<OrgMeta> {
        let org = self.index.require("write-meta", name)?;
        self.meta.write_meta(&org, patch)
    }

    pub fn read_meta(&self, name: &str) -> Result<Option<OrgMeta>> {
        self.index.require("read-meta", name)?;
        self.meta.read_meta(name)
    }

    /// Allocates the snapshot for a new scan stamped with the current minute.
    pub fn begin_scan(&self, name: &str) -> Result<SnapshotHandle> {
        self.begin_scan_at(name, TimestampId::now(self.clock.as_ref()))
    }

    pub fn begin_scan_at(&self, name: &str, timestamp: TimestampId) -> Result<SnapshotHandle> {
        let op = Op::new("scan", name);
        let org = self.index.require(op.action, name)?;
        if org.last_scan.is_some_and(|last| last >= timestamp) {
            return Err(CatalogError::duplicate(op, timestamp));
        }
        self.snapshots.create_snapshot(name, timestamp)
    }

    pub fn write_result_set(&self, handle: &mut SnapshotHandle, kind: ResultKind, content: &[u8]) -> Result<()> {
        self.snapshots.write_result_set(handle, kind, content)
    }

    /// Publishes the snapshot and records it in the index. If recording
    /// fails the snapshot is withdrawn again.
    pub fn finish_scan(&self, handle: SnapshotHandle) -> Result<TrackedOrg> {
        let org = handle.org().to_string();
        let timestamp = self.snapshots.commit(handle)?;
        match self.index.record_scan(&org, timestamp) {
            Ok(tracked) => Ok(tracked),
            Err(err) => {
                warn!("scan {}: recording {} failed, withdrawing snapshot", org, timestamp);
                self.snapshots.remove_snapshot(&org, timestamp)?;
                Err(err)
            }
        }
    }

    pub fn abort_scan(&self, handle: SnapshotHandle) -> Result<()> {
        self.snapshots.discard(handle)
    }

    pub fn staleness(&self, name: &str, stale_days: u32) -> Result<Staleness> {
        let org = self.index.require("status", name)?;
        Ok(status::staleness(&org, stale_days, self.clock.now()))
    }

    pub fn dashboard(&self, filter: Option<StatusFilter>, stale_days: u32) -> Result<Vec<DashboardRow>> {
        let orgs = self.index.list(filter)?;
        Ok(status::dashboard(&orgs, stale_days, self.clock.now()))
    }

    /// Resolves optional diff endpoints, defaulting to previous → latest.
    pub fn resolve_pair(
        &self,
        name: &str,
        old: Option<TimestampId>,
        new: Option<TimestampId>,
    ) -> Result<(TimestampId, TimestampId)> {
        let op = Op::new("diff", name);
        self.index.require(op.action, name)?;
        let ids = self.snapshots.list_snapshots(name)?;
        for id in old.iter().chain(new.iter()) {
            if !ids.contains(id) {
                return Err(CatalogError::invalid(op, format!("no snapshot {} for '{}'", id, name)));
            }
        }
        let new = match new {
            Some(id) => id,
            None => *ids
                .last()
                .ok_or_else(|| CatalogError::invalid(op, format!("'{}' has no snapshots", name)))?,
        };
        let old = match old {
            Some(id) => id,
            None => ids
                .iter()
                .rev()
                .find(|id| **id < new)
                .copied()
                .ok_or_else(|| {
                    CatalogError::invalid(op, format!("'{}' has no snapshot older than {}", name, new))
                })?,
        };
        Ok((old, new))
    }

    pub fn diff(&self, name: &str, old: TimestampId, new: TimestampId, kind: ResultKind) -> Result<KindDiff> {
        self.index.require("diff", name)?;
        diff::diff(&self.snapshots, name, old, new, kind)
    }

    pub fn diff_all(&self, name: &str, old: TimestampId, new: TimestampId) -> Result<Vec<KindDiff>> {
        self.index.require("diff", name)?;
        diff::diff_all(&self.snapshots, name, old, new)
    }
}
