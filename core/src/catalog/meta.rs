use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::fsio;
use crate::error::{CatalogError, Op, Result};
use crate::model::{OrgStatus, TrackedOrg};

pub const META_FILE: &str = "meta.json";

/// Keys owned by the Index Store and mirrored here.
const RESERVED_KEYS: &[&str] = &["status", "archived_date"];

/// Per-org metadata document.
///
/// `status` and `archived_date` mirror the index; everything else is free
/// form and kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgMeta {
    pub status: OrgStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_date: Option<NaiveDate>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OrgMeta {
    /// Seed document written when an org is first tracked.
    pub fn seed(org: &TrackedOrg) -> Self {
        let mut extra = Map::new();
        extra.insert("platform".into(), Value::String(org.platform.to_string()));
        extra.insert("added_date".into(), Value::String(org.added_date.to_string()));
        if let Some(url) = &org.program_url {
            extra.insert("program_url".into(), Value::String(url.clone()));
        }
        Self {
            status: org.status,
            archived_date: org.archived_date,
            extra,
        }
    }

    pub fn mirror(&mut self, org: &TrackedOrg) {
        self.status = org.status;
        self.archived_date = org.archived_date;
    }
}

/// Reads and writes `tracked/<org>/meta.json`.
pub struct MetaStore {
    tracked_dir: PathBuf,
}

impl MetaStore {
    pub fn new(tracked_dir: &Path) -> Self {
        Self {
            tracked_dir: tracked_dir.to_path_buf(),
        }
    }

    pub fn path(&self, org: &str) -> PathBuf {
        self.tracked_dir.join(org).join(META_FILE)
    }

    pub fn read_meta(&self, org: &str) -> Result<Option<OrgMeta>> {
        let op = Op::new("read-meta", org);
        Ok(self.read_raw(op, org)?.map(|(meta, _)| meta))
    }

    /// Returns the parsed document together with its exact bytes, so a
    /// caller can restore them if a later step of a transaction fails.
    pub(crate) fn read_raw(&self, op: Op<'_>, org: &str) -> Result<Option<(OrgMeta, Vec<u8>)>> {
        let path = self.path(org);
        let Some(bytes) = fsio::read_optional(op, &path)? else {
            return Ok(None);
        };
        let meta: OrgMeta =
            serde_json::from_slice(&bytes).map_err(|e| CatalogError::malformed(op, &path, e))?;
        if (meta.status == OrgStatus::Archived) != meta.archived_date.is_some() {
            return Err(CatalogError::malformed(
                op,
                &path,
                "status and archived_date disagree",
            ));
        }
        Ok(Some((meta, bytes)))
    }

    /// Shallow-merges `patch` into the org's free-form fields. A `null`
    /// value removes the key.
    pub fn write_meta(&self, org: &TrackedOrg, patch: &Map<String, Value>) -> Result<OrgMeta> {
        let op = Op::new("write-meta", &org.name);
        if let Some(key) = patch.keys().find(|k| RESERVED_KEYS.contains(&k.as_str())) {
            return Err(CatalogError::invalid(
                op,
                format!("'{}' is managed by set-status and cannot be patched", key),
            ));
        }

        let mut meta = match self.read_raw(op, &org.name)? {
            Some((meta, _)) => meta,
            None => OrgMeta::seed(org),
        };
        for (key, value) in patch {
            if value.is_null() {
                meta.extra.remove(key);
            } else {
                meta.extra.insert(key.clone(), value.clone());
            }
        }
        meta.mirror(org);
        self.store(op, &org.name, &meta)?;
        Ok(meta)
    }

    pub(crate) fn store(&self, op: Op<'_>, org: &str, meta: &OrgMeta) -> Result<()> {
        let path = self.path(org);
        let mut bytes =
            serde_json::to_vec_pretty(meta).map_err(|e| CatalogError::malformed(op, &path, e))?;
        bytes.push(b'\n');
        fsio::write_atomic(op, &path, &bytes)
    }

    /// Puts back bytes captured by `read_raw`, or removes the file when
    /// there were none.
    pub(crate) fn restore(&self, op: Op<'_>, org: &str, previous: Option<&[u8]>) -> Result<()> {
        let path = self.path(org);
        match previous {
            Some(bytes) => fsio::write_atomic(op, &path, bytes),
            None => fsio::remove_file_if_exists(op, &path),
        }
    }
}
