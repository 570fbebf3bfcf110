use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

use crate::catalog::snapshot::SnapshotStore;
use crate::error::{CatalogError, Op, Result};
use crate::model::TimestampId;
use crate::normalize::{self, Identity, ResultKind};

/// Change-set for one result kind between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindDiff {
    pub kind: ResultKind,
    pub added: Vec<Value>,
    pub removed: Vec<Value>,
    pub unchanged_count: usize,
}

impl KindDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

fn load_entries(
    store: &SnapshotStore,
    org: &str,
    timestamp: TimestampId,
    kind: ResultKind,
) -> Result<Vec<Value>> {
    let op = Op::new("diff", org);
    let Some(content) = store.read_result_set(org, timestamp, kind)? else {
        return Ok(Vec::new());
    };
    normalize::entries(kind, &content).map_err(|e| {
        CatalogError::malformed(op, store.snapshot_dir(org, timestamp).join(kind.as_str()), e)
    })
}

fn group(kind: ResultKind, entries: Vec<Value>) -> BTreeMap<Identity, Vec<Value>> {
    let mut groups: BTreeMap<Identity, Vec<Value>> = BTreeMap::new();
    for entry in entries {
        groups.entry(normalize::identity(kind, &entry)).or_default().push(entry);
    }
    groups
}

/// Compares two entry lists by identity. Entries sharing an identity are
/// matched pairwise, so repeated findings are counted rather than collapsed.
/// Both `added` and `removed` come out in identity order.
pub fn diff_entries(kind: ResultKind, old: Vec<Value>, new: Vec<Value>) -> KindDiff {
    let mut old = group(kind, old);
    let mut new = group(kind, new);
    let identities: BTreeSet<Identity> = old.keys().chain(new.keys()).cloned().collect();
    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut unchanged_count = 0;

    for identity in identities {
        let before = old.remove(&identity).unwrap_or_default();
        let after = new.remove(&identity).unwrap_or_default();
        let kept = before.len().min(after.len());
        unchanged_count += kept;
        added.extend(after.into_iter().skip(kept));
        removed.extend(before.into_iter().skip(kept));
    }

    KindDiff {
        kind,
        added,
        removed,
        unchanged_count,
    }
}

/// Diffs one kind between snapshots `old` and `new`. A kind missing from a
/// snapshot counts as empty.
pub fn diff(
    store: &SnapshotStore,
    org: &str,
    old: TimestampId,
    new: TimestampId,
    kind: ResultKind,
) -> Result<KindDiff> {
    for ts in [old, new] {
        if !store.has_snapshot(org, ts) {
            return Err(CatalogError::invalid(
                Op::new("diff", org),
                format!("no snapshot {} for '{}'", ts, org),
            ));
        }
    }
    let before = load_entries(store, org, old, kind)?;
    let after = load_entries(store, org, new, kind)?;
    Ok(diff_entries(kind, before, after))
}

pub fn diff_all(store: &SnapshotStore, org: &str, old: TimestampId, new: TimestampId) -> Result<Vec<KindDiff>> {
    ResultKind::ALL
        .into_iter()
        .map(|kind| diff(store, org, old, new, kind))
        .collect()
}

/// Source excerpt of a semgrep finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeSnippet {
    pub path: String,
    pub line: u64,
    pub check_id: String,
    pub lines: String,
}

impl CodeSnippet {
    pub fn from_semgrep(entry: &Value) -> Option<Self> {
        let lines = entry.pointer("/extra/lines")?.as_str()?;
        Some(Self {
            path: entry.get("path")?.as_str()?.to_string(),
            line: entry.pointer("/start/line").and_then(Value::as_u64).unwrap_or(0),
            check_id: entry.get("check_id").and_then(Value::as_str).unwrap_or("").to_string(),
            lines: lines.to_string(),
        })
    }
}

/// One-line description of an entry for terminal listings.
pub fn describe(kind: ResultKind, entry: &Value) -> String {
    let s = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or("?").to_string();
    match kind {
        ResultKind::Semgrep => format!(
            "{}:{} {}",
            s(entry.get("path")),
            entry.pointer("/start/line").and_then(Value::as_u64).unwrap_or(0),
            s(entry.get("check_id"))
        ),
        ResultKind::Trufflehog => {
            let file = entry
                .pointer("/SourceMetadata/Data")
                .and_then(Value::as_object)
                .and_then(|data| data.values().find_map(|src| src.get("file")))
                .or_else(|| entry.get("file"));
            format!("{} {}", s(file), s(entry.get("DetectorName")))
        }
        ResultKind::Kics => format!(
            "{}:{} {}",
            s(entry.get("file_name")),
            entry.get("line").and_then(Value::as_u64).unwrap_or(0),
            s(entry.get("query_name"))
        ),
        ResultKind::Artifacts => format!("[{}] {}", s(entry.get("category")), s(entry.get("path"))),
        ResultKind::Commits => {
            let sha: String = s(entry.get("sha")).chars().take(10).collect();
            format!("{} {} {}", s(entry.get("repo")), sha, s(entry.get("message")))
        }
    }
}
