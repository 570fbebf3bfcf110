use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::normalize::ResultKind;
use crate::SinkRef;

/// Entries one scanner produced for one repository.
#[derive(Debug)]
pub struct RepoOutput {
    pub kind: ResultKind,
    pub repo: String,
    pub entries: Vec<Value>,
}

/// Collects per-repository output into one entry list per kind.
pub struct ResultAggregator;

impl ResultAggregator {
    pub async fn run(mut receiver: mpsc::Receiver<RepoOutput>, sink: SinkRef) -> BTreeMap<ResultKind, Vec<Value>> {
        let mut merged: BTreeMap<ResultKind, Vec<Value>> = BTreeMap::new();
        while let Some(output) = receiver.recv().await {
            if !output.entries.is_empty() {
                let message = format!("[+] {} {}: {} entries", output.kind, output.repo, output.entries.len());
                sink.on_log("info", &message);
            }
            merged.entry(output.kind).or_default().extend(output.entries);
        }
        merged
    }
}

/// Serializes merged entries in the container shape stored for `kind`.
pub fn render(kind: ResultKind, entries: Vec<Value>) -> Vec<u8> {
    let doc = match kind {
        ResultKind::Trufflehog => {
            let mut out = Vec::new();
            for entry in entries {
                out.extend_from_slice(entry.to_string().as_bytes());
                out.push(b'\n');
            }
            return out;
        }
        ResultKind::Semgrep => json!({ "results": entries }),
        ResultKind::Artifacts => json!({ "artifacts": entries }),
        ResultKind::Commits => json!({ "commits": entries }),
        ResultKind::Kics => json!({ "queries": merge_kics_queries(entries) }),
    };
    doc.to_string().into_bytes()
}

/// Queries reported by several repositories become one query whose `files`
/// is the union.
fn merge_kics_queries(queries: Vec<Value>) -> Vec<Value> {
    let mut by_name: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    for query in queries {
        let Value::Object(mut query) = query else {
            continue;
        };
        let name = query
            .get("query_id")
            .or_else(|| query.get("query_name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let files = match query.remove("files") {
            Some(Value::Array(files)) => files,
            _ => Vec::new(),
        };
        let slot = by_name.entry(name).or_insert_with(|| {
            let mut q = query;
            q.insert("files".into(), Value::Array(Vec::new()));
            q
        });
        if let Some(Value::Array(existing)) = slot.get_mut("files") {
            existing.extend(files);
        }
    }
    by_name.into_values().map(Value::Object).collect()
}
