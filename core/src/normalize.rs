//! Canonical ordering of scanner output.
//!
//! `normalize` is a pure function of the logical content: entries are sorted
//! by a per-kind key, ties fall back to the entry's canonical JSON text, and
//! object keys come out sorted. Equal content therefore gives equal bytes no
//! matter what order the scanner emitted it in, and normalizing twice is the
//! same as normalizing once.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// One scanner's output within a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Semgrep,
    Trufflehog,
    Artifacts,
    Kics,
    Commits,
}

impl ResultKind {
    pub const ALL: [ResultKind; 5] = [
        ResultKind::Semgrep,
        ResultKind::Trufflehog,
        ResultKind::Artifacts,
        ResultKind::Kics,
        ResultKind::Commits,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Semgrep => "semgrep",
            ResultKind::Trufflehog => "trufflehog",
            ResultKind::Artifacts => "artifacts",
            ResultKind::Kics => "kics",
            ResultKind::Commits => "commits",
        }
    }

    /// trufflehog is stored as newline-delimited JSON.
    pub fn is_ndjson(&self) -> bool {
        matches!(self, ResultKind::Trufflehog)
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        ResultKind::ALL
            .into_iter()
            .find(|k| k.as_str() == lower)
            .ok_or_else(|| {
                format!(
                    "unknown result kind '{}' (expected semgrep, trufflehog, artifacts, kics or commits)",
                    s
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    InvalidJson { line: Option<usize>, detail: String },
    UnexpectedShape(String),
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeError::InvalidJson { line: Some(n), detail } => {
                write!(f, "invalid JSON on line {}: {}", n, detail)
            }
            NormalizeError::InvalidJson { line: None, detail } => write!(f, "invalid JSON: {}", detail),
            NormalizeError::UnexpectedShape(detail) => write!(f, "unexpected shape: {}", detail),
        }
    }
}

impl std::error::Error for NormalizeError {}

/// Component of a sort or identity key.
#[derive(Debug, Clone)]
enum KeyPart {
    Missing,
    Num(f64),
    Text(String),
}

impl KeyPart {
    fn of(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => KeyPart::Missing,
            Some(Value::Number(n)) => n.as_f64().map(KeyPart::Num).unwrap_or(KeyPart::Missing),
            Some(Value::String(s)) => KeyPart::Text(s.clone()),
            Some(other) => KeyPart::Text(other.to_string()),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            KeyPart::Missing => Value::Null,
            KeyPart::Num(n) if n.fract() == 0.0 && n.abs() < 1e15 => Value::from(*n as i64),
            KeyPart::Num(n) => Value::from(*n),
            KeyPart::Text(s) => Value::String(s.clone()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            KeyPart::Missing => 0,
            KeyPart::Num(_) => 1,
            KeyPart::Text(_) => 2,
        }
    }
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyPart {}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyPart::Num(a), KeyPart::Num(b)) => a.total_cmp(b),
            (KeyPart::Text(a), KeyPart::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

fn lookup<'a>(entry: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(entry, |v, key| v.get(*key))
}

/// File a trufflehog finding points at, whatever source produced it.
fn trufflehog_file(entry: &Value) -> Option<&Value> {
    if let Some(Value::Object(sources)) = lookup(entry, &["SourceMetadata", "Data"]) {
        let mut names: Vec<&String> = sources.keys().collect();
        names.sort();
        for name in names {
            if let Some(file) = sources[name].get("file") {
                return Some(file);
            }
        }
    }
    entry.get("file")
}

fn sort_key(kind: ResultKind, entry: &Value) -> Vec<KeyPart> {
    match kind {
        ResultKind::Semgrep => vec![
            KeyPart::of(entry.get("path")),
            KeyPart::of(lookup(entry, &["start", "line"])),
            KeyPart::of(entry.get("check_id")),
        ],
        ResultKind::Trufflehog => vec![
            KeyPart::of(trufflehog_file(entry)),
            KeyPart::of(entry.get("DetectorName")),
        ],
        ResultKind::Kics => vec![
            KeyPart::of(entry.get("query_name")),
            KeyPart::of(entry.get("file_name")),
            KeyPart::of(entry.get("line")),
        ],
        ResultKind::Artifacts => vec![
            KeyPart::of(entry.get("category")),
            KeyPart::of(entry.get("path")),
        ],
        ResultKind::Commits => vec![
            KeyPart::of(entry.get("repo")),
            KeyPart::of(entry.get("date")),
            KeyPart::of(entry.get("sha")),
        ],
    }
}

/// Key matching one entry across snapshots. Parts are compared typed, so a
/// separator inside a field, a missing field and a numeric field never
/// collide with one another.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Identity(Vec<KeyPart>);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<Value> = self.0.iter().map(KeyPart::to_json).collect();
        write!(f, "{}", Value::Array(parts))
    }
}

/// Identity used to match entries across snapshots.
pub fn identity(kind: ResultKind, entry: &Value) -> Identity {
    let parts = match kind {
        ResultKind::Trufflehog => {
            let mut parts = sort_key(kind, entry);
            let secret = entry.get("Raw").and_then(Value::as_str).unwrap_or("");
            parts.push(KeyPart::Text(secret_hash(secret)));
            parts
        }
        ResultKind::Commits => vec![KeyPart::of(entry.get("repo")), KeyPart::of(entry.get("sha"))],
        _ => sort_key(kind, entry),
    };
    Identity(parts)
}

/// Hex SHA-256 of a secret, used so identities never carry the secret itself.
pub fn secret_hash(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Rebuilds every object with its keys in sorted order, independent of how
/// serde_json's map is configured.
fn canonical(value: Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut fields: Vec<(String, Value)> = obj.into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(fields.into_iter().map(|(k, v)| (k, canonical(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
        other => other,
    }
}

/// Reorders `entries` canonically. Equal keys are ordered by their canonical
/// text so the result does not depend on the input order.
fn sort_entries(kind: ResultKind, entries: &mut Vec<Value>) {
    let mut keyed: Vec<(Vec<KeyPart>, String, Value)> = entries
        .drain(..)
        .map(|e| (sort_key(kind, &e), e.to_string(), e))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    entries.extend(keyed.into_iter().map(|(_, _, e)| e));
}

fn sort_array_field(kind: ResultKind, obj: &mut Map<String, Value>, field: &str) {
    if let Some(Value::Array(items)) = obj.get_mut(field) {
        sort_entries(kind, items);
    }
}

/// Sorts an array of plain strings (semgrep `paths.scanned` and friends).
fn sort_string_list(value: Option<&mut Value>) {
    if let Some(Value::Array(items)) = value {
        if items.iter().all(Value::is_string) {
            items.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
        }
    }
}

fn normalize_semgrep(mut doc: Value) -> Result<Value, NormalizeError> {
    if let Value::Array(results) = doc {
        doc = Value::Object(Map::from_iter([("results".to_string(), Value::Array(results))]));
    }
    let Value::Object(obj) = &mut doc else {
        return Err(NormalizeError::UnexpectedShape(
            "semgrep output must be an object with a results array".into(),
        ));
    };
    sort_array_field(ResultKind::Semgrep, obj, "results");
    if let Some(Value::Array(errors)) = obj.get_mut("errors") {
        errors.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    }
    if let Some(Value::Object(paths)) = obj.get_mut("paths") {
        for list in paths.values_mut() {
            sort_string_list(Some(list));
        }
    }
    Ok(doc)
}

fn normalize_kics(mut doc: Value) -> Result<Value, NormalizeError> {
    match &mut doc {
        Value::Object(obj) => {
            if let Some(Value::Array(queries)) = obj.get_mut("queries") {
                for query in queries.iter_mut() {
                    if let Value::Object(q) = query {
                        sort_array_field(ResultKind::Kics, q, "files");
                    }
                }
                let mut keyed: Vec<(KeyPart, String, Value)> = queries
                    .drain(..)
                    .map(|q| (KeyPart::of(q.get("query_name")), q.to_string(), q))
                    .collect();
                keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                queries.extend(keyed.into_iter().map(|(_, _, q)| q));
            }
            Ok(doc)
        }
        Value::Array(items) => {
            sort_entries(ResultKind::Kics, items);
            Ok(doc)
        }
        _ => Err(NormalizeError::UnexpectedShape(
            "kics output must be an object with a queries array".into(),
        )),
    }
}

/// Shared shape for artifacts and commits: a bare array or an object whose
/// `field` holds the array.
fn normalize_list(kind: ResultKind, field: &str, mut doc: Value) -> Result<Value, NormalizeError> {
    match &mut doc {
        Value::Array(items) => sort_entries(kind, items),
        Value::Object(obj) if matches!(obj.get(field), Some(Value::Array(_))) => {
            sort_array_field(kind, obj, field)
        }
        _ => {
            return Err(NormalizeError::UnexpectedShape(format!(
                "{} output must be an array or an object with a {} array",
                kind, field
            )))
        }
    }
    Ok(doc)
}

/// One JSON value per line. Bytes that are not UTF-8 fail the line they are
/// on instead of being replaced.
fn parse_ndjson(content: &[u8]) -> Result<Vec<Value>, NormalizeError> {
    content
        .split(|b| *b == b'\n')
        .enumerate()
        .filter(|(_, line)| !line.trim_ascii().is_empty())
        .map(|(i, line)| {
            serde_json::from_slice(line.trim_ascii()).map_err(|e| NormalizeError::InvalidJson {
                line: Some(i + 1),
                detail: e.to_string(),
            })
        })
        .collect()
}

/// Parses raw scanner output into its entries, for diffing.
pub fn entries(kind: ResultKind, content: &[u8]) -> Result<Vec<Value>, NormalizeError> {
    if kind.is_ndjson() {
        return parse_ndjson(content);
    }
    let doc: Value = serde_json::from_slice(content).map_err(|e| NormalizeError::InvalidJson {
        line: None,
        detail: e.to_string(),
    })?;
    Ok(entries_of(kind, &doc))
}

fn entries_of(kind: ResultKind, doc: &Value) -> Vec<Value> {
    let list = |field: &str| -> Vec<Value> {
        match doc {
            Value::Array(items) => items.clone(),
            Value::Object(obj) => match obj.get(field) {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    };
    match kind {
        ResultKind::Semgrep => list("results"),
        ResultKind::Artifacts => list("artifacts"),
        ResultKind::Commits => list("commits"),
        ResultKind::Trufflehog => list("findings"),
        ResultKind::Kics => match doc {
            Value::Array(items) => items.clone(),
            _ => flatten_kics(doc),
        },
    }
}

/// One entry per (query, file) pair, carrying the query's name and severity.
fn flatten_kics(doc: &Value) -> Vec<Value> {
    let Some(Value::Array(queries)) = doc.get("queries") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for query in queries {
        let Some(Value::Array(files)) = query.get("files") else {
            continue;
        };
        for file in files {
            let mut entry = match file {
                Value::Object(f) => f.clone(),
                _ => continue,
            };
            for key in ["query_name", "query_id", "severity", "platform"] {
                if let Some(v) = query.get(key) {
                    entry.entry(key.to_string()).or_insert_with(|| v.clone());
                }
            }
            out.push(Value::Object(entry));
        }
    }
    out
}

/// Normalizes raw scanner output of `kind` into its canonical bytes.
pub fn normalize(kind: ResultKind, content: &[u8]) -> Result<Vec<u8>, NormalizeError> {
    if kind.is_ndjson() {
        let mut findings: Vec<Value> = parse_ndjson(content)?.into_iter().map(canonical).collect();
        sort_entries(kind, &mut findings);
        let mut out = Vec::new();
        for finding in &findings {
            out.extend_from_slice(finding.to_string().as_bytes());
            out.push(b'\n');
        }
        return Ok(out);
    }

    let doc: Value = serde_json::from_slice(content).map_err(|e| NormalizeError::InvalidJson {
        line: None,
        detail: e.to_string(),
    })?;
    let doc = canonical(doc);
    let doc = match kind {
        ResultKind::Semgrep => normalize_semgrep(doc)?,
        ResultKind::Kics => normalize_kics(doc)?,
        ResultKind::Artifacts => normalize_list(kind, "artifacts", doc)?,
        ResultKind::Commits => normalize_list(kind, "commits", doc)?,
        ResultKind::Trufflehog => unreachable!("ndjson handled above"),
    };
    let mut out = serde_json::to_vec_pretty(&doc).map_err(|e| NormalizeError::InvalidJson {
        line: None,
        detail: e.to_string(),
    })?;
    out.push(b'\n');
    Ok(out)
}
