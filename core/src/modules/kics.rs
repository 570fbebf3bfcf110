use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use super::{reroot, ScannerTool};
use crate::normalize::ResultKind;
use crate::utils;

pub const REPORT_FILE: &str = "results.json";

pub struct Kics;

#[async_trait]
impl ScannerTool for Kics {
    fn kind(&self) -> ResultKind {
        ResultKind::Kics
    }

    fn binary(&self) -> &'static str {
        "kics"
    }

    fn args(&self, _repo: &Path, scratch: &Path) -> Vec<String> {
        vec![
            "scan".into(),
            "-p".into(),
            ".".into(),
            "-o".into(),
            scratch.display().to_string(),
            "--report-formats".into(),
            "json".into(),
            "--no-progress".into(),
        ]
    }

    /// KICS writes its report to the output directory, not stdout. Each
    /// returned entry is one query with its files.
    async fn collect(&self, repo: &Path, scratch: &Path, _stdout: Vec<u8>) -> anyhow::Result<Vec<Value>> {
        let report = scratch.join(REPORT_FILE);
        let bytes = match tokio::fs::read(&report).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", report.display())),
        };
        parse(repo, &bytes)
    }
}

fn parse(repo: &Path, bytes: &[u8]) -> anyhow::Result<Vec<Value>> {
    let doc: Value = serde_json::from_slice(bytes).context("kics report is not JSON")?;
    let Some(Value::Array(queries)) = doc.get("queries") else {
        return Ok(Vec::new());
    };
    let repo_name = utils::repo_name(repo);
    let repo_prefix = format!("{}/", repo.display());

    let mut out = Vec::new();
    for query in queries {
        let mut query = query.clone();
        if let Some(Value::Array(files)) = query.get_mut("files") {
            for file in files.iter_mut() {
                if let Some(Value::String(name)) = file.get_mut("file_name") {
                    let relative = name
                        .strip_prefix(repo_prefix.as_str())
                        .unwrap_or(name.as_str())
                        .to_string();
                    *name = reroot(&repo_name, &relative);
                }
            }
        }
        out.push(query);
    }
    Ok(out)
}
