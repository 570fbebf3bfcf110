use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{reroot, ScannerTool};
use crate::normalize::ResultKind;
use crate::utils;

/// Source inventory: one artifact per file, categorized by language.
pub struct Scc;

#[async_trait]
impl ScannerTool for Scc {
    fn kind(&self) -> ResultKind {
        ResultKind::Artifacts
    }

    fn binary(&self) -> &'static str {
        "scc"
    }

    fn args(&self, _repo: &Path, _scratch: &Path) -> Vec<String> {
        ["--by-file", "--format", "json", "."]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    async fn collect(&self, repo: &Path, _scratch: &Path, stdout: Vec<u8>) -> anyhow::Result<Vec<Value>> {
        parse(&utils::repo_name(repo), &stdout)
    }
}

fn parse(repo_name: &str, stdout: &[u8]) -> anyhow::Result<Vec<Value>> {
    let languages: Vec<Value> = serde_json::from_slice(stdout).context("scc did not print a JSON array")?;
    let mut artifacts = Vec::new();
    for language in &languages {
        let category = language.get("Name").and_then(Value::as_str).unwrap_or("unknown");
        let Some(Value::Array(files)) = language.get("Files") else {
            continue;
        };
        for file in files {
            let Some(location) = file.get("Location").and_then(Value::as_str) else {
                continue;
            };
            artifacts.push(json!({
                "category": category,
                "path": reroot(repo_name, location),
                "lines": file.get("Lines").cloned().unwrap_or(Value::Null),
                "code": file.get("Code").cloned().unwrap_or(Value::Null),
                "complexity": file.get("Complexity").cloned().unwrap_or(Value::Null),
            }));
        }
    }
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_by_file() {
        let out = br#"[{"Name": "Go", "Files": [{"Location": "./cmd/main.go", "Lines": 40, "Code": 30, "Complexity": 4}]},
                       {"Name": "YAML", "Files": []}]"#;
        let artifacts = parse("svc", out).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0]["category"], "Go");
        assert_eq!(artifacts[0]["path"], "svc/cmd/main.go");
        assert_eq!(artifacts[0]["code"], 30);
    }
}
