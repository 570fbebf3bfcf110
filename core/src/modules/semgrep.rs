use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use super::{reroot_field, ScannerTool};
use crate::normalize::ResultKind;
use crate::utils;

pub struct Semgrep;

#[async_trait]
impl ScannerTool for Semgrep {
    fn kind(&self) -> ResultKind {
        ResultKind::Semgrep
    }

    fn binary(&self) -> &'static str {
        "semgrep"
    }

    fn args(&self, _repo: &Path, _scratch: &Path) -> Vec<String> {
        ["scan", "--json", "--quiet", "--config", "auto", "."]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    async fn collect(&self, repo: &Path, _scratch: &Path, stdout: Vec<u8>) -> anyhow::Result<Vec<Value>> {
        parse(&utils::repo_name(repo), &stdout)
    }
}

fn parse(repo_name: &str, stdout: &[u8]) -> anyhow::Result<Vec<Value>> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let doc: Value = serde_json::from_slice(stdout).context("semgrep did not print JSON")?;
    let Some(Value::Array(results)) = doc.get("results") else {
        return Ok(Vec::new());
    };
    Ok(results
        .iter()
        .cloned()
        .map(|mut r| {
            reroot_field(&mut r, "/path", repo_name);
            r
        })
        .collect())
}
