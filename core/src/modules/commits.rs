use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::ScannerTool;
use crate::normalize::ResultKind;
use crate::utils;

const FIELD_SEP: char = '\u{1f}';

/// Recent history of each repository, from `git log`.
pub struct GitCommits {
    limit: usize,
}

impl GitCommits {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

#[async_trait]
impl ScannerTool for GitCommits {
    fn kind(&self) -> ResultKind {
        ResultKind::Commits
    }

    fn binary(&self) -> &'static str {
        "git"
    }

    fn args(&self, _repo: &Path, _scratch: &Path) -> Vec<String> {
        vec![
            "log".into(),
            "-n".into(),
            self.limit.to_string(),
            "--no-color".into(),
            "--pretty=format:%H%x1f%aI%x1f%an%x1f%s".into(),
        ]
    }

    async fn collect(&self, repo: &Path, _scratch: &Path, stdout: Vec<u8>) -> anyhow::Result<Vec<Value>> {
        Ok(parse(&utils::repo_name(repo), &stdout))
    }
}

fn parse(repo_name: &str, stdout: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(4, FIELD_SEP);
            let sha = fields.next()?.trim();
            if sha.is_empty() {
                return None;
            }
            Some(json!({
                "repo": repo_name,
                "sha": sha,
                "date": fields.next().unwrap_or(""),
                "author": fields.next().unwrap_or(""),
                "message": fields.next().unwrap_or(""),
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log() {
        let out = "abc123\u{1f}2025-01-01T09:00:00+00:00\u{1f}dev\u{1f}fix: escape input\n\n";
        let commits = parse("web", out.as_bytes());
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0]["sha"], "abc123");
        assert_eq!(commits[0]["message"], "fix: escape input");
        assert_eq!(commits[0]["repo"], "web");
    }

    #[test]
    fn test_args_carry_limit() {
        let args = GitCommits::new(25).args(Path::new("."), Path::new("."));
        assert_eq!(args[2], "25");
    }
}
