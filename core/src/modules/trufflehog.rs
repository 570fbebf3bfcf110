use std::path::Path;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;

use super::{reroot_field, ScannerTool};
use crate::normalize::ResultKind;
use crate::utils;

pub struct Trufflehog;

#[async_trait]
impl ScannerTool for Trufflehog {
    fn kind(&self) -> ResultKind {
        ResultKind::Trufflehog
    }

    fn binary(&self) -> &'static str {
        "trufflehog"
    }

    fn args(&self, _repo: &Path, _scratch: &Path) -> Vec<String> {
        ["filesystem", "--json", "--no-update", "."]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    async fn collect(&self, repo: &Path, _scratch: &Path, stdout: Vec<u8>) -> anyhow::Result<Vec<Value>> {
        Ok(parse(&utils::repo_name(repo), &stdout))
    }
}

/// One finding per JSON line. Lines that are not findings are status
/// chatter and are dropped. A line that is not valid UTF-8 is dropped whole
/// so a secret is never stored with replacement characters.
fn parse(repo_name: &str, stdout: &[u8]) -> Vec<Value> {
    let mut findings = Vec::new();
    for line in stdout.split(|b| *b == b'\n') {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        if std::str::from_utf8(line).is_err() {
            warn!("trufflehog: dropping output line that is not valid UTF-8");
            continue;
        }
        let mut v: Value = match serde_json::from_slice(line) {
            Ok(v) => v,
            Err(_) => {
                debug!("trufflehog: skipping non-JSON line");
                continue;
            }
        };
        if v.get("DetectorName").is_none() {
            continue;
        }
        reroot_field(&mut v, "/SourceMetadata/Data/Filesystem/file", repo_name);
        reroot_field(&mut v, "/SourceMetadata/Data/Git/file", repo_name);
        findings.push(v);
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lines() {
        let out = concat!(
            r#"{"level":"info","msg":"starting"}"#,
            "\n",
            r#"{"DetectorName":"AWS","Raw":"AKIA","SourceMetadata":{"Data":{"Filesystem":{"file":".env"}}}}"#,
            "\ngarbage\n"
        );
        let findings = parse("api", out.as_bytes());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0]["SourceMetadata"]["Data"]["Filesystem"]["file"], "api/.env");
    }

    #[test]
    fn test_invalid_utf8_line_is_dropped() {
        let mut out = br#"{"DetectorName":"Slack","Raw":"xoxb","SourceMetadata":{"Data":{"Git":{"file":"a.py"}}}}"#.to_vec();
        out.extend_from_slice(b"\n{\"DetectorName\":\"AWS\",\"Raw\":\"ab");
        out.extend_from_slice(&[0xff, 0xfe]);
        out.extend_from_slice(b"cd\"}\n");
        let findings = parse("api", &out);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0]["DetectorName"], "Slack");
        assert_eq!(findings[0]["SourceMetadata"]["Data"]["Git"]["file"], "api/a.py");
    }
}
