//! External scanners invoked as subprocesses, one repository at a time.

pub mod commits;
pub mod kics;
pub mod scc;
pub mod semgrep;
pub mod trufflehog;

use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use tokio::process::Command;

use crate::normalize::ResultKind;
use crate::CatalogConfig;

/// One scanner. `args` builds the command line for a repository and
/// `collect` turns the captured stdout into entries whose paths are already
/// prefixed with the repository name.
#[async_trait]
pub trait ScannerTool: Send + Sync {
    fn kind(&self) -> ResultKind;

    fn binary(&self) -> &'static str;

    /// `scratch` is an empty per-invocation directory for tools that write
    /// reports to disk.
    fn args(&self, repo: &Path, scratch: &Path) -> Vec<String>;

    async fn collect(&self, repo: &Path, scratch: &Path, stdout: Vec<u8>) -> anyhow::Result<Vec<Value>>;
}

pub type ToolRef = std::sync::Arc<dyn ScannerTool>;

/// Every scanner, in snapshot order.
pub fn default_tools(config: &CatalogConfig) -> Vec<ToolRef> {
    vec![
        std::sync::Arc::new(semgrep::Semgrep),
        std::sync::Arc::new(trufflehog::Trufflehog),
        std::sync::Arc::new(scc::Scc),
        std::sync::Arc::new(kics::Kics),
        std::sync::Arc::new(commits::GitCommits::new(config.commit_limit)),
    ]
}

/// Runs `tool` (resolved at `binary`) inside `repo` and collects its output.
/// Scanners signal findings through their exit status, so a non-zero exit
/// is only logged.
pub async fn run_tool(tool: &dyn ScannerTool, binary: &Path, repo: &Path) -> anyhow::Result<Vec<Value>> {
    let scratch = tempfile::tempdir().context("creating scratch directory")?;
    let args = tool.args(repo, scratch.path());
    debug!("{} {} (in {})", binary.display(), args.join(" "), repo.display());

    let output = Command::new(binary)
        .args(&args)
        .current_dir(repo)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to start {}", tool.binary()))?;

    if !output.status.success() {
        debug!(
            "{} exited with {} in {}: {}",
            tool.binary(),
            output.status,
            repo.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    tool.collect(repo, scratch.path(), output.stdout)
        .await
        .with_context(|| format!("{} output for {} could not be read", tool.binary(), repo.display()))
}

/// `<repo>/<path>` with leading `./` removed from `path`.
pub fn reroot(repo_name: &str, path: &str) -> String {
    let trimmed = path.trim_start_matches("./");
    if trimmed.starts_with(&format!("{}/", repo_name)) {
        trimmed.to_string()
    } else {
        format!("{}/{}", repo_name, trimmed)
    }
}

/// Rewrites the string at `pointer` inside `entry` through `reroot`.
pub(crate) fn reroot_field(entry: &mut Value, pointer: &str, repo_name: &str) {
    if let Some(Value::String(path)) = entry.pointer_mut(pointer) {
        *path = reroot(repo_name, path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reroot() {
        assert_eq!(reroot("web", "./src/app.py"), "web/src/app.py");
        assert_eq!(reroot("web", "src/app.py"), "web/src/app.py");
        assert_eq!(reroot("web", "web/src/app.py"), "web/src/app.py");
    }

    #[test]
    fn test_reroot_field() {
        let mut entry = json!({"start": {"line": 1}, "path": "a.py"});
        reroot_field(&mut entry, "/path", "api");
        reroot_field(&mut entry, "/missing", "api");
        assert_eq!(entry["path"], "api/a.py");
    }
}
