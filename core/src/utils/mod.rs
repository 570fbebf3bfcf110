use std::fs;
use std::path::{Path, PathBuf};

use which::which;

/// Locates a scanner binary: `./tools/` first, then the working directory,
/// then `PATH`.
pub fn get_binary_path(tool_name: &str) -> Option<PathBuf> {
    let binary_name = if cfg!(target_os = "windows") {
        format!("{}.exe", tool_name)
    } else {
        tool_name.to_string()
    };

    let tools_path = PathBuf::from("./tools").join(&binary_name);
    if tools_path.is_file() {
        return Some(tools_path);
    }

    let local_path = PathBuf::from("./").join(&binary_name);
    if local_path.is_file() {
        return Some(local_path);
    }

    which(&binary_name).ok()
}

/// Immediate subdirectories of `dir`, sorted by name. Hidden entries are
/// skipped.
pub fn list_repos(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut repos = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.file_type()?.is_dir() {
            repos.push(entry.path());
        }
    }
    repos.sort();
    Ok(repos)
}

/// Last path component as a string, used to re-root scanner paths.
pub fn repo_name(repo: &Path) -> String {
    repo.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| repo.display().to_string())
}
