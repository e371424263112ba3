//! Git worktree management for epic workspaces.
//!
//! Each epic gets its own worktree on its own branch so only the RUNNING
//! stage's session ever touches it.

use std::path::Path;
use std::process::Command;

fn git(repo: &Path, args: &[&str]) -> Result<std::process::Output, String> {
    Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .map_err(|e| format!("Failed to run git: {}", e))
}

/// Check whether `branch` exists in `repo`
fn branch_exists(repo: &Path, branch: &str) -> bool {
    git(
        repo,
        &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)],
    )
    .map(|o| o.status.success())
    .unwrap_or(false)
}

/// Create a worktree at `path` on `branch`, creating the branch from HEAD if needed.
pub fn create_worktree(repo: &Path, branch: &str, path: &Path) -> Result<(), String> {
    if path.exists() {
        return Err(format!("Worktree path already exists: {}", path.display()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create worktree parent: {}", e))?;
    }

    let path_str = path.to_string_lossy();
    let output = if branch_exists(repo, branch) {
        git(repo, &["worktree", "add", &path_str, branch])?
    } else {
        git(repo, &["worktree", "add", "-b", branch, &path_str])?
    };

    if !output.status.success() {
        return Err(format!(
            "git worktree add failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    log::info!("Created worktree {} on branch {}", path.display(), branch);
    Ok(())
}
