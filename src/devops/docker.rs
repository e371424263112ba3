//! Docker sandbox support for stage workers.
//!
//! A sandboxed stage runs its agent in a container with the epic workspace
//! bind-mounted at `/workspace`. The container is kept after the agent exits
//! so the task card can still be pulled out of it with `docker cp`; it is
//! removed when the session is released.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::process::Command;

use super::tmux::shell_quote;

/// Regex patterns for sanitizing sensitive data from error messages and logs
static SENSITIVE_PATTERNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(sk-ant-[a-zA-Z0-9\-_]+|ghp_[a-zA-Z0-9]+|gho_[a-zA-Z0-9]+|github_pat_[a-zA-Z0-9_]+|ANTHROPIC_API_KEY=[^\s]+|GH_TOKEN=[^\s]+|GITHUB_TOKEN=[^\s]+|Bearer\s+[a-zA-Z0-9\-_.]+)").unwrap()
});

/// Default Docker image (Node.js based for the Claude Code CLI)
pub const DEFAULT_AGENT_IMAGE: &str = "node:20-bookworm";

/// Sanitize a string to remove sensitive credentials before logging or displaying.
///
/// This removes:
/// - Anthropic API keys (sk-ant-*)
/// - GitHub tokens (ghp_*, gho_*, github_pat_*)
/// - Environment variable assignments with sensitive values
/// - Bearer tokens
/// - Home directory paths (replaced with ~)
pub fn sanitize_sensitive_data(content: &str) -> String {
    let sanitized = SENSITIVE_PATTERNS.replace_all(content, "[REDACTED]");

    // Replace home directory with ~ to avoid leaking username
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() && home != "/" {
            return sanitized.replace(&home, "~");
        }
    }

    sanitized.to_string()
}

/// Check if Docker is available and daemon is running
pub fn is_docker_available() -> bool {
    Command::new("docker")
        .args(["info"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Container name for a stage session
pub fn container_name_for(prefix: &str, session_id: &str) -> String {
    format!("{}{}", prefix, session_id)
}

/// Copy a file out of a container (works on stopped containers too)
pub fn copy_from_container(container_name: &str, source: &str, dest: &Path) -> Result<(), String> {
    let output = Command::new("docker")
        .arg("cp")
        .arg(format!("{}:{}", container_name, source))
        .arg(dest)
        .output()
        .map_err(|e| format!("Failed to run docker cp: {}", e))?;

    if !output.status.success() {
        return Err(format!(
            "docker cp from {} failed: {}",
            container_name,
            sanitize_sensitive_data(String::from_utf8_lossy(&output.stderr).trim())
        ));
    }
    Ok(())
}

/// Stop and remove a container by name
///
/// Returns Ok(()) if the container was removed or didn't exist.
pub fn stop_and_remove_container(container_name: &str) -> Result<(), String> {
    let output = Command::new("docker")
        .args(["rm", "-f", container_name])
        .output()
        .map_err(|e| format!("Failed to run docker rm: {}", e))?;

    if output.status.success() {
        log::info!("Removed container: {}", container_name);
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // "No such container" is fine - it's already gone
        if stderr.contains("No such container") {
            Ok(())
        } else {
            Err(format!(
                "Failed to remove container {}: {}",
                container_name,
                sanitize_sensitive_data(&stderr)
            ))
        }
    }
}

/// Wrap an agent command so it runs inside a sandbox container.
///
/// Credentials are passed by name only (`-e KEY`), so their values never
/// appear in the command line or the tmux pane.
pub fn build_sandbox_command(
    container_name: &str,
    workspace: &Path,
    image: &str,
    env: &[(&str, &str)],
    inner_command: &str,
) -> String {
    let mut args = vec![
        "docker run -it".to_string(),
        format!("--name {}", container_name),
        format!("-v {}:/workspace", shell_quote(&workspace.to_string_lossy())),
        "-w /workspace".to_string(),
        "-e GH_TOKEN".to_string(),
        "-e GITHUB_TOKEN".to_string(),
        "-e ANTHROPIC_API_KEY".to_string(),
    ];
    for (key, value) in env {
        args.push(format!("-e {}={}", key, shell_quote(value)));
    }
    args.push(image.to_string());
    args.push("sh -c".to_string());

    let install_and_run = format!(
        "npm install -g @anthropic-ai/claude-code >/dev/null 2>&1; {}",
        inner_command
    );
    args.push(shell_quote(&install_and_run));
    args.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_redacts_tokens() {
        let out = sanitize_sensitive_data("key sk-ant-api03-abc_DEF and GH_TOKEN=ghp_x123 ok");
        assert!(!out.contains("sk-ant-api03"));
        assert!(!out.contains("ghp_x123"));
        assert!(out.ends_with("ok"));
    }

    #[test]
    fn test_sandbox_command_mounts_workspace() {
        let cmd = build_sandbox_command(
            &container_name_for("handy-sandbox-", "e_BUILD_1"),
            Path::new("/tmp/ws"),
            DEFAULT_AGENT_IMAGE,
            &[("HANDY_STAGE", "BUILD")],
            "claude -p 'go'",
        );
        assert!(cmd.starts_with(
            "docker run -it --name handy-sandbox-e_BUILD_1 -v '/tmp/ws':/workspace"
        ));
        assert!(cmd.contains("-e HANDY_STAGE='BUILD'"));
        assert!(cmd.contains("-e ANTHROPIC_API_KEY "));
        assert!(!cmd.contains("--rm"));
    }
}
