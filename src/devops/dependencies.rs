//! Dependency detection for the `doctor` command.
//!
//! Which tools are required depends on the settings: tmux for the tmux
//! worker, docker for the docker card transport, git when epics branch from
//! a source repository, and the agent CLI of every registered stage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::process::Command;

use super::docker;
use crate::settings::{CardTransport, EngineSettings, WorkerBackendKind};

/// Agent CLIs the tmux worker knows how to drive
pub const KNOWN_AGENTS: [&str; 4] = ["claude", "aider", "codex", "gemini"];

/// Status of a single dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    /// Name of the dependency
    pub name: String,
    /// Whether the dependency is installed
    pub installed: bool,
    /// Whether the current settings need it
    pub required: bool,
    /// Whether the tool is authenticated, for tools with a credential check
    pub authenticated: Option<bool>,
    /// Version string if installed
    pub version: Option<String>,
    /// Path to the executable if installed
    pub path: Option<String>,
    /// Installation instructions if not installed
    pub install_hint: String,
}

impl DependencyStatus {
    /// Required but not usable.
    pub fn is_blocking(&self) -> bool {
        self.required && (!self.installed || self.authenticated == Some(false))
    }
}

/// Result of a full check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorReport {
    pub tools: Vec<DependencyStatus>,
    /// Agent CLIs found on PATH
    pub available_agents: Vec<String>,
    /// Whether the docker daemon answered (only checked for the docker transport)
    pub docker_daemon: Option<bool>,
    /// Whether nothing required is missing
    pub all_satisfied: bool,
}

impl DoctorReport {
    pub fn blocking(&self) -> Vec<&DependencyStatus> {
        self.tools.iter().filter(|t| t.is_blocking()).collect()
    }
}

/// Check if a command exists and get its version
fn check_command(name: &str, version_args: &[&str]) -> (bool, Option<String>, Option<String>) {
    let path = match Command::new("which").arg(name).output() {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => return (false, None, None),
    };

    let version = match Command::new(name).args(version_args).output() {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Some tools print their version to stderr
            let text = if stdout.trim().is_empty() {
                stderr.to_string()
            } else {
                stdout.to_string()
            };
            text.lines().next().map(|line| parse_version(name, line))
        }
        _ => None,
    };

    (true, version, Some(path))
}

/// Pull the version out of a tool's first output line.
fn parse_version(name: &str, line: &str) -> String {
    let line = line.trim();
    match name {
        // "tmux 3.4", "git version 2.43.0", "Docker version 27.0.3, build 7d4bcd8"
        "tmux" | "git" | "docker" => line
            .split_whitespace()
            .find(|word| word.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .map(|word| word.trim_end_matches(',').to_string())
            .unwrap_or_else(|| line.to_string()),
        _ => line.to_string(),
    }
}

/// Claude Code credentials: an API key or an OAuth account in ~/.claude.json
fn check_claude_auth() -> bool {
    if let Ok(api_key) = std::env::var("ANTHROPIC_API_KEY") {
        if !api_key.is_empty() {
            return true;
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".claude.json"))
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|contents| serde_json::from_str::<serde_json::Value>(&contents).ok())
        .map(|json| json.get("oauthAccount").is_some())
        .unwrap_or(false)
}

fn install_hint(name: &str) -> &'static str {
    match name {
        "tmux" => "brew install tmux",
        "git" => "brew install git",
        "docker" => "https://docs.docker.com/get-docker/",
        "claude" => "npm install -g @anthropic-ai/claude-code",
        "aider" => "pip install aider-chat",
        "codex" => "npm install -g @openai/codex",
        "gemini" => "npm install -g @google/gemini-cli",
        _ => "see the tool's documentation",
    }
}

fn version_args(name: &str) -> &'static [&'static str] {
    match name {
        "tmux" => &["-V"],
        _ => &["--version"],
    }
}

fn check_tool(name: &str, required: bool) -> DependencyStatus {
    let (installed, version, path) = check_command(name, version_args(name));
    let authenticated = if installed && name == "claude" {
        Some(check_claude_auth())
    } else {
        None
    };

    DependencyStatus {
        name: name.to_string(),
        installed,
        required,
        authenticated,
        version,
        path,
        install_hint: install_hint(name).to_string(),
    }
}

/// Tools the settings need, in report order.
pub fn required_tools(settings: &EngineSettings) -> BTreeSet<String> {
    let mut required = BTreeSet::new();
    if settings.worker == WorkerBackendKind::Tmux {
        required.insert("tmux".to_string());
        for stage in &settings.stages {
            if stage.agent_type != "manual" {
                required.insert(stage.agent_type.clone());
            }
        }
    }
    if settings.cards.transport == CardTransport::Docker {
        required.insert("docker".to_string());
    }
    if settings.source_repo.is_some() {
        required.insert("git".to_string());
    }
    required
}

/// Check every tool the engine can use.
pub fn check_all_dependencies(settings: &EngineSettings) -> DoctorReport {
    let required = required_tools(settings);

    let mut names: Vec<String> = ["tmux", "git", "docker"]
        .iter()
        .chain(KNOWN_AGENTS.iter())
        .map(|s| s.to_string())
        .collect();
    for extra in &required {
        if !names.contains(extra) {
            names.push(extra.clone());
        }
    }

    let tools: Vec<DependencyStatus> = names
        .iter()
        .map(|name| check_tool(name, required.contains(name)))
        .collect();

    let available_agents = tools
        .iter()
        .filter(|t| t.installed && KNOWN_AGENTS.contains(&t.name.as_str()))
        .map(|t| t.name.clone())
        .collect();

    let docker_daemon = match settings.cards.transport {
        CardTransport::Docker => Some(docker::is_docker_available()),
        CardTransport::Worktree => None,
    };

    let all_satisfied =
        tools.iter().all(|t| !t.is_blocking()) && docker_daemon.unwrap_or(true);

    DoctorReport {
        tools,
        available_agents,
        docker_daemon,
        all_satisfied,
    }
}
