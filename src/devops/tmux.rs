//! tmux session management for stage worker sessions.
//!
//! Sessions persist independently in the tmux server, surviving engine restarts.
//! Metadata is stored in tmux environment variables for recovery.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Command;

/// Session naming prefix for all stage worker sessions
const SESSION_PREFIX: &str = "handy-agent-";

/// Base prefix for all Handy-related tmux sessions
const HANDY_PREFIX: &str = "handy-";

/// Custom socket name to avoid macOS /private/tmp permission issues
const SOCKET_NAME: &str = "handy";

/// Environment variable keys stored in tmux sessions
const ENV_EPIC: &str = "HANDY_EPIC";
const ENV_STAGE: &str = "HANDY_STAGE";
const ENV_RUN: &str = "HANDY_RUN";
const ENV_WORKTREE: &str = "HANDY_WORKTREE";
const ENV_AGENT_TYPE: &str = "HANDY_AGENT_TYPE";
const ENV_MACHINE_ID: &str = "HANDY_MACHINE_ID";
const ENV_STARTED_AT: &str = "HANDY_STARTED_AT";

/// Status of a worker session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session is running and the agent is active
    Running,
    /// Session exists but the agent process has exited
    Stopped,
}

/// Metadata stored with each worker session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMetadata {
    /// Session name (e.g., "handy-agent-epic-1a2b3c4d_BUILD_1")
    pub session: String,
    /// Epic the session works for
    pub epic_id: Option<String>,
    /// Stage being executed
    pub stage: Option<String>,
    /// Run identifier
    pub run_id: Option<String>,
    /// Path to the worktree
    pub worktree: Option<String>,
    /// Type of agent (e.g., "claude", "aider")
    pub agent_type: String,
    /// Machine identifier for multi-machine disambiguation
    pub machine_id: String,
    /// ISO timestamp when session started
    pub started_at: String,
}

/// Information about a tmux session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmuxSession {
    /// Session name
    pub name: String,
    /// Whether the session is attached
    pub attached: bool,
    /// Number of windows in the session
    pub windows: u32,
    /// Session creation time (Unix timestamp)
    pub created: u64,
    /// Last activity time (Unix timestamp)
    pub activity: u64,
    /// Agent metadata if this is a Handy session
    pub metadata: Option<AgentMetadata>,
    /// Current status
    pub status: SessionStatus,
}

/// List all tmux sessions, filtering for Handy sessions
pub fn list_sessions() -> Result<Vec<TmuxSession>, String> {
    // Format: session_name, attached, windows, created, activity
    let output = Command::new("tmux")
        .args([
            "-L",
            SOCKET_NAME,
            "list-sessions",
            "-F",
            "#{session_name}\t#{session_attached}\t#{session_windows}\t#{session_created}\t#{session_activity}",
        ])
        .output()
        .map_err(|e| format!("Failed to list tmux sessions: {}", e))?;

    if !output.status.success() {
        // No sessions or tmux not running
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("no server running") || stderr.contains("no sessions") {
            return Ok(vec![]);
        }
        return Err(format!("tmux error: {}", stderr));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_session_lines(&stdout)
        .into_iter()
        .map(|mut session| {
            session.metadata = get_session_metadata(&session.name).ok();
            session.status = if check_session_has_active_process(&session.name) {
                SessionStatus::Running
            } else {
                SessionStatus::Stopped
            };
            session
        })
        .collect())
}

fn parse_session_lines(stdout: &str) -> Vec<TmuxSession> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 5 || !parts[0].starts_with(HANDY_PREFIX) {
                return None;
            }
            Some(TmuxSession {
                name: parts[0].to_string(),
                attached: parts[1] == "1",
                windows: parts[2].parse().unwrap_or(1),
                created: parts[3].parse().unwrap_or(0),
                activity: parts[4].parse().unwrap_or(0),
                metadata: None,
                status: SessionStatus::Stopped,
            })
        })
        .collect()
}

/// Check if a session exists on the Handy socket
pub fn has_session(session_name: &str) -> bool {
    Command::new("tmux")
        .args(["-L", SOCKET_NAME, "has-session", "-t", session_name])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check if a session has an active process running in its pane
pub fn check_session_has_active_process(session_name: &str) -> bool {
    // Get the command running in the session's active pane
    Command::new("tmux")
        .args([
            "-L",
            SOCKET_NAME,
            "list-panes",
            "-t",
            session_name,
            "-F",
            "#{pane_current_command}",
        ])
        .output()
        .map(|o| {
            if o.status.success() {
                let cmd = String::from_utf8_lossy(&o.stdout).trim().to_string();
                // Check if it's not just a shell prompt
                !cmd.is_empty() && cmd != "bash" && cmd != "zsh" && cmd != "sh" && cmd != "fish"
            } else {
                false
            }
        })
        .unwrap_or(false)
}

/// Last activity time of a session (Unix timestamp)
pub fn session_activity(session_name: &str) -> Result<i64, String> {
    let output = Command::new("tmux")
        .args([
            "-L",
            SOCKET_NAME,
            "display-message",
            "-p",
            "-t",
            session_name,
            "#{session_activity}",
        ])
        .output()
        .map_err(|e| format!("Failed to query session activity: {}", e))?;

    if !output.status.success() {
        return Err(format!(
            "tmux error: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|e| format!("Invalid session_activity value: {}", e))
}

/// Get metadata for a specific session from its environment variables
pub fn get_session_metadata(session_name: &str) -> Result<AgentMetadata, String> {
    let output = Command::new("tmux")
        .args(["-L", SOCKET_NAME, "show-environment", "-t", session_name])
        .output()
        .map_err(|e| format!("Failed to get session environment: {}", e))?;

    if !output.status.success() {
        return Err("Session not found or no environment set".to_string());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut env_vars: HashMap<String, String> = HashMap::new();

    for line in stdout.lines() {
        if let Some((key, value)) = line.split_once('=') {
            if key.starts_with("HANDY_") {
                env_vars.insert(key.to_string(), value.to_string());
            }
        }
    }

    Ok(AgentMetadata {
        session: session_name.to_string(),
        epic_id: env_vars.get(ENV_EPIC).cloned(),
        stage: env_vars.get(ENV_STAGE).cloned(),
        run_id: env_vars.get(ENV_RUN).cloned(),
        worktree: env_vars.get(ENV_WORKTREE).cloned(),
        agent_type: env_vars
            .get(ENV_AGENT_TYPE)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
        machine_id: env_vars
            .get(ENV_MACHINE_ID)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
        started_at: env_vars
            .get(ENV_STARTED_AT)
            .cloned()
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
    })
}

/// Create a new tmux session with metadata
pub fn create_session(
    session_name: &str,
    working_dir: Option<&str>,
    metadata: &AgentMetadata,
) -> Result<(), String> {
    // Validate session name - must start with handy- prefix
    if !session_name.starts_with(HANDY_PREFIX) {
        return Err(format!("Session name must start with '{}'", HANDY_PREFIX));
    }

    // Check if session already exists
    let existing = list_sessions()?;
    if existing.iter().any(|s| s.name == session_name) {
        return Err(format!("Session '{}' already exists", session_name));
    }

    let mut args = vec!["-L", SOCKET_NAME, "new-session", "-d", "-s", session_name];
    if let Some(dir) = working_dir {
        args.push("-c");
        args.push(dir);
    }

    let output = Command::new("tmux")
        .args(&args)
        .output()
        .map_err(|e| format!("Failed to create session: {}", e))?;

    if !output.status.success() {
        return Err(format!(
            "tmux error: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    // Set environment variables for metadata
    set_session_env(session_name, ENV_AGENT_TYPE, &metadata.agent_type)?;
    set_session_env(session_name, ENV_MACHINE_ID, &metadata.machine_id)?;
    set_session_env(session_name, ENV_STARTED_AT, &metadata.started_at)?;

    for (key, value) in [
        (ENV_EPIC, &metadata.epic_id),
        (ENV_STAGE, &metadata.stage),
        (ENV_RUN, &metadata.run_id),
        (ENV_WORKTREE, &metadata.worktree),
    ] {
        if let Some(value) = value {
            set_session_env(session_name, key, value)?;
        }
    }

    Ok(())
}

/// Set an environment variable in a tmux session
fn set_session_env(session_name: &str, key: &str, value: &str) -> Result<(), String> {
    let output = Command::new("tmux")
        .args([
            "-L",
            SOCKET_NAME,
            "set-environment",
            "-t",
            session_name,
            key,
            value,
        ])
        .output()
        .map_err(|e| format!("Failed to set environment: {}", e))?;

    if !output.status.success() {
        return Err(format!(
            "Failed to set {}: {}",
            key,
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    Ok(())
}

/// Kill a tmux session
pub fn kill_session(session_name: &str) -> Result<(), String> {
    let output = Command::new("tmux")
        .args(["-L", SOCKET_NAME, "kill-session", "-t", session_name])
        .output()
        .map_err(|e| format!("Failed to kill session: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Already gone
        if stderr.contains("can't find session") || stderr.contains("no server running") {
            return Ok(());
        }
        return Err(format!("tmux error: {}", stderr));
    }

    Ok(())
}

/// Send a command to a session followed by Enter
pub fn send_command(session_name: &str, command: &str) -> Result<(), String> {
    let mut args = vec!["-L", SOCKET_NAME, "send-keys", "-t", session_name];

    // If empty command, just send Enter
    if !command.is_empty() {
        args.push(command);
    }
    args.push("Enter");

    let output = Command::new("tmux")
        .args(&args)
        .output()
        .map_err(|e| format!("Failed to send command: {}", e))?;

    if !output.status.success() {
        return Err(format!(
            "tmux error: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    Ok(())
}

/// Send raw keys to a session without appending Enter (e.g., "C-c")
pub fn send_keys(session_name: &str, keys: &str) -> Result<(), String> {
    let output = Command::new("tmux")
        .args(["-L", SOCKET_NAME, "send-keys", "-t", session_name, keys])
        .output()
        .map_err(|e| format!("Failed to send keys: {}", e))?;

    if !output.status.success() {
        return Err(format!(
            "tmux error: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    Ok(())
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Options for building an agent command line
#[derive(Debug, Clone)]
pub struct AgentCommand<'a> {
    pub agent_type: &'a str,
    pub prompt: &'a str,
    pub max_turns: u32,
    /// Continue the most recent conversation in the working directory
    pub resume: bool,
    /// Skip permission prompts (only inside a sandbox)
    pub auto_accept: bool,
    /// File receiving the agent's JSON result, when the agent supports it
    pub result_file: Option<&'a str>,
}

/// Build the shell command that runs an agent for one stage.
pub fn build_agent_command(cmd: &AgentCommand<'_>) -> Result<String, String> {
    let prompt = shell_quote(cmd.prompt);

    let command = match cmd.agent_type.to_lowercase().as_str() {
        "claude" => {
            let mut parts = vec!["claude".to_string()];
            if cmd.resume {
                parts.push("--continue".to_string());
            }
            if cmd.auto_accept {
                parts.push("--dangerously-skip-permissions".to_string());
            }
            parts.push(format!("--max-turns {}", cmd.max_turns));
            parts.push("--output-format json".to_string());
            parts.push(format!("-p {}", prompt));
            if let Some(file) = cmd.result_file {
                parts.push(format!("> {}", shell_quote(file)));
            }
            parts.join(" ")
        }
        "aider" => {
            let mut parts = vec!["aider".to_string()];
            if cmd.auto_accept {
                parts.push("--yes-always".to_string());
            }
            if cmd.resume {
                parts.push("--restore-chat-history".to_string());
            }
            parts.push(format!("--message {}", prompt));
            parts.join(" ")
        }
        "codex" | "openai" => format!("codex exec {}", prompt),
        "gemini" => format!("gemini -p {}", prompt),
        "manual" => format!(
            "echo {} && read -r _",
            shell_quote("Manual stage session. Update the task card, then press Enter.")
        ),
        _ => {
            return Err(format!(
                "Unknown agent type '{}'. Supported types: claude, aider, codex, gemini, manual",
                cmd.agent_type
            ));
        }
    };

    Ok(command)
}

/// Generate the tmux session name for a stage session id
pub fn session_name_for(session_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, session_id)
}

/// Recover the stage session id from a tmux session name
pub fn session_id_from_name(session_name: &str) -> Option<&str> {
    session_name.strip_prefix(SESSION_PREFIX)
}
