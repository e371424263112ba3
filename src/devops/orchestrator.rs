//! Worker backends: how a stage session is actually executed.
//!
//! The engine only talks to [`WorkerBackend`]. The bundled [`TmuxWorker`]
//! runs each stage's agent in a tmux session on Handy's socket, optionally
//! inside a Docker sandbox; `sim::SimulatedWorker` stands in for dry runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::docker;
use super::error::{EngineError, EngineResult};
use super::stages::StageType;
use super::tmux::{self, AgentCommand, AgentMetadata};
use crate::settings::{CardTransport, EngineSettings};

/// Directory inside a workspace that receives agent result files
pub const RUN_DIR: &str = ".handy/runs";

/// Everything a backend needs to start one stage run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInvocation {
    /// Epic the run belongs to
    pub epic_id: String,
    /// Stage to execute
    pub stage_type: StageType,
    /// Objective handed to the worker
    pub objective: String,
    /// Session key `{epic}_{stage}_{iteration}`
    pub session_name: String,
    /// Turn budget for the agent
    pub max_turns: u32,
    /// Continue the previous conversation instead of starting fresh
    pub resume: bool,
    /// Workspace the agent runs in
    pub workspace_override: Option<PathBuf>,
    /// Agent CLI (e.g., "claude")
    pub agent_type: String,
    /// Card path as the worker sees it
    pub card_path: PathBuf,
    /// Full prompt text
    pub prompt: String,
}

/// Process state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Running,
    /// The session exists but the agent process has exited
    Exited,
    /// No session for this run
    Missing,
}

/// Snapshot returned by a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub turns_used: u64,
    pub cost: f64,
    /// Unix timestamp of the session's last activity
    pub last_activity_ts: Option<i64>,
}

impl WorkerStatus {
    pub fn missing() -> Self {
        Self {
            state: WorkerState::Missing,
            turns_used: 0,
            cost: 0.0,
            last_activity_ts: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == WorkerState::Running
    }
}

/// Worker execution seam
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Start the worker. Returns the run id.
    async fn invoke(&self, invocation: WorkerInvocation) -> EngineResult<String>;

    async fn status(&self, run_id: &str) -> EngineResult<WorkerStatus>;

    /// Ask the worker to stop; `force` kills it outright.
    async fn terminate(&self, run_id: &str, force: bool) -> EngineResult<()>;

    /// Drop every resource held for the run (session, container).
    async fn release(&self, run_id: &str) -> EngineResult<()>;
}

/// Get the current machine's identifier.
pub fn get_current_machine_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Turns and cost from the agent's JSON result file.
#[derive(Debug, Default, Deserialize)]
struct AgentResult {
    #[serde(default)]
    num_turns: u64,
    #[serde(default)]
    total_cost_usd: f64,
}

fn read_agent_result(path: &Path) -> Option<AgentResult> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

#[derive(Debug, Clone)]
struct TmuxRun {
    session_name: String,
    container: Option<String>,
    result_file: PathBuf,
}

/// Runs agents in tmux sessions on the Handy socket.
pub struct TmuxWorker {
    transport: CardTransport,
    container_prefix: String,
    image: String,
    runs: Mutex<HashMap<String, TmuxRun>>,
}

impl TmuxWorker {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            transport: settings.cards.transport,
            container_prefix: settings.cards.container_prefix.clone(),
            image: docker::DEFAULT_AGENT_IMAGE.to_string(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Container a session's agent runs in, when sandboxed.
    pub fn container_for(&self, session_id: &str) -> Option<String> {
        match self.transport {
            CardTransport::Docker => {
                Some(docker::container_name_for(&self.container_prefix, session_id))
            }
            CardTransport::Worktree => None,
        }
    }

    fn remember(&self, run_id: &str, run: TmuxRun) -> EngineResult<()> {
        self.runs
            .lock()
            .map_err(|_| EngineError::worker("tmux run table poisoned"))?
            .insert(run_id.to_string(), run);
        Ok(())
    }

    /// Find a run, falling back to the HANDY_RUN metadata of live sessions
    /// (runs started before an engine restart).
    async fn locate(&self, run_id: &str) -> EngineResult<Option<TmuxRun>> {
        if let Some(run) = self
            .runs
            .lock()
            .map_err(|_| EngineError::worker("tmux run table poisoned"))?
            .get(run_id)
            .cloned()
        {
            return Ok(Some(run));
        }

        let wanted = run_id.to_string();
        let prefix = self.container_prefix.clone();
        let transport = self.transport;
        let found = blocking(move || {
            let sessions = tmux::list_sessions()?;
            Ok(sessions.into_iter().find_map(|s| {
                let meta = s.metadata?;
                if meta.run_id.as_deref() != Some(wanted.as_str()) {
                    return None;
                }
                let workspace = PathBuf::from(meta.worktree?);
                let container = match transport {
                    CardTransport::Docker => tmux::session_id_from_name(&s.name)
                        .map(|id| docker::container_name_for(&prefix, id)),
                    CardTransport::Worktree => None,
                };
                Some(TmuxRun {
                    session_name: s.name,
                    container,
                    result_file: workspace.join(RUN_DIR).join(format!("{}.json", wanted)),
                })
            }))
        })
        .await?;

        if let Some(run) = &found {
            self.remember(run_id, run.clone())?;
        }
        Ok(found)
    }
}

/// Run a blocking shell wrapper off the async runtime.
async fn blocking<T, F>(f: F) -> EngineResult<T>
where
    F: FnOnce() -> Result<T, String> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::worker(format!("Worker task failed: {}", e)))?
        .map_err(EngineError::worker)
}

#[async_trait]
impl WorkerBackend for TmuxWorker {
    async fn invoke(&self, invocation: WorkerInvocation) -> EngineResult<String> {
        let workspace = invocation.workspace_override.clone().ok_or_else(|| {
            EngineError::spawn_rejected("tmux worker needs a workspace path")
        })?;

        let short = uuid::Uuid::new_v4().simple().to_string();
        let run_id = format!("run-{}", &short[..8]);
        let session_name = tmux::session_name_for(&invocation.session_name);
        let container = self.container_for(&invocation.session_name);
        let result_rel = format!("{}/{}.json", RUN_DIR, run_id);
        let result_file = workspace.join(&result_rel);
        let image = self.image.clone();

        let run = TmuxRun {
            session_name: session_name.clone(),
            container: container.clone(),
            result_file,
        };

        let run_id_for_task = run_id.clone();
        blocking(move || {
            std::fs::create_dir_all(workspace.join(RUN_DIR))
                .map_err(|e| format!("Failed to create run directory: {}", e))?;

            let inner = tmux::build_agent_command(&AgentCommand {
                agent_type: &invocation.agent_type,
                prompt: &invocation.prompt,
                max_turns: invocation.max_turns,
                resume: invocation.resume,
                auto_accept: container.is_some(),
                result_file: Some(&result_rel),
            })?;

            let workspace_str = workspace.to_string_lossy().to_string();
            let command = match &container {
                Some(name) => {
                    // A leftover container from an earlier iteration would block the name
                    docker::stop_and_remove_container(name)?;
                    docker::build_sandbox_command(
                        name,
                        &workspace,
                        &image,
                        &[
                            ("HANDY_EPIC", invocation.epic_id.as_str()),
                            ("HANDY_STAGE", invocation.stage_type.as_str()),
                            ("HANDY_RUN", run_id_for_task.as_str()),
                        ],
                        &inner,
                    )
                }
                None => inner,
            };

            // A resumed session reuses its name; the previous pane has already exited
            tmux::kill_session(&session_name)?;

            let metadata = AgentMetadata {
                session: session_name.clone(),
                epic_id: Some(invocation.epic_id.clone()),
                stage: Some(invocation.stage_type.to_string()),
                run_id: Some(run_id_for_task.clone()),
                worktree: Some(workspace_str.clone()),
                agent_type: invocation.agent_type.clone(),
                machine_id: get_current_machine_id(),
                started_at: chrono::Utc::now().to_rfc3339(),
            };
            tmux::create_session(&session_name, Some(&workspace_str), &metadata)?;
            tmux::send_command(&session_name, &command)
        })
        .await?;

        log::info!(
            "Started {} run {} in tmux session {}",
            run.container.as_deref().map(|_| "sandboxed").unwrap_or("local"),
            run_id,
            run.session_name
        );
        self.remember(&run_id, run)?;
        Ok(run_id)
    }

    async fn status(&self, run_id: &str) -> EngineResult<WorkerStatus> {
        let run = match self.locate(run_id).await? {
            Some(run) => run,
            None => return Ok(WorkerStatus::missing()),
        };

        blocking(move || {
            if !tmux::has_session(&run.session_name) {
                return Ok(WorkerStatus::missing());
            }
            let state = if tmux::check_session_has_active_process(&run.session_name) {
                WorkerState::Running
            } else {
                WorkerState::Exited
            };
            let result = read_agent_result(&run.result_file).unwrap_or_default();
            Ok(WorkerStatus {
                state,
                turns_used: result.num_turns,
                cost: result.total_cost_usd,
                last_activity_ts: tmux::session_activity(&run.session_name).ok(),
            })
        })
        .await
    }

    async fn terminate(&self, run_id: &str, force: bool) -> EngineResult<()> {
        let run = match self.locate(run_id).await? {
            Some(run) => run,
            None => return Ok(()),
        };
        blocking(move || {
            if force {
                if let Some(container) = &run.container {
                    docker::stop_and_remove_container(container)?;
                }
                tmux::kill_session(&run.session_name)
            } else if tmux::has_session(&run.session_name) {
                tmux::send_keys(&run.session_name, "C-c")
            } else {
                Ok(())
            }
        })
        .await
    }

    async fn release(&self, run_id: &str) -> EngineResult<()> {
        let run = self
            .runs
            .lock()
            .map_err(|_| EngineError::worker("tmux run table poisoned"))?
            .remove(run_id);
        let run = match run {
            Some(run) => run,
            None => return Ok(()),
        };
        blocking(move || {
            if let Some(container) = &run.container {
                docker::stop_and_remove_container(container)?;
            }
            tmux::kill_session(&run.session_name)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_agent_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.json");
        std::fs::write(
            &path,
            r#"{"type":"result","num_turns":12,"total_cost_usd":0.42,"result":"done"}"#,
        )
        .unwrap();
        let result = read_agent_result(&path).unwrap();
        assert_eq!(result.num_turns, 12);
        assert!((result.total_cost_usd - 0.42).abs() < f64::EPSILON);
        assert!(read_agent_result(&dir.path().join("missing.json")).is_none());
    }

    #[test]
    fn test_container_only_in_docker_mode() {
        let mut settings = EngineSettings::default();
        assert_eq!(TmuxWorker::new(&settings).container_for("e_BUILD_1"), None);
        settings.cards.transport = CardTransport::Docker;
        assert_eq!(
            TmuxWorker::new(&settings).container_for("e_BUILD_1").as_deref(),
            Some("handy-sandbox-e_BUILD_1")
        );
    }

    #[tokio::test]
    async fn test_unknown_run_is_missing() {
        let worker = TmuxWorker::new(&EngineSettings::default());
        // No tmux server needed: an unknown run with no sessions is simply missing
        if let Ok(status) = worker.status("run-none").await {
            assert_eq!(status.state, WorkerState::Missing);
        }
    }
}
