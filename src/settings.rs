//! Engine settings, persisted as JSON.
//!
//! Every field carries a serde default so a partial (or missing) file still
//! loads. Lookup order: explicit path, `HANDY_CONDUCTOR_CONFIG`, then
//! `<config dir>/handy-conductor/settings.json`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::devops::error::{EngineError, EngineResult};
use crate::devops::stages::{default_stage_descriptors, StageDescriptor, StageRegistry};

/// Environment variable overriding the settings file location
pub const CONFIG_ENV: &str = "HANDY_CONDUCTOR_CONFIG";

const APP_DIR: &str = "handy-conductor";

/// Cumulative ceilings across an epic's stage history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetSettings {
    /// Maximum total cost in USD (unset means unlimited)
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    /// Maximum total worker turns (unset means unlimited)
    #[serde(default)]
    pub max_turns: Option<u64>,
}

/// Adaptive monitor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Poll interval while the card is below the shrink threshold
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: u64,
    /// How long both progress signals may stay flat before a run is STUCK
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// Floor for the shrunk interval
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// Checked/total ratio above which the interval shrinks
    #[serde(default = "default_shrink_threshold")]
    pub shrink_threshold: f64,
    /// Divisor applied to the base interval once past the threshold
    #[serde(default = "default_shrink_factor")]
    pub shrink_factor: u32,
    /// Consecutive unreachable card polls before escalating
    #[serde(default = "default_max_unreachable_polls")]
    pub max_unreachable_polls: u32,
    /// Grace period between graceful and forced session teardown
    #[serde(default = "default_teardown_grace_secs")]
    pub teardown_grace_secs: u64,
}

fn default_base_interval_secs() -> u64 {
    30
}

fn default_max_wait_secs() -> u64 {
    1800
}

fn default_min_interval_secs() -> u64 {
    2
}

fn default_shrink_threshold() -> f64 {
    0.8
}

fn default_shrink_factor() -> u32 {
    4
}

fn default_max_unreachable_polls() -> u32 {
    5
}

fn default_teardown_grace_secs() -> u64 {
    30
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            base_interval_secs: default_base_interval_secs(),
            max_wait_secs: default_max_wait_secs(),
            min_interval_secs: default_min_interval_secs(),
            shrink_threshold: default_shrink_threshold(),
            shrink_factor: default_shrink_factor(),
            max_unreachable_polls: default_max_unreachable_polls(),
            teardown_grace_secs: default_teardown_grace_secs(),
        }
    }
}

impl MonitorSettings {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_secs(self.teardown_grace_secs)
    }
}

/// How task cards travel between a worker workspace and the inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CardTransport {
    /// Worker runs on the host in its own worktree directory
    #[default]
    Worktree,
    /// Worker runs inside a sandbox container; cards move with `docker cp`
    Docker,
}

/// Task card store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardSettings {
    /// Parse attempts after the first before a card is unreachable
    #[serde(default = "default_parse_retries")]
    pub parse_retries: u32,
    /// Initial backoff between parse attempts, doubled each retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Transport used to pull cards
    #[serde(default)]
    pub transport: CardTransport,
    /// Container name prefix for the docker transport
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
}

fn default_parse_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_container_prefix() -> String {
    "handy-sandbox-".to_string()
}

impl Default for CardSettings {
    fn default() -> Self {
        Self {
            parse_retries: default_parse_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            transport: CardTransport::default(),
            container_prefix: default_container_prefix(),
        }
    }
}

impl CardSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Which worker backend drives sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerBackendKind {
    /// Agent CLIs in tmux sessions on the `handy` socket
    #[default]
    Tmux,
    /// In-process scripted worker (dry runs)
    Simulated,
}

/// Top-level engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// SQLite database path (defaults under the local data dir)
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Directory holding one workspace per epic
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Git repository to branch epic worktrees from (plain directories when unset)
    #[serde(default)]
    pub source_repo: Option<PathBuf>,
    /// Orchestrator inbox where pulled cards land before parsing
    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: PathBuf,
    /// Stage every new epic starts in
    #[serde(default = "default_initial_stage")]
    pub initial_stage: String,
    /// Budget ceilings
    #[serde(default)]
    pub budget: BudgetSettings,
    /// Maximum runs of one stage per epic before escalating
    #[serde(default = "default_max_stage_attempts")]
    pub max_stage_attempts: u32,
    /// Monitor tuning
    #[serde(default)]
    pub monitor: MonitorSettings,
    /// Task card tuning
    #[serde(default)]
    pub cards: CardSettings,
    /// Worker backend
    #[serde(default)]
    pub worker: WorkerBackendKind,
    /// Maximum pattern matches listed in a card's notes
    #[serde(default = "default_pattern_limit")]
    pub pattern_limit: usize,
    /// Registered stage table
    #[serde(default = "default_stage_descriptors")]
    pub stages: Vec<StageDescriptor>,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_workspace_root() -> PathBuf {
    data_dir().join("workspaces")
}

fn default_inbox_dir() -> PathBuf {
    data_dir().join("inbox")
}

fn default_initial_stage() -> String {
    "DESIGN".to_string()
}

fn default_max_stage_attempts() -> u32 {
    3
}

fn default_pattern_limit() -> usize {
    5
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            workspace_root: default_workspace_root(),
            source_repo: None,
            inbox_dir: default_inbox_dir(),
            initial_stage: default_initial_stage(),
            budget: BudgetSettings::default(),
            max_stage_attempts: default_max_stage_attempts(),
            monitor: MonitorSettings::default(),
            cards: CardSettings::default(),
            worker: WorkerBackendKind::default(),
            pattern_limit: default_pattern_limit(),
            stages: default_stage_descriptors(),
        }
    }
}

impl EngineSettings {
    /// Resolved database path
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| data_dir().join("conductor.db"))
    }

    /// Build and validate the stage registry, including the initial stage.
    pub fn stage_registry(&self) -> EngineResult<StageRegistry> {
        let registry = StageRegistry::from_descriptors(self.stages.clone())?;
        if registry.lookup(&self.initial_stage).is_none() {
            return Err(EngineError::config(format!(
                "Initial stage '{}' is not registered",
                self.initial_stage
            )));
        }
        Ok(registry)
    }

    /// Check value ranges the serde defaults cannot enforce.
    pub fn validate(&self) -> EngineResult<()> {
        if self.monitor.base_interval_secs == 0 {
            return Err(EngineError::config("monitor.base_interval_secs must be > 0"));
        }
        if self.monitor.min_interval_secs == 0 {
            return Err(EngineError::config("monitor.min_interval_secs must be > 0"));
        }
        if self.monitor.shrink_factor == 0 {
            return Err(EngineError::config("monitor.shrink_factor must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.monitor.shrink_threshold) {
            return Err(EngineError::config(
                "monitor.shrink_threshold must be between 0 and 1",
            ));
        }
        if self.max_stage_attempts == 0 {
            return Err(EngineError::config("max_stage_attempts must be > 0"));
        }
        self.stage_registry().map(|_| ())
    }
}

/// Settings file location when none is given explicitly.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("settings.json")
}

/// Load settings from `path` (or the default location). A missing file yields defaults.
pub fn load_settings(path: Option<&Path>) -> EngineResult<EngineSettings> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !path.exists() {
        log::info!(
            "No settings file at {}, using defaults",
            path.display()
        );
        return Ok(EngineSettings::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: EngineSettings = serde_json::from_str(&content)
        .map_err(|e| EngineError::config(format!("Failed to parse {}: {}", path.display(), e)))?;
    settings.validate()?;

    log::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Write settings as pretty JSON, creating parent directories.
pub fn save_settings(path: &Path, settings: &EngineSettings) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json)?;
    Ok(())
}
