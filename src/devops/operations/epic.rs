//! Epic creation and lifecycle management.
//!
//! The manager is the only writer of epic state. It applies routing
//! decisions, enforces budget and attempt ceilings, and applies operator
//! resolutions and overrides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use super::escalation::ResolutionOption;
use super::router::{Priority, RoutingDecision};
use crate::devops::error::{EngineError, EngineResult, Rationale};
use crate::devops::pipeline::WorkflowRun;
use crate::devops::stages::{RouteTarget, StageRegistry, StageType};
use crate::devops::store::Store;
use crate::devops::worktree;
use crate::settings::{BudgetSettings, EngineSettings};

/// Lifecycle status of an epic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EpicStatus {
    /// A stage is running or about to be spawned
    Active,
    /// Waiting on an operator
    Blocked,
    /// Reached a terminal stage or an explicit COMPLETED decision
    Completed,
    /// Explicitly routed to FAILED or abandoned
    Failed,
}

impl EpicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Blocked => "BLOCKED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for EpicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EpicStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "BLOCKED" => Ok(Self::Blocked),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("Unknown epic status '{}'", other)),
        }
    }
}

/// Workspace and branch identity owned by an epic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpicWorkspace {
    /// Directory the RUNNING stage's session works in
    pub path: PathBuf,
    /// Branch name (e.g., "epic/epic-1a2b3c4d")
    pub branch: String,
}

/// A top-level objective tracked through its stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    /// Epic identifier (e.g., "epic-1a2b3c4d")
    pub id: String,
    /// Objective text as supplied by the user
    pub objective: String,
    /// Workspace/branch identity
    pub workspace: EpicWorkspace,
    /// Stage that runs next (or ran last, once terminal)
    pub current_stage: StageType,
    /// Lifecycle status
    pub status: EpicStatus,
    /// Run ids in execution order
    pub stage_history: Vec<String>,
    /// ISO timestamp when the epic was created
    pub created_at: String,
    /// ISO timestamp of the last state change
    pub updated_at: String,
    /// Next spawn of the current stage resumes the previous session
    pub resume_next: bool,
    /// Why the epic is BLOCKED
    pub blocked_reason: Option<Rationale>,
    /// Index into `stage_history` where attempt counting restarts
    pub attempt_floor: usize,
}

/// Cumulative usage across an epic's runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EpicUsage {
    pub runs: usize,
    pub turns: u64,
    pub cost: f64,
}

/// Owns epic lifecycle and its invariants.
pub struct EpicManager {
    store: Arc<Store>,
    registry: Arc<StageRegistry>,
    budget: BudgetSettings,
    workspace_root: PathBuf,
    source_repo: Option<PathBuf>,
    initial_stage: StageType,
    max_stage_attempts: u32,
}

impl EpicManager {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<StageRegistry>,
        settings: &EngineSettings,
    ) -> EngineResult<Self> {
        let initial_stage = registry
            .lookup(&settings.initial_stage)
            .map(|d| d.name.clone())
            .ok_or_else(|| {
                EngineError::config(format!(
                    "Initial stage '{}' is not registered",
                    settings.initial_stage
                ))
            })?;

        Ok(Self {
            store,
            registry,
            budget: settings.budget.clone(),
            workspace_root: settings.workspace_root.clone(),
            source_repo: settings.source_repo.clone(),
            initial_stage,
            max_stage_attempts: settings.max_stage_attempts,
        })
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Create an epic, allocate its workspace and branch, and mark it ACTIVE.
    pub fn create_epic(&self, objective: &str) -> EngineResult<String> {
        let objective = objective.trim();
        if objective.is_empty() {
            return Err(EngineError::config("Epic objective cannot be empty"));
        }

        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("epic-{}", &short[..8]);
        let branch = format!("epic/{}", id);
        let path = self.workspace_root.join(&id);

        match &self.source_repo {
            Some(repo) => worktree::create_worktree(repo, &branch, &path)
                .map_err(EngineError::worker)?,
            None => std::fs::create_dir_all(&path)?,
        }

        let now = chrono::Utc::now().to_rfc3339();
        let epic = Epic {
            id: id.clone(),
            objective: objective.to_string(),
            workspace: EpicWorkspace { path, branch },
            current_stage: self.initial_stage.clone(),
            status: EpicStatus::Active,
            stage_history: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
            resume_next: false,
            blocked_reason: None,
            attempt_floor: 0,
        };
        self.store.insert_epic(&epic)?;

        log::info!(
            "Created epic {} at stage {} in {}",
            epic.id,
            epic.current_stage,
            epic.workspace.path.display()
        );
        Ok(id)
    }

    pub fn get(&self, epic_id: &str) -> EngineResult<Epic> {
        self.store
            .load_epic(epic_id)?
            .ok_or_else(|| EngineError::not_found(format!("epic {}", epic_id)))
    }

    pub fn list(&self, status: Option<EpicStatus>) -> EngineResult<Vec<Epic>> {
        self.store.list_epics(status)
    }

    /// Cumulative cost and turns across the epic's stage history.
    pub fn usage(&self, epic_id: &str) -> EngineResult<EpicUsage> {
        let runs = self.store.runs_for_epic(epic_id)?;
        Ok(EpicUsage {
            runs: runs.len(),
            turns: runs.iter().map(|r| r.turns_used).sum(),
            cost: runs.iter().map(|r| r.cost).sum(),
        })
    }

    /// Describe the exceeded ceiling, if any. Ceilings are exclusive: equal is allowed.
    pub fn budget_violation(&self, usage: &EpicUsage) -> Option<String> {
        if let Some(max_cost) = self.budget.max_cost_usd {
            if usage.cost > max_cost {
                return Some(format!(
                    "cumulative cost ${:.2} exceeds ceiling ${:.2}",
                    usage.cost, max_cost
                ));
            }
        }
        if let Some(max_turns) = self.budget.max_turns {
            if usage.turns > max_turns {
                return Some(format!(
                    "cumulative turns {} exceed ceiling {}",
                    usage.turns, max_turns
                ));
            }
        }
        None
    }

    /// Check ceilings before a spawn. `Some` is a forced HUMAN decision.
    pub fn spawn_gate(&self, epic: &Epic) -> EngineResult<Option<RoutingDecision>> {
        let usage = self.usage(&epic.id)?;
        if let Some(issue) = self.budget_violation(&usage) {
            return Ok(Some(RoutingDecision::human(
                &epic.id,
                None,
                &epic.current_stage,
                Priority::Critical,
                Rationale::BudgetExceeded,
                vec![issue],
            )));
        }

        let attempts = self.attempts(epic)?;
        if attempts >= self.max_stage_attempts as usize {
            return Ok(Some(RoutingDecision::human(
                &epic.id,
                None,
                &epic.current_stage,
                Priority::High,
                Rationale::AttemptLimit,
                vec![format!(
                    "stage {} already ran {} times (limit {})",
                    epic.current_stage, attempts, self.max_stage_attempts
                )],
            )));
        }

        Ok(None)
    }

    /// Runs of the current stage since the attempt floor.
    fn attempts(&self, epic: &Epic) -> EngineResult<usize> {
        let runs = self.store.runs_for_epic(&epic.id)?;
        Ok(runs
            .iter()
            .skip(epic.attempt_floor)
            .filter(|r| r.stage_type == epic.current_stage)
            .count())
    }

    /// Replace the router's output with a forced HUMAN decision when over budget.
    ///
    /// A safety escalation from the router keeps its rationale; the budget
    /// issue is added to its blocking issues.
    pub fn enforce_budget(&self, decision: RoutingDecision) -> EngineResult<RoutingDecision> {
        let usage = self.usage(&decision.epic_id)?;
        let issue = match self.budget_violation(&usage) {
            Some(issue) => issue,
            None => return Ok(decision),
        };

        if decision.target.is_human() && decision.rationale.is_safety() {
            log::warn!(
                "Epic {} over budget while escalating {}: {}",
                decision.epic_id,
                decision.rationale,
                issue
            );
            let mut decision = decision;
            decision.blocking_issues.push(issue);
            return Ok(decision);
        }

        log::warn!(
            "Epic {} over budget, overriding route to {}: {}",
            decision.epic_id,
            decision.target,
            issue
        );
        let mut issues = vec![issue];
        if !decision.target.is_human() {
            issues.push(format!("router wanted {}", decision.target));
        }
        issues.extend(decision.blocking_issues);
        Ok(RoutingDecision::human(
            &decision.epic_id,
            decision.run_id.as_deref(),
            &decision.source_stage,
            Priority::Critical,
            Rationale::BudgetExceeded,
            issues,
        ))
    }

    /// Apply a routing decision.
    ///
    /// Targets outside the registered table fail with `InvalidTransition` and
    /// leave the epic untouched. HUMAN blocks the epic; COMPLETED/FAILED or a
    /// terminal stage finish it.
    pub fn advance(&self, epic_id: &str, decision: &RoutingDecision) -> EngineResult<Epic> {
        let mut epic = self.get(epic_id)?;

        if epic.status.is_terminal() {
            return Err(EngineError::invalid_transition(format!(
                "epic {} is already {}",
                epic.id, epic.status
            )));
        }
        if !self.registry.accepts(&decision.target) {
            return Err(EngineError::invalid_transition(format!(
                "target '{}' is not a registered stage",
                decision.target
            )));
        }

        self.store.insert_decision(decision)?;

        match &decision.target {
            RouteTarget::Human => {
                epic.status = EpicStatus::Blocked;
                epic.blocked_reason = Some(decision.rationale);
            }
            RouteTarget::Completed => {
                epic.status = EpicStatus::Completed;
                epic.blocked_reason = None;
            }
            RouteTarget::Failed => {
                epic.status = EpicStatus::Failed;
                epic.blocked_reason = None;
            }
            RouteTarget::Stage(stage) => {
                if *stage != epic.current_stage {
                    epic.resume_next = false;
                }
                epic.current_stage = stage.clone();
                epic.blocked_reason = None;
                epic.status = if self.registry.is_terminal(stage) {
                    EpicStatus::Completed
                } else {
                    EpicStatus::Active
                };
            }
        }
        epic.updated_at = chrono::Utc::now().to_rfc3339();
        self.store.update_epic(&epic)?;

        log::info!(
            "Epic {}: {} -> {} ({}), status {}",
            epic.id,
            decision.source_stage,
            decision.target,
            decision.rationale,
            epic.status
        );
        Ok(epic)
    }

    /// Clear the one-shot resume flag once a spawn consumed it.
    pub fn clear_resume(&self, epic_id: &str) -> EngineResult<()> {
        let mut epic = self.get(epic_id)?;
        if epic.resume_next {
            epic.resume_next = false;
            epic.updated_at = chrono::Utc::now().to_rfc3339();
            self.store.update_epic(&epic)?;
        }
        Ok(())
    }

    /// Persist a run's latest state.
    pub fn record_run(&self, run: &WorkflowRun) -> EngineResult<()> {
        self.store.update_run(run)
    }

    /// Hold the epic at its current stage without a routing decision.
    pub fn block(&self, epic_id: &str, rationale: Rationale) -> EngineResult<Epic> {
        let mut epic = self.get(epic_id)?;
        if epic.status.is_terminal() {
            return Err(EngineError::invalid_transition(format!(
                "epic {} is already {}",
                epic.id, epic.status
            )));
        }
        epic.status = EpicStatus::Blocked;
        epic.blocked_reason = Some(rationale);
        epic.updated_at = chrono::Utc::now().to_rfc3339();
        self.store.update_epic(&epic)?;
        log::warn!("Epic {} blocked at {} ({})", epic.id, epic.current_stage, rationale);
        Ok(epic)
    }

    /// Apply an operator's answer to a BLOCKED epic.
    pub fn resolve(&self, epic_id: &str, option: &ResolutionOption) -> EngineResult<Epic> {
        let epic = self.get(epic_id)?;
        if epic.status != EpicStatus::Blocked {
            return Err(EngineError::invalid_transition(format!(
                "epic {} is {}, not BLOCKED",
                epic.id, epic.status
            )));
        }

        let target = match option {
            ResolutionOption::Pause => {
                log::info!("Epic {} stays BLOCKED by operator request", epic.id);
                return Ok(epic);
            }
            ResolutionOption::Resume | ResolutionOption::Retry => {
                RouteTarget::Stage(epic.current_stage.clone())
            }
            ResolutionOption::Route(stage) => RouteTarget::Stage(stage.clone()),
            ResolutionOption::Complete => RouteTarget::Completed,
            ResolutionOption::Abandon => RouteTarget::Failed,
        };

        let decision = RoutingDecision {
            epic_id: epic.id.clone(),
            run_id: None,
            source_stage: epic.current_stage.clone(),
            target,
            priority: Priority::Normal,
            rationale: Rationale::Resolution,
            blocking_issues: vec![format!("operator chose {}", option)],
            decided_at: chrono::Utc::now().to_rfc3339(),
        };
        let mut epic = self.advance(&epic.id, &decision)?;

        if epic.status == EpicStatus::Active {
            epic.resume_next = matches!(option, ResolutionOption::Resume);
            epic.attempt_floor = epic.stage_history.len();
            epic.updated_at = chrono::Utc::now().to_rfc3339();
            self.store.update_epic(&epic)?;
        }
        Ok(epic)
    }

    /// Operator override: move the epic to `stage` regardless of routing.
    pub fn override_stage(&self, epic_id: &str, stage: &str) -> EngineResult<Epic> {
        let epic = self.get(epic_id)?;
        let target = self
            .registry
            .lookup(stage)
            .map(|d| RouteTarget::Stage(d.name.clone()))
            .ok_or_else(|| {
                EngineError::invalid_transition(format!("'{}' is not a registered stage", stage))
            })?;
        if self.store.running_run(&epic.id)?.is_some() {
            return Err(EngineError::invalid_transition(format!(
                "epic {} has a RUNNING stage; abort it before overriding",
                epic.id
            )));
        }

        let decision = RoutingDecision {
            epic_id: epic.id.clone(),
            run_id: None,
            source_stage: epic.current_stage.clone(),
            target,
            priority: Priority::High,
            rationale: Rationale::Override,
            blocking_issues: Vec::new(),
            decided_at: chrono::Utc::now().to_rfc3339(),
        };
        let mut epic = self.advance(&epic.id, &decision)?;
        epic.attempt_floor = epic.stage_history.len();
        self.store.update_epic(&epic)?;
        Ok(epic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devops::pipeline::RunStatus;

    fn manager_with(settings: EngineSettings) -> (EpicManager, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = EngineSettings {
            workspace_root: dir.path().to_path_buf(),
            ..settings
        };
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(settings.stage_registry().unwrap());
        let manager = EpicManager::new(store.clone(), registry, &settings).unwrap();
        (manager, store, dir)
    }

    fn manager() -> (EpicManager, Arc<Store>, tempfile::TempDir) {
        manager_with(EngineSettings::default())
    }

    fn completed_run(epic_id: &str, run_id: &str, stage: &str, cost: f64) -> WorkflowRun {
        let stage = StageType::new(stage).unwrap();
        let mut run = WorkflowRun::pending(epic_id, &stage, "s", 1, "c");
        run.start(run_id);
        run.cost = cost;
        run.turns_used = 10;
        run.finish(RunStatus::Completed, None);
        run
    }

    fn route(epic_id: &str, from: &str, to: &str) -> RoutingDecision {
        RoutingDecision {
            epic_id: epic_id.to_string(),
            run_id: None,
            source_stage: StageType::new(from).unwrap(),
            target: to.parse().unwrap(),
            priority: Priority::Normal,
            rationale: Rationale::Routed,
            blocking_issues: Vec::new(),
            decided_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_create_epic_allocates_workspace() {
        let (manager, _store, dir) = manager();
        let id = manager.create_epic("add feature X").unwrap();
        let epic = manager.get(&id).unwrap();
        assert!(id.starts_with("epic-"));
        assert_eq!(epic.status, EpicStatus::Active);
        assert_eq!(epic.current_stage.as_str(), "DESIGN");
        assert_eq!(epic.workspace.branch, format!("epic/{}", id));
        assert_eq!(epic.workspace.path, dir.path().join(&id));
        assert!(epic.workspace.path.is_dir());
        assert!(manager.create_epic("   ").is_err());
    }

    #[test]
    fn test_advance_rejects_unregistered_target() {
        let (manager, _store, _dir) = manager();
        let id = manager.create_epic("x").unwrap();
        let err = manager.advance(&id, &route(&id, "DESIGN", "NOWHERE")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
        let epic = manager.get(&id).unwrap();
        assert_eq!(epic.current_stage.as_str(), "DESIGN");
        assert_eq!(epic.status, EpicStatus::Active);
    }

    #[test]
    fn test_advance_human_blocks_and_terminal_completes() {
        let (manager, _store, _dir) = manager();
        let id = manager.create_epic("x").unwrap();

        let mut human = route(&id, "DESIGN", "HUMAN");
        human.rationale = Rationale::SignalMissing;
        let epic = manager.advance(&id, &human).unwrap();
        assert_eq!(epic.status, EpicStatus::Blocked);
        assert_eq!(epic.blocked_reason, Some(Rationale::SignalMissing));

        let epic = manager.advance(&id, &route(&id, "VALIDATE", "RELEASE")).unwrap();
        assert_eq!(epic.status, EpicStatus::Completed);
        assert_eq!(epic.current_stage.as_str(), "RELEASE");

        let err = manager.advance(&id, &route(&id, "RELEASE", "BUILD")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[test]
    fn test_budget_ceiling_blocks_next_spawn() {
        let mut settings = EngineSettings::default();
        settings.budget.max_cost_usd = Some(150.0);
        let (manager, store, _dir) = manager_with(settings);
        let id = manager.create_epic("x").unwrap();

        store.insert_run(&completed_run(&id, "run-1", "DESIGN", 100.0)).unwrap();
        store.insert_run(&completed_run(&id, "run-2", "BUILD", 51.0)).unwrap();

        let epic = manager.get(&id).unwrap();
        let decision = manager.spawn_gate(&epic).unwrap().expect("gate should trip");
        assert_eq!(decision.target, RouteTarget::Human);
        assert_eq!(decision.rationale, Rationale::BudgetExceeded);

        let routed = manager.enforce_budget(route(&id, "BUILD", "VALIDATE")).unwrap();
        assert_eq!(routed.target, RouteTarget::Human);
        assert_eq!(routed.rationale, Rationale::BudgetExceeded);
    }

    #[test]
    fn test_safety_escalation_survives_budget_override() {
        let mut settings = EngineSettings::default();
        settings.budget.max_turns = Some(0);
        let (manager, store, _dir) = manager_with(settings);
        let id = manager.create_epic("x").unwrap();
        let mut run = completed_run(&id, "run-1", "DESIGN", 1.0);
        run.turns_used = 4;
        store.insert_run(&run).unwrap();

        let breaking = RoutingDecision::human(
            &id,
            Some("run-1"),
            &StageType::new("DESIGN").unwrap(),
            Priority::Critical,
            Rationale::BreakingChange,
            vec!["DESIGN declared BREAKING_CHANGE".to_string()],
        );
        let decision = manager.enforce_budget(breaking).unwrap();
        assert_eq!(decision.rationale, Rationale::BreakingChange);
        assert_eq!(decision.blocking_issues.len(), 2);
        assert_eq!(decision.blocking_issues[0], "DESIGN declared BREAKING_CHANGE");
        assert!(decision.blocking_issues[1].contains("exceed ceiling 0"));

        let stuck = RoutingDecision::human(
            &id,
            Some("run-1"),
            &StageType::new("DESIGN").unwrap(),
            Priority::High,
            Rationale::Stuck,
            Vec::new(),
        );
        let decision = manager.enforce_budget(stuck).unwrap();
        assert_eq!(decision.rationale, Rationale::BudgetExceeded);
    }

    #[test]
    fn test_budget_at_ceiling_is_allowed() {
        let mut settings = EngineSettings::default();
        settings.budget.max_cost_usd = Some(150.0);
        let (manager, store, _dir) = manager_with(settings);
        let id = manager.create_epic("x").unwrap();
        store.insert_run(&completed_run(&id, "run-1", "DESIGN", 150.0)).unwrap();
        assert!(manager.spawn_gate(&manager.get(&id).unwrap()).unwrap().is_none());
    }

    #[test]
    fn test_attempt_limit_and_retry_resets_it() {
        let (manager, store, _dir) = manager();
        let id = manager.create_epic("x").unwrap();
        for n in 0..3 {
            store
                .insert_run(&completed_run(&id, &format!("run-{}", n), "DESIGN", 1.0))
                .unwrap();
        }
        let epic = manager.get(&id).unwrap();
        let gate = manager.spawn_gate(&epic).unwrap().unwrap();
        assert_eq!(gate.rationale, Rationale::AttemptLimit);
        manager.advance(&id, &gate).unwrap();

        let epic = manager.resolve(&id, &ResolutionOption::Retry).unwrap();
        assert_eq!(epic.status, EpicStatus::Active);
        assert_eq!(epic.attempt_floor, 3);
        assert!(manager.spawn_gate(&epic).unwrap().is_none());
    }

    #[test]
    fn test_resolve_options() {
        let (manager, _store, _dir) = manager();
        let id = manager.create_epic("x").unwrap();
        let human = route(&id, "DESIGN", "HUMAN");
        manager.advance(&id, &human).unwrap();

        let epic = manager.resolve(&id, &ResolutionOption::Pause).unwrap();
        assert_eq!(epic.status, EpicStatus::Blocked);

        let epic = manager.resolve(&id, &ResolutionOption::Resume).unwrap();
        assert_eq!(epic.status, EpicStatus::Active);
        assert!(epic.resume_next);
        assert!(manager.resolve(&id, &ResolutionOption::Resume).is_err());

        manager.advance(&id, &human).unwrap();
        let epic = manager.resolve(&id, &ResolutionOption::Abandon).unwrap();
        assert_eq!(epic.status, EpicStatus::Failed);
    }

    #[test]
    fn test_override_stage() {
        let (manager, _store, _dir) = manager();
        let id = manager.create_epic("x").unwrap();
        let epic = manager.override_stage(&id, "build").unwrap();
        assert_eq!(epic.current_stage.as_str(), "BUILD");
        assert!(matches!(
            manager.override_stage(&id, "SHIP"),
            Err(EngineError::InvalidTransition(_))
        ));
    }
}
