//! Epic orchestration: drives an epic stage by stage until it needs a human
//! or finishes.
//!
//! Each iteration checks budget and attempt limits, writes a task card,
//! spawns and starts a session, watches it, tears it down, and applies the
//! router's decision. HUMAN decisions are delivered to the escalation
//! channel.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::devops::docker;
use crate::devops::error::{EngineError, EngineResult, Rationale};
use crate::devops::operations::agent_lifecycle::{SessionHandle, SessionSupervisor, SpawnRequest};
use crate::devops::operations::epic::{Epic, EpicManager, EpicStatus};
use crate::devops::operations::escalation::{EscalationChannel, EscalationMessage};
use crate::devops::operations::monitor::{AdaptiveMonitor, MonitorConfig};
use crate::devops::operations::patterns::{render_notes, PatternStore};
use crate::devops::operations::router::{OutcomeRouter, Priority, RoutingDecision};
use crate::devops::operations::task_card::{CardLocation, CardMailbox, TaskCardStore};
use crate::devops::orchestrator::WorkerBackend;
use crate::devops::pipeline::{RunStatus, WorkflowRun};
use crate::devops::stages::{StageDescriptor, StageRegistry};
use crate::devops::store::Store;
use crate::settings::{CardTransport, EngineSettings};

/// External collaborators of a driver
pub struct DriverDeps {
    pub store: Arc<Store>,
    pub backend: Arc<dyn WorkerBackend>,
    pub mailbox: Arc<dyn CardMailbox>,
    pub escalations: Arc<dyn EscalationChannel>,
    /// Optional pattern memory for card notes
    pub patterns: Option<Arc<dyn PatternStore>>,
}

/// Runs epics to a BLOCKED or terminal state.
pub struct EpicDriver {
    store: Arc<Store>,
    registry: Arc<StageRegistry>,
    manager: EpicManager,
    router: OutcomeRouter,
    supervisor: SessionSupervisor,
    monitor: AdaptiveMonitor,
    cards: TaskCardStore,
    backend: Arc<dyn WorkerBackend>,
    escalations: Arc<dyn EscalationChannel>,
    patterns: Option<Arc<dyn PatternStore>>,
    transport: CardTransport,
    container_prefix: String,
    teardown_grace: Duration,
}

impl EpicDriver {
    pub fn new(settings: &EngineSettings, deps: DriverDeps) -> EngineResult<Self> {
        settings.validate()?;
        let registry = Arc::new(settings.stage_registry()?);
        let manager = EpicManager::new(deps.store.clone(), registry.clone(), settings)?;

        Ok(Self {
            router: OutcomeRouter::new(registry.clone()),
            supervisor: SessionSupervisor::new(
                deps.backend.clone(),
                registry.clone(),
                deps.store.clone(),
            ),
            monitor: AdaptiveMonitor::new(
                deps.backend.clone(),
                deps.store.clone(),
                MonitorConfig::from(&settings.monitor),
            ),
            cards: TaskCardStore::new(
                deps.mailbox,
                settings.inbox_dir.clone(),
                settings.cards.parse_retries,
                settings.cards.retry_backoff(),
            ),
            store: deps.store,
            registry,
            manager,
            backend: deps.backend,
            escalations: deps.escalations,
            patterns: deps.patterns,
            transport: settings.cards.transport,
            container_prefix: settings.cards.container_prefix.clone(),
            teardown_grace: settings.monitor.teardown_grace(),
        })
    }

    pub fn manager(&self) -> &EpicManager {
        &self.manager
    }

    /// Replace the monitor tuning (dry runs poll far faster than real agents).
    pub fn with_monitor_config(mut self, config: MonitorConfig, teardown_grace: Duration) -> Self {
        self.monitor = AdaptiveMonitor::new(self.backend.clone(), self.store.clone(), config);
        self.teardown_grace = teardown_grace;
        self
    }

    /// Drive an epic while it is ACTIVE. Returns it BLOCKED, terminal, or
    /// still ACTIVE when cancelled between stages.
    pub async fn run_epic(
        &mut self,
        epic_id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Epic> {
        let runs = self.store.runs_for_epic(epic_id)?;
        self.supervisor.seed_from_runs(&runs);

        let mut epic = self.manager.get(epic_id)?;
        if let Some(running) = self.store.running_run(epic_id)? {
            epic = self.take_over(&epic, running, cancel).await?;
        }

        while epic.status == EpicStatus::Active {
            if cancel.is_cancelled() {
                log::info!("Stopping epic {} before {}: cancelled", epic.id, epic.current_stage);
                break;
            }
            epic = self.step(&epic, cancel).await?;
        }

        log::info!(
            "Epic {} is {} at {}{}",
            epic.id,
            epic.status,
            epic.current_stage,
            epic.blocked_reason
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
        Ok(epic)
    }

    /// One stage of an ACTIVE epic.
    async fn step(&mut self, epic: &Epic, cancel: &CancellationToken) -> EngineResult<Epic> {
        if let Some(decision) = self.manager.spawn_gate(epic)? {
            return self.apply(decision).await;
        }

        let descriptor = self
            .registry
            .get(&epic.current_stage)
            .cloned()
            .ok_or_else(|| {
                EngineError::invalid_transition(format!(
                    "epic {} sits at unregistered stage {}",
                    epic.id, epic.current_stage
                ))
            })?;

        let notes = self.pattern_notes(epic, &descriptor).await;
        let card_id = self.cards.create_card(
            &epic.id,
            &descriptor.name,
            &epic.objective,
            &descriptor.requirements,
            &notes,
        );

        let session_name = format!("{}_{}", epic.id, descriptor.name);
        let spawned = self.supervisor.spawn(SpawnRequest {
            stage_type: descriptor.name.as_str(),
            epic_id: &epic.id,
            card_ref: &card_id,
            session_name: &session_name,
            turn_budget: descriptor.turn_budget,
            resume: epic.resume_next,
            workspace: &epic.workspace.path,
        });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(EngineError::SpawnRejected(reason)) => {
                self.cards.forget(&card_id);
                return self.reject(epic, Rationale::SpawnRejected, reason).await;
            }
            Err(e) => return Err(e),
        };
        if epic.resume_next {
            self.manager.clear_resume(&epic.id)?;
        }

        let location = self.card_location(&handle, &card_id);
        let card_path = self.cards.publish(&card_id, location).await?;

        let run = match self
            .supervisor
            .start_run(&handle, &card_id, &card_path, &epic.objective)
            .await
        {
            Ok(run) => run,
            Err(EngineError::SpawnRejected(reason)) => {
                self.cards.forget(&card_id);
                return self.reject(epic, Rationale::SpawnRejected, reason).await;
            }
            Err(EngineError::Worker(reason)) => {
                self.cards.forget(&card_id);
                return self.reject(epic, Rationale::WorkerFailed, reason).await;
            }
            Err(e) => return Err(e),
        };

        self.conclude(&handle, run, cancel).await
    }

    /// Watch, persist, tear down, route.
    async fn conclude(
        &mut self,
        handle: &SessionHandle,
        run: WorkflowRun,
        cancel: &CancellationToken,
    ) -> EngineResult<Epic> {
        let card_id = run.card_id.clone();
        let mut fallback = run.clone();
        let watched = self.monitor.watch(handle, run, &mut self.cards, cancel).await;

        let mut run = match watched {
            Ok(run) => run,
            Err(e) => {
                self.stop(handle, &mut fallback).await;
                self.cards.forget(&card_id);
                return Err(e);
            }
        };
        self.stop(handle, &mut run).await;
        self.cards.forget(&card_id);
        self.manager.record_run(&run)?;

        let decision = self.router.decide(&handle.epic_id, &run);
        let decision = self.manager.enforce_budget(decision)?;
        self.apply(decision).await
    }

    /// Tear the session down, folding in usage the worker reports on exit.
    async fn stop(&mut self, handle: &SessionHandle, run: &mut WorkflowRun) {
        if let Err(e) = self
            .supervisor
            .teardown(handle, run, self.teardown_grace)
            .await
        {
            log::warn!("Teardown of run {} failed: {}", run.run_id, e);
        }
    }

    /// Resume control of a run left RUNNING by an earlier process.
    async fn take_over(
        &mut self,
        epic: &Epic,
        mut run: WorkflowRun,
        cancel: &CancellationToken,
    ) -> EngineResult<Epic> {
        let status = self.backend.status(&run.run_id).await?;
        if !status.is_alive() {
            log::warn!("Run {} of epic {} was interrupted", run.run_id, epic.id);
            run.finish(RunStatus::Failed, Some(Rationale::Interrupted));
            self.manager.record_run(&run)?;
            let decision = self.router.decide(&epic.id, &run);
            return self.apply(decision).await;
        }

        let turn_budget = self
            .registry
            .get(&run.stage_type)
            .map(|d| d.turn_budget)
            .unwrap_or(1);
        let handle = self
            .supervisor
            .adopt(&run, &epic.workspace.path, turn_budget)?;
        let location = self.card_location(&handle, &run.card_id);

        if let Err(e) = self.cards.reattach(&run.card_id, location).await {
            let reason = e.rationale().unwrap_or(Rationale::CardUnreachable);
            log::warn!("Could not reattach card {}: {}", run.card_id, e);
            self.stop(&handle, &mut run).await;
            run.finish(RunStatus::NeedsHuman, Some(reason));
            self.manager.record_run(&run)?;
            let decision = self.router.decide(&epic.id, &run);
            return self.apply(decision).await;
        }

        self.conclude(&handle, run, cancel).await
    }

    /// Mark RUNNING runs whose worker is gone as FAILED and block their epics.
    /// Returns the recovered run ids.
    pub async fn recover_interrupted_runs(&mut self) -> EngineResult<Vec<String>> {
        let mut recovered = Vec::new();
        for mut run in self.store.runs_with_status(RunStatus::Running)? {
            let status = self.backend.status(&run.run_id).await?;
            if status.is_alive() {
                log::debug!("Run {} is still alive", run.run_id);
                continue;
            }

            run.finish(RunStatus::Failed, Some(Rationale::Interrupted));
            self.manager.record_run(&run)?;
            recovered.push(run.run_id.clone());

            let epic = self.manager.get(&run.epic_id)?;
            if epic.status.is_terminal() {
                log::info!("Run {} was orphaned under finished epic {}", run.run_id, epic.id);
                continue;
            }
            let decision = self.router.decide(&epic.id, &run);
            self.apply(decision).await?;
        }

        if !recovered.is_empty() {
            log::info!("Recovered {} interrupted run(s)", recovered.len());
        }
        Ok(recovered)
    }

    /// Escalate a stage that never started.
    async fn reject(
        &mut self,
        epic: &Epic,
        rationale: Rationale,
        reason: String,
    ) -> EngineResult<Epic> {
        log::warn!("Stage {} of epic {} could not start: {}", epic.current_stage, epic.id, reason);
        let decision = RoutingDecision::human(
            &epic.id,
            None,
            &epic.current_stage,
            Priority::High,
            rationale,
            vec![reason],
        );
        self.apply(decision).await
    }

    /// Advance the epic; HUMAN outcomes and rejected transitions are escalated.
    async fn apply(&mut self, decision: RoutingDecision) -> EngineResult<Epic> {
        match self.manager.advance(&decision.epic_id, &decision) {
            Ok(epic) => {
                if decision.target.is_human() {
                    self.escalate(&epic, &decision).await?;
                }
                Ok(epic)
            }
            Err(EngineError::InvalidTransition(reason)) => {
                let current = self.manager.get(&decision.epic_id)?;
                if current.status.is_terminal() {
                    return Err(EngineError::InvalidTransition(reason));
                }
                log::warn!("Rejected transition for epic {}: {}", current.id, reason);
                let human = RoutingDecision::human(
                    &current.id,
                    decision.run_id.as_deref(),
                    &decision.source_stage,
                    Priority::High,
                    Rationale::InvalidTransition,
                    vec![reason, format!("router wanted {}", decision.target)],
                );
                let epic = self.manager.advance(&current.id, &human)?;
                self.escalate(&epic, &human).await?;
                Ok(epic)
            }
            Err(e) => Err(e),
        }
    }

    async fn escalate(&self, epic: &Epic, decision: &RoutingDecision) -> EngineResult<i64> {
        let usage = self.manager.usage(&epic.id)?;
        let message = EscalationMessage::from_decision(epic, decision, &usage, &self.registry);
        self.escalations.escalate(message).await
    }

    fn card_location(&self, handle: &SessionHandle, card_id: &str) -> CardLocation {
        match self.transport {
            CardTransport::Docker => CardLocation::in_container(
                &handle.workspace,
                card_id,
                &docker::container_name_for(&self.container_prefix, &handle.session_id),
            ),
            CardTransport::Worktree => CardLocation::in_workspace(&handle.workspace, card_id),
        }
    }

    /// Matching pattern notes for the stage. Lookup failures only cost the notes.
    async fn pattern_notes(&self, epic: &Epic, descriptor: &StageDescriptor) -> String {
        let patterns = match &self.patterns {
            Some(patterns) => patterns,
            None => return String::new(),
        };
        let query = format!("{} {} {}", descriptor.name, descriptor.brief, epic.objective);
        match patterns.search(&query, descriptor.name.as_str()).await {
            Ok(found) => {
                if !found.is_empty() {
                    log::debug!(
                        "{} pattern(s) for {} of epic {}",
                        found.len(),
                        descriptor.name,
                        epic.id
                    );
                }
                render_notes(&found)
            }
            Err(e) => {
                log::warn!("Pattern search for epic {} failed: {}", epic.id, e);
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devops::operations::escalation::LogEscalations;
    use crate::devops::sim::{SimulatedMailbox, SimulatedWorker, SimulatedWorld, SimulationScript};
    use crate::devops::stages::RouteTarget;

    fn driver(script: &str) -> (EpicDriver, Arc<Store>, SimulatedWorld, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = EngineSettings {
            workspace_root: dir.path().join("ws"),
            inbox_dir: dir.path().join("inbox"),
            ..EngineSettings::default()
        };
        let store = Arc::new(Store::open_in_memory().unwrap());
        let world = SimulatedWorld::new();
        let registry = Arc::new(settings.stage_registry().unwrap());
        let deps = DriverDeps {
            store: store.clone(),
            backend: Arc::new(SimulatedWorker::new(
                world.clone(),
                SimulationScript::parse(script).unwrap(),
                registry,
            )),
            mailbox: Arc::new(SimulatedMailbox::new(world.clone())),
            escalations: Arc::new(LogEscalations::default()),
            patterns: None,
        };
        (EpicDriver::new(&settings, deps).unwrap(), store, world, dir)
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalated_signal_blocks_epic() {
        let (mut driver, store, world, _dir) = driver("DESIGN=DESIGN_COMPLETE+SECURITY_RISK");
        let id = driver.manager().create_epic("harden auth").unwrap();

        let epic = driver.run_epic(&id, &CancellationToken::new()).await.unwrap();
        assert_eq!(epic.status, EpicStatus::Blocked);
        assert_eq!(epic.blocked_reason, Some(Rationale::SecurityRisk));
        assert_eq!(epic.current_stage.as_str(), "DESIGN");

        let decisions = store.decisions_for_epic(&id).unwrap();
        assert_eq!(decisions.last().unwrap().target, RouteTarget::Human);
        assert!(world.unreleased_runs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphaned_run_is_recovered() {
        let (mut driver, store, _world, _dir) = driver("");
        let id = driver.manager().create_epic("x").unwrap();
        let epic = driver.manager().get(&id).unwrap();

        let session = format!("{}_DESIGN_1", id);
        let mut orphan = WorkflowRun::pending(&id, &epic.current_stage, &session, 1, "card-gone");
        orphan.start("run-gone");
        store.insert_run(&orphan).unwrap();

        let recovered = driver.recover_interrupted_runs().await.unwrap();
        assert_eq!(recovered, vec!["run-gone".to_string()]);

        let run = store.load_run("run-gone").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stop_reason, Some(Rationale::Interrupted));
        let epic = driver.manager().get(&id).unwrap();
        assert_eq!(epic.status, EpicStatus::Blocked);
        assert_eq!(epic.blocked_reason, Some(Rationale::Interrupted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_blocks_as_aborted() {
        let (mut driver, _store, _world, _dir) = driver("DESIGN=STALL");
        let id = driver.manager().create_epic("x").unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            trigger.cancel();
        });

        let epic = driver.run_epic(&id, &cancel).await.unwrap();
        assert_eq!(epic.status, EpicStatus::Blocked);
        assert_eq!(epic.blocked_reason, Some(Rationale::Aborted));
    }
}
