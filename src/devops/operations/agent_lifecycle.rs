//! Agent lifecycle operations: spawn, start, teardown.
//!
//! The supervisor hands out session handles keyed `{base}_{iteration}`,
//! enforces one RUNNING run per epic through a workspace lease, and tears
//! sessions down gracefully before forcing them.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::devops::error::{EngineError, EngineResult};
use crate::devops::orchestrator::{WorkerBackend, WorkerInvocation};
use crate::devops::pipeline::{OutcomeSignal, WorkflowRun};
use crate::devops::stages::{StageDescriptor, StageRegistry, StageType};
use crate::devops::store::Store;

/// Longest accepted session base name
pub const MAX_SESSION_NAME: usize = 64;

/// Interval between status checks while waiting for a graceful exit
const TEARDOWN_POLL: Duration = Duration::from_secs(1);

static SESSION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").unwrap());

/// A stage session the supervisor has allocated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Full session key `{base}_{iteration}`
    pub session_id: String,
    /// Name requested by the caller
    pub base_name: String,
    pub iteration: u32,
    pub epic_id: String,
    pub stage_type: StageType,
    /// Workspace the session runs in
    pub workspace: PathBuf,
    /// Card the session was spawned for
    pub card_ref: String,
    pub turn_budget: u32,
    /// Whether the worker should continue the previous conversation
    pub resume: bool,
}

/// Arguments for [`SessionSupervisor::spawn`]
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub stage_type: &'a str,
    pub epic_id: &'a str,
    pub card_ref: &'a str,
    pub session_name: &'a str,
    pub turn_budget: u32,
    pub resume: bool,
    pub workspace: &'a Path,
}

/// Split `{base}_{iteration}` back into its parts.
pub fn split_session_id(session_id: &str) -> Option<(&str, u32)> {
    let (base, iteration) = session_id.rsplit_once('_')?;
    Some((base, iteration.parse().ok()?))
}

/// Check a session base name. Returns a description of the problem.
pub fn validate_session_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("session name is empty".to_string());
    }
    if name.len() > MAX_SESSION_NAME {
        return Err(format!(
            "session name is {} characters (max {})",
            name.len(),
            MAX_SESSION_NAME
        ));
    }
    if !SESSION_NAME.is_match(name) {
        return Err(format!(
            "session name '{}' must start with a letter or digit and contain only \
             letters, digits, '_' or '-'",
            name
        ));
    }
    Ok(())
}

/// Prompt handed to the stage's agent.
pub fn build_stage_prompt(
    descriptor: &StageDescriptor,
    objective: &str,
    card_path: &Path,
) -> String {
    let mut signals: Vec<String> = Vec::new();
    for rule in &descriptor.routes {
        let name = rule.signal.to_string();
        if !signals.contains(&name) {
            signals.push(name);
        }
    }
    signals.extend(OutcomeSignal::SAFETY_ORDER.iter().map(|s| s.to_string()));

    let mut prompt = String::new();
    if !descriptor.brief.is_empty() {
        prompt.push_str(&descriptor.brief);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!("Objective: {}\n\n", objective));
    prompt.push_str(&format!(
        "Your task card is at {}. Set `started` when you begin. Check each \
         requirement (`- [x]`) as you finish it and never reword or remove one. \
         When you are done, set `completed` and list your outcome signals in \
         `signals`, choosing from: {}.",
        card_path.display(),
        signals.join(", ")
    ));
    prompt
}

/// Allocates sessions and drives them through the worker backend.
pub struct SessionSupervisor {
    backend: Arc<dyn WorkerBackend>,
    registry: Arc<StageRegistry>,
    store: Arc<Store>,
    handles: HashMap<String, SessionHandle>,
    /// Highest iteration seen per base name, from persisted runs
    seeded: HashMap<String, u32>,
    /// epic id -> session id currently holding the workspace
    leases: HashMap<String, String>,
    /// Sessions handed back by a resume spawn, not yet started
    resuming: HashSet<String>,
}

impl SessionSupervisor {
    pub fn new(
        backend: Arc<dyn WorkerBackend>,
        registry: Arc<StageRegistry>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            backend,
            registry,
            store,
            handles: HashMap::new(),
            seeded: HashMap::new(),
            leases: HashMap::new(),
            resuming: HashSet::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn WorkerBackend> {
        &self.backend
    }

    /// Continue iteration numbering from runs persisted by an earlier process.
    pub fn seed_from_runs(&mut self, runs: &[WorkflowRun]) {
        for run in runs {
            if let Some((base, iteration)) = split_session_id(&run.session_id) {
                let entry = self.seeded.entry(base.to_string()).or_insert(0);
                *entry = (*entry).max(iteration);
            }
        }
    }

    /// Allocate a session handle. Invalid input is rejected without side effects.
    pub fn spawn(&mut self, request: SpawnRequest<'_>) -> EngineResult<SessionHandle> {
        let descriptor = self.registry.lookup(request.stage_type).ok_or_else(|| {
            EngineError::spawn_rejected(format!(
                "'{}' is not a registered stage",
                request.stage_type
            ))
        })?;
        validate_session_name(request.session_name).map_err(EngineError::spawn_rejected)?;
        if request.epic_id.trim().is_empty() {
            return Err(EngineError::spawn_rejected("epic id is empty"));
        }
        if request.card_ref.trim().is_empty() {
            return Err(EngineError::spawn_rejected("card reference is empty"));
        }
        if request.turn_budget == 0 {
            return Err(EngineError::spawn_rejected("turn budget must be positive"));
        }

        let base = request.session_name.to_string();
        let previous = self
            .handles
            .get(&base)
            .map(|h| h.iteration)
            .or_else(|| self.seeded.get(&base).copied());

        if request.resume {
            if let Some(existing) = self.handles.get(&base) {
                log::debug!("Resuming session {}", existing.session_id);
                self.resuming.insert(existing.session_id.clone());
                return Ok(existing.clone());
            }
        }

        let (iteration, resume) = match (previous, request.resume) {
            // A seeded session from an earlier process keeps its key
            (Some(iteration), true) => (iteration, true),
            (Some(iteration), false) => (iteration + 1, false),
            (None, _) => (1, false),
        };

        let handle = SessionHandle {
            session_id: format!("{}_{}", base, iteration),
            base_name: base.clone(),
            iteration,
            epic_id: request.epic_id.to_string(),
            stage_type: descriptor.name.clone(),
            workspace: request.workspace.to_path_buf(),
            card_ref: request.card_ref.to_string(),
            turn_budget: request.turn_budget,
            resume,
        };
        log::debug!(
            "Allocated session {} for epic {} ({})",
            handle.session_id,
            handle.epic_id,
            handle.stage_type
        );
        self.handles.insert(base, handle.clone());
        Ok(handle)
    }

    /// Session currently holding an epic's workspace.
    pub fn lease_holder(&self, epic_id: &str) -> Option<&str> {
        self.leases.get(epic_id).map(String::as_str)
    }

    fn acquire(&mut self, handle: &SessionHandle) -> EngineResult<()> {
        if let Some(holder) = self.leases.get(&handle.epic_id) {
            if holder != &handle.session_id {
                return Err(EngineError::spawn_rejected(format!(
                    "workspace of epic {} is held by session {}",
                    handle.epic_id, holder
                )));
            }
        }
        self.leases
            .insert(handle.epic_id.clone(), handle.session_id.clone());
        Ok(())
    }

    /// Invoke the worker for a handle. The returned run is RUNNING and persisted.
    pub async fn start_run(
        &mut self,
        handle: &SessionHandle,
        card_id: &str,
        card_path: &Path,
        objective: &str,
    ) -> EngineResult<WorkflowRun> {
        let descriptor = self
            .registry
            .get(&handle.stage_type)
            .ok_or_else(|| {
                EngineError::spawn_rejected(format!(
                    "'{}' is not a registered stage",
                    handle.stage_type
                ))
            })?
            .clone();

        if let Some(running) = self.store.running_run(&handle.epic_id)? {
            return Err(EngineError::spawn_rejected(format!(
                "epic {} already has RUNNING run {} ({})",
                handle.epic_id, running.run_id, running.stage_type
            )));
        }
        self.acquire(handle)?;
        let resume = self.resuming.remove(&handle.session_id) || handle.resume;

        let invocation = WorkerInvocation {
            epic_id: handle.epic_id.clone(),
            stage_type: handle.stage_type.clone(),
            objective: objective.to_string(),
            session_name: handle.session_id.clone(),
            max_turns: handle.turn_budget,
            resume,
            workspace_override: Some(handle.workspace.clone()),
            agent_type: descriptor.agent_type.clone(),
            card_path: card_path.to_path_buf(),
            prompt: build_stage_prompt(&descriptor, objective, card_path),
        };

        let mut run = WorkflowRun::pending(
            &handle.epic_id,
            &handle.stage_type,
            &handle.session_id,
            handle.iteration,
            card_id,
        );
        let run_id = match self.backend.invoke(invocation).await {
            Ok(run_id) => run_id,
            Err(e) => {
                self.leases.remove(&handle.epic_id);
                return Err(e);
            }
        };
        run.start(&run_id);
        if let Err(e) = self.store.insert_run(&run) {
            log::warn!("Could not record run {}, stopping it: {}", run_id, e);
            if let Err(e) = self.backend.terminate(&run_id, true).await {
                log::warn!("Forced stop of {} failed: {}", run_id, e);
            }
            if let Err(e) = self.backend.release(&run_id).await {
                log::warn!("Release of {} failed: {}", run_id, e);
            }
            self.leases.remove(&handle.epic_id);
            return Err(e);
        }

        log::info!(
            "Started {} for epic {} as run {} (session {})",
            handle.stage_type,
            handle.epic_id,
            run_id,
            handle.session_id
        );
        Ok(run)
    }

    /// Take over a RUNNING run left by an earlier process.
    pub fn adopt(
        &mut self,
        run: &WorkflowRun,
        workspace: &Path,
        turn_budget: u32,
    ) -> EngineResult<SessionHandle> {
        let (base, iteration) = split_session_id(&run.session_id).ok_or_else(|| {
            EngineError::invalid_transition(format!(
                "run {} has malformed session id {}",
                run.run_id, run.session_id
            ))
        })?;
        let handle = SessionHandle {
            session_id: run.session_id.clone(),
            base_name: base.to_string(),
            iteration,
            epic_id: run.epic_id.clone(),
            stage_type: run.stage_type.clone(),
            workspace: workspace.to_path_buf(),
            card_ref: run.card_id.clone(),
            turn_budget,
            resume: false,
        };
        self.acquire(&handle)?;
        self.handles.insert(handle.base_name.clone(), handle.clone());
        log::info!("Adopted run {} in session {}", run.run_id, run.session_id);
        Ok(handle)
    }

    /// Stop a run: graceful first, forced after `grace`. The lease is always released.
    ///
    /// Usage reported while the worker winds down is folded into `run`, since
    /// agents often write their final turns and cost only on exit.
    pub async fn teardown(
        &mut self,
        handle: &SessionHandle,
        run: &mut WorkflowRun,
        grace: Duration,
    ) -> EngineResult<()> {
        let result = self.stop_worker(run, grace).await;
        if self.leases.get(&handle.epic_id) == Some(&handle.session_id) {
            self.leases.remove(&handle.epic_id);
        }
        result
    }

    async fn stop_worker(&self, run: &mut WorkflowRun, grace: Duration) -> EngineResult<()> {
        let run_id = run.run_id.clone();
        if let Err(e) = self.backend.terminate(&run_id, false).await {
            log::warn!("Graceful terminate of {} failed: {}", run_id, e);
        }

        let mut waited = Duration::ZERO;
        let mut alive = self.observe(run).await;
        while alive && waited < grace {
            let step = TEARDOWN_POLL.min(grace - waited);
            tokio::time::sleep(step).await;
            waited += step;
            alive = self.observe(run).await;
        }

        let mut first_error = None;
        if alive {
            log::warn!("Run {} ignored graceful stop for {:?}, forcing", run_id, grace);
            if let Err(e) = self.backend.terminate(&run_id, true).await {
                log::warn!("Forced stop of {} failed: {}", run_id, e);
                first_error = Some(e);
            }
        }

        let released = self.backend.release(&run_id).await;
        match first_error {
            Some(e) => Err(e),
            None => released,
        }
    }

    /// Poll the worker once during teardown. An unanswered query counts as alive.
    async fn observe(&self, run: &mut WorkflowRun) -> bool {
        match self.backend.status(&run.run_id).await {
            Ok(status) => {
                run.record_usage(status.turns_used, status.cost);
                status.is_alive()
            }
            Err(e) => {
                log::warn!("Status of {} unavailable during teardown: {}", run.run_id, e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devops::pipeline::RunStatus;
    use crate::devops::orchestrator::{WorkerState, WorkerStatus};
    use crate::devops::sim::{SimulatedWorker, SimulatedWorld, SimulationScript};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Worker that only reports usage once stopped, with injectable failures.
    #[derive(Default)]
    struct FlakyWorker {
        status_fails: bool,
        force_fails: bool,
        cost_on_exit: f64,
        stopped: Mutex<bool>,
        calls: Mutex<Vec<String>>,
    }

    impl FlakyWorker {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerBackend for FlakyWorker {
        async fn invoke(&self, _invocation: WorkerInvocation) -> EngineResult<String> {
            self.calls.lock().unwrap().push("invoke".to_string());
            Ok("run-flaky".to_string())
        }

        async fn status(&self, _run_id: &str) -> EngineResult<WorkerStatus> {
            if self.status_fails {
                return Err(EngineError::worker("tmux hiccup"));
            }
            let stopped = *self.stopped.lock().unwrap();
            Ok(WorkerStatus {
                state: if stopped { WorkerState::Exited } else { WorkerState::Running },
                turns_used: if stopped { 7 } else { 0 },
                cost: if stopped { self.cost_on_exit } else { 0.0 },
                last_activity_ts: None,
            })
        }

        async fn terminate(&self, _run_id: &str, force: bool) -> EngineResult<()> {
            self.calls.lock().unwrap().push(format!("terminate force={}", force));
            if force && self.force_fails {
                return Err(EngineError::worker("kill-session failed"));
            }
            *self.stopped.lock().unwrap() = true;
            Ok(())
        }

        async fn release(&self, _run_id: &str) -> EngineResult<()> {
            self.calls.lock().unwrap().push("release".to_string());
            Ok(())
        }
    }

    async fn flaky_run(
        worker: Arc<FlakyWorker>,
    ) -> (SessionSupervisor, SessionHandle, WorkflowRun) {
        let registry = Arc::new(StageRegistry::default());
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .insert_epic(&crate::devops::store::tests::sample_epic("epic-1"))
            .unwrap();
        let mut sup = SessionSupervisor::new(worker, registry, store);
        let handle = sup.spawn(request("BUILD", "epic-1_BUILD", false)).unwrap();
        let run = sup
            .start_run(&handle, "card-1", Path::new("/ws/c.md"), "x")
            .await
            .unwrap();
        (sup, handle, run)
    }

    fn supervisor(script: &str) -> (SessionSupervisor, SimulatedWorld, Arc<Store>) {
        let world = SimulatedWorld::new();
        let registry = Arc::new(StageRegistry::default());
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .insert_epic(&crate::devops::store::tests::sample_epic("epic-1"))
            .unwrap();
        let worker = SimulatedWorker::new(
            world.clone(),
            SimulationScript::parse(script).unwrap(),
            registry.clone(),
        );
        (
            SessionSupervisor::new(Arc::new(worker), registry, store.clone()),
            world,
            store,
        )
    }

    fn request<'a>(stage: &'a str, name: &'a str, resume: bool) -> SpawnRequest<'a> {
        SpawnRequest {
            stage_type: stage,
            epic_id: "epic-1",
            card_ref: "card-1",
            session_name: name,
            turn_budget: 10,
            resume,
            workspace: Path::new("/sim/ws"),
        }
    }

    #[test]
    fn test_session_name_validation() {
        assert!(validate_session_name("epic-1_BUILD").is_ok());
        assert!(validate_session_name("").is_err());
        assert!(validate_session_name("has space").is_err());
        assert!(validate_session_name("a.b").is_err());
        assert!(validate_session_name("a:b").is_err());
        assert!(validate_session_name("_leading").is_err());
        assert!(validate_session_name(&"x".repeat(65)).is_err());
        assert!(validate_session_name(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn test_spawn_rejects_without_side_effects() {
        let (mut sup, _, _) = supervisor("");
        let err = sup.spawn(request("DEPLOY", "epic-1_DEPLOY", false)).unwrap_err();
        assert!(matches!(err, EngineError::SpawnRejected(_)));
        let err = sup.spawn(request("BUILD", "bad name", false)).unwrap_err();
        assert!(matches!(err, EngineError::SpawnRejected(_)));

        let handle = sup.spawn(request("BUILD", "epic-1_BUILD", false)).unwrap();
        assert_eq!(handle.iteration, 1);
    }

    #[test]
    fn test_resume_returns_identical_handle() {
        let (mut sup, _, _) = supervisor("");
        let first = sup.spawn(request("BUILD", "epic-1_BUILD", false)).unwrap();
        let resumed = sup.spawn(request("build", "epic-1_BUILD", true)).unwrap();
        assert_eq!(first, resumed);

        let fresh = sup.spawn(request("BUILD", "epic-1_BUILD", false)).unwrap();
        assert_eq!(fresh.iteration, 2);
        assert_eq!(fresh.session_id, "epic-1_BUILD_2");
    }

    #[test]
    fn test_seeded_iterations_survive_restart() {
        let (mut sup, _, _) = supervisor("");
        let stage = StageType::new("BUILD").unwrap();
        let run = WorkflowRun::pending("epic-1", &stage, "epic-1_BUILD_3", 3, "c");
        sup.seed_from_runs(&[run]);

        let next = sup.spawn(request("BUILD", "epic-1_BUILD", false)).unwrap();
        assert_eq!(next.session_id, "epic-1_BUILD_4");
    }

    #[test]
    fn test_prompt_lists_stage_and_safety_signals() {
        let registry = StageRegistry::default();
        let build = registry.lookup("BUILD").unwrap();
        let prompt = build_stage_prompt(build, "add login", Path::new("/ws/.handy/cards/c.md"));
        assert!(prompt.contains("Objective: add login"));
        assert!(prompt.contains("/ws/.handy/cards/c.md"));
        assert!(prompt.contains("TESTS_FAILED"));
        assert!(prompt.contains("BREAKING_CHANGE"));
    }

    #[tokio::test]
    async fn test_single_running_run_per_epic() {
        let (mut sup, _, store) = supervisor("");
        let build = sup.spawn(request("BUILD", "epic-1_BUILD", false)).unwrap();
        let run = sup
            .start_run(&build, "card-1", Path::new("/sim/ws/c.md"), "x")
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(store.running_run("epic-1").unwrap().unwrap().run_id, run.run_id);

        let validate = sup.spawn(request("VALIDATE", "epic-1_VALIDATE", false)).unwrap();
        let err = sup
            .start_run(&validate, "card-2", Path::new("/sim/ws/d.md"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SpawnRejected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_forces_stalled_worker() {
        let (mut sup, world, _) = supervisor("BUILD=STALL");
        let handle = sup.spawn(request("BUILD", "epic-1_BUILD", false)).unwrap();
        let mut run = sup
            .start_run(&handle, "card-1", Path::new("/sim/ws/c.md"), "x")
            .await
            .unwrap();
        assert_eq!(sup.lease_holder("epic-1"), Some("epic-1_BUILD_1"));

        sup.teardown(&handle, &mut run, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(
            world.terminations(),
            vec![(run.run_id.clone(), false), (run.run_id.clone(), true)]
        );
        assert!(world.unreleased_runs().is_empty());
        assert_eq!(sup.lease_holder("epic-1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_folds_usage_reported_on_exit() {
        let worker = Arc::new(FlakyWorker {
            cost_on_exit: 500.0,
            ..FlakyWorker::default()
        });
        let (mut sup, handle, mut run) = flaky_run(worker.clone()).await;
        assert_eq!(run.cost, 0.0);

        sup.teardown(&handle, &mut run, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(run.cost, 500.0);
        assert_eq!(run.turns_used, 7);
        assert_eq!(worker.calls(), vec!["invoke", "terminate force=false", "release"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_forces_and_releases_when_status_fails() {
        let worker = Arc::new(FlakyWorker {
            status_fails: true,
            ..FlakyWorker::default()
        });
        let (mut sup, handle, mut run) = flaky_run(worker.clone()).await;

        sup.teardown(&handle, &mut run, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(
            worker.calls(),
            vec!["invoke", "terminate force=false", "terminate force=true", "release"]
        );
        assert_eq!(sup.lease_holder("epic-1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_releases_even_when_force_fails() {
        let worker = Arc::new(FlakyWorker {
            status_fails: true,
            force_fails: true,
            ..FlakyWorker::default()
        });
        let (mut sup, handle, mut run) = flaky_run(worker.clone()).await;

        let err = sup
            .teardown(&handle, &mut run, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Worker(_)));
        assert_eq!(worker.calls().last().map(String::as_str), Some("release"));
        assert_eq!(sup.lease_holder("epic-1"), None);
    }

    #[tokio::test]
    async fn test_reused_run_id_stops_the_new_worker() {
        let worker = Arc::new(FlakyWorker::default());
        let (mut sup, handle, mut run) = flaky_run(worker.clone()).await;
        run.finish(RunStatus::Completed, None);
        sup.store.update_run(&run).unwrap();
        sup.teardown(&handle, &mut run, Duration::ZERO).await.unwrap();

        let again = sup.spawn(request("BUILD", "epic-1_BUILD", false)).unwrap();
        let err = sup
            .start_run(&again, "card-2", Path::new("/ws/d.md"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Worker(_)));
        assert_eq!(worker.calls().last().map(String::as_str), Some("release"));
        assert_eq!(sup.lease_holder("epic-1"), None);
        assert_eq!(
            sup.store.load_run("run-flaky").unwrap().unwrap().status,
            RunStatus::Completed
        );
    }
}
