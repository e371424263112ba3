//! Scripted in-process worker for dry runs and tests.
//!
//! A [`SimulatedWorld`] holds an in-memory file system shared by
//! [`SimulatedWorker`] and [`SimulatedMailbox`]. Each status query advances
//! the run by one step of its script, editing the task card the way a real
//! agent would.
//!
//! Scripts map stages to behaviours, e.g.
//! `BUILD=TESTS_FAILED|ALL_TESTS_PASS,VALIDATE=ALL_TESTS_PASS`: successive
//! BUILD runs use successive entries (the last one repeats). An entry is a
//! `+`-joined signal list or one of `STALL`, `SILENT:<signals>`,
//! `LINGER:<signals>`, `CRASH`, `REGRESS`, `VANISH`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::{EngineError, EngineResult};
use super::operations::task_card::{CardLocation, CardMailbox, PulledCard, TaskCard};
use super::orchestrator::{WorkerBackend, WorkerInvocation, WorkerState, WorkerStatus};
use super::pipeline::OutcomeSignal;
use super::stages::{StageRegistry, StageType};

/// Cost charged per simulated turn (USD)
pub const COST_PER_TURN: f64 = 0.05;

/// Polls between card edits for `SILENT` entries
const SILENT_EVERY: u32 = 3;

/// Behaviour of one simulated run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Work through every requirement, then declare the signals and exit
    Complete { signals: Vec<OutcomeSignal> },
    /// Mark the card started, then do nothing; ignores graceful termination
    Stall,
    /// Like `Complete`, but without turn or activity reports, editing the
    /// card only every few polls
    Silent { signals: Vec<OutcomeSignal>, every: u32 },
    /// Exit after starting, leaving the card incomplete
    Crash,
    /// Like `Complete`, but stays alive afterwards and reports its usage
    /// only once stopped
    Linger { signals: Vec<OutcomeSignal> },
    /// Check a box, then uncheck it
    Regress,
    /// Delete the card and keep running
    Vanish,
}

impl ScriptStep {
    fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let upper = raw.to_ascii_uppercase();
        match upper.as_str() {
            "STALL" => return Ok(Self::Stall),
            "CRASH" => return Ok(Self::Crash),
            "REGRESS" => return Ok(Self::Regress),
            "VANISH" => return Ok(Self::Vanish),
            _ => {}
        }
        if let Some(rest) = upper.strip_prefix("LINGER:") {
            return Ok(Self::Linger {
                signals: parse_signals(rest)?,
            });
        }
        if let Some(rest) = upper.strip_prefix("SILENT:") {
            return Ok(Self::Silent {
                signals: parse_signals(rest)?,
                every: SILENT_EVERY,
            });
        }
        Ok(Self::Complete {
            signals: parse_signals(raw)?,
        })
    }
}

fn parse_signals(raw: &str) -> Result<Vec<OutcomeSignal>, String> {
    raw.split('+')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<OutcomeSignal>())
        .collect()
}

/// Per-stage behaviour sequences
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationScript {
    stages: HashMap<StageType, Vec<ScriptStep>>,
}

impl SimulationScript {
    /// Parse `STAGE=entry|entry,STAGE=entry`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut stages = HashMap::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (stage, entries) = part
                .split_once('=')
                .ok_or_else(|| format!("Script entry '{}' is not STAGE=BEHAVIOUR", part))?;
            let stage = StageType::new(stage.trim())?;
            let steps = entries
                .split('|')
                .map(ScriptStep::parse)
                .collect::<Result<Vec<_>, _>>()?;
            stages.insert(stage, steps);
        }
        Ok(Self { stages })
    }

    /// Step for the `attempt`-th run (0-based) of `stage`.
    fn step_for(&self, stage: &StageType, attempt: usize, registry: &StageRegistry) -> ScriptStep {
        if let Some(steps) = self.stages.get(stage) {
            if let Some(step) = steps.get(attempt).or_else(|| steps.last()) {
                return step.clone();
            }
        }
        // Default: the stage's first declared route signal
        let signals = registry
            .get(stage)
            .and_then(|d| d.routes.first())
            .map(|rule| vec![rule.signal.clone()])
            .unwrap_or_default();
        ScriptStep::Complete { signals }
    }
}

#[derive(Debug, Clone)]
struct SimFile {
    content: String,
    modified: u64,
}

#[derive(Debug)]
struct SimRun {
    step: ScriptStep,
    card_path: PathBuf,
    polls: u32,
    state: WorkerState,
    turns: u64,
    cost: f64,
    activity: Option<i64>,
    released: bool,
}

#[derive(Debug, Default)]
struct WorldState {
    files: HashMap<PathBuf, SimFile>,
    clock: u64,
    runs: HashMap<String, SimRun>,
    attempts: HashMap<StageType, usize>,
    invocations: Vec<WorkerInvocation>,
    terminations: Vec<(String, bool)>,
    next_run: u32,
}

impl WorldState {
    fn write(&mut self, path: &Path, content: String) {
        self.clock += 1;
        self.files.insert(
            path.to_path_buf(),
            SimFile {
                content,
                modified: self.clock,
            },
        );
    }

    /// Apply `f` to the parsed card at `path`. Returns false when nothing changed.
    fn edit_card(&mut self, path: &Path, f: impl FnOnce(&mut TaskCard) -> bool) -> bool {
        let mut card = match self
            .files
            .get(path)
            .and_then(|file| TaskCard::parse(&file.content).ok())
        {
            Some(card) => card,
            None => return false,
        };
        if !f(&mut card) {
            return false;
        }
        self.write(path, card.render());
        true
    }
}

/// Shared in-memory world
#[derive(Debug, Clone, Default)]
pub struct SimulatedWorld {
    inner: Arc<Mutex<WorldState>>,
}

impl SimulatedWorld {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, WorldState>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::worker("simulated world poisoned"))
    }

    /// Current content of a simulated file.
    pub fn file(&self, path: &Path) -> Option<String> {
        self.lock()
            .ok()
            .and_then(|state| state.files.get(path).map(|f| f.content.clone()))
    }

    /// Every invocation received, in order.
    pub fn invocations(&self) -> Vec<WorkerInvocation> {
        self.lock()
            .map(|state| state.invocations.clone())
            .unwrap_or_default()
    }

    /// `(run_id, forced)` for every terminate call.
    pub fn terminations(&self) -> Vec<(String, bool)> {
        self.lock()
            .map(|state| state.terminations.clone())
            .unwrap_or_default()
    }

    /// Runs whose resources were not released.
    pub fn unreleased_runs(&self) -> Vec<String> {
        self.lock()
            .map(|state| {
                let mut ids: Vec<String> = state
                    .runs
                    .iter()
                    .filter(|(_, run)| !run.released)
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }
}

fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Start, check the next box, then complete with signals. Returns false once done.
fn advance_card(card: &mut TaskCard, signals: &[OutcomeSignal]) -> bool {
    if card.started.is_none() {
        card.started = Some(now_ts());
        return true;
    }
    if let Some(req) = card.requirements.iter_mut().find(|r| !r.done) {
        req.done = true;
        return true;
    }
    if card.completed.is_none() {
        card.completed = Some(now_ts());
        for signal in signals {
            if !card.signals.contains(signal) {
                card.signals.push(signal.clone());
            }
        }
        return true;
    }
    false
}

fn tick(state: &mut WorldState, run_id: &str) -> Option<WorkerStatus> {
    let clock = state.clock as i64;
    let (step, path, polls, alive) = {
        let run = state.runs.get_mut(run_id)?;
        if run.state == WorkerState::Running {
            run.polls += 1;
        }
        (run.step.clone(), run.card_path.clone(), run.polls, run.state == WorkerState::Running)
    };

    if alive {
        let (worked, exited) = match &step {
            ScriptStep::Complete { signals } => {
                let changed = state.edit_card(&path, |card| advance_card(card, signals));
                (changed, !changed)
            }
            ScriptStep::Silent { signals, every } => {
                if polls % every.max(&1) == 0 {
                    let changed = state.edit_card(&path, |card| advance_card(card, signals));
                    (false, !changed)
                } else {
                    (false, false)
                }
            }
            ScriptStep::Linger { signals } => {
                (state.edit_card(&path, |card| advance_card(card, signals)), false)
            }
            ScriptStep::Stall => {
                if polls == 1 {
                    state.edit_card(&path, |card| advance_card(card, &[]));
                }
                (false, false)
            }
            ScriptStep::Crash => {
                if polls == 1 {
                    (state.edit_card(&path, |card| advance_card(card, &[])), false)
                } else {
                    (false, true)
                }
            }
            ScriptStep::Regress => {
                let changed = match polls {
                    1 => state.edit_card(&path, |card| advance_card(card, &[])),
                    2 => state.edit_card(&path, |card| {
                        card.requirements.first_mut().map(|r| r.done = true).is_some()
                    }),
                    3 => state.edit_card(&path, |card| {
                        card.requirements.first_mut().map(|r| r.done = false).is_some()
                    }),
                    _ => false,
                };
                (changed, false)
            }
            ScriptStep::Vanish => {
                if polls == 1 {
                    state.edit_card(&path, |card| advance_card(card, &[]));
                } else if polls == 2 {
                    state.files.remove(&path);
                }
                (true, false)
            }
        };

        let run = state.runs.get_mut(run_id)?;
        if worked {
            run.turns += 1;
            run.cost += COST_PER_TURN;
            run.activity = Some(clock + 1);
        }
        if exited {
            run.state = match step {
                ScriptStep::Crash => WorkerState::Missing,
                _ => WorkerState::Exited,
            };
        }
    }

    let run = state.runs.get(run_id)?;
    let withheld =
        matches!(run.step, ScriptStep::Linger { .. }) && run.state == WorkerState::Running;
    Some(WorkerStatus {
        state: run.state,
        turns_used: if withheld { 0 } else { run.turns },
        cost: if withheld { 0.0 } else { run.cost },
        last_activity_ts: run.activity,
    })
}

/// Scripted worker backend
pub struct SimulatedWorker {
    world: SimulatedWorld,
    script: SimulationScript,
    registry: Arc<StageRegistry>,
}

impl SimulatedWorker {
    pub fn new(
        world: SimulatedWorld,
        script: SimulationScript,
        registry: Arc<StageRegistry>,
    ) -> Self {
        Self {
            world,
            script,
            registry,
        }
    }
}

#[async_trait]
impl WorkerBackend for SimulatedWorker {
    async fn invoke(&self, invocation: WorkerInvocation) -> EngineResult<String> {
        let mut state = self.world.lock()?;
        let attempt = {
            let counter = state.attempts.entry(invocation.stage_type.clone()).or_insert(0);
            let attempt = *counter;
            *counter += 1;
            attempt
        };
        let step = self
            .script
            .step_for(&invocation.stage_type, attempt, &self.registry);

        state.next_run += 1;
        let run_id = format!("sim-run-{}", state.next_run);
        log::debug!(
            "Simulated {} run {} for {}: {:?}",
            invocation.stage_type,
            run_id,
            invocation.session_name,
            step
        );
        state.runs.insert(
            run_id.clone(),
            SimRun {
                step,
                card_path: invocation.card_path.clone(),
                polls: 0,
                state: WorkerState::Running,
                turns: 0,
                cost: 0.0,
                activity: None,
                released: false,
            },
        );
        state.invocations.push(invocation);
        Ok(run_id)
    }

    async fn status(&self, run_id: &str) -> EngineResult<WorkerStatus> {
        let mut state = self.world.lock()?;
        Ok(tick(&mut state, run_id).unwrap_or_else(WorkerStatus::missing))
    }

    async fn terminate(&self, run_id: &str, force: bool) -> EngineResult<()> {
        let mut state = self.world.lock()?;
        state.terminations.push((run_id.to_string(), force));
        if let Some(run) = state.runs.get_mut(run_id) {
            if run.state == WorkerState::Running && (force || run.step != ScriptStep::Stall) {
                run.state = WorkerState::Exited;
            }
        }
        Ok(())
    }

    async fn release(&self, run_id: &str) -> EngineResult<()> {
        let mut state = self.world.lock()?;
        if let Some(run) = state.runs.get_mut(run_id) {
            run.state = WorkerState::Missing;
            run.released = true;
        }
        Ok(())
    }
}

/// Mailbox over the simulated file system; pulls land in the real inbox.
pub struct SimulatedMailbox {
    world: SimulatedWorld,
}

impl SimulatedMailbox {
    pub fn new(world: SimulatedWorld) -> Self {
        Self { world }
    }
}

#[async_trait]
impl CardMailbox for SimulatedMailbox {
    async fn deliver(&self, location: &CardLocation, content: &str) -> EngineResult<()> {
        self.world
            .lock()?
            .write(&location.host_path(), content.to_string());
        Ok(())
    }

    async fn pull(&self, location: &CardLocation, inbox_path: &Path) -> EngineResult<PulledCard> {
        let file = self
            .world
            .lock()?
            .files
            .get(&location.host_path())
            .cloned()
            .ok_or_else(|| {
                EngineError::CardUnreachable(format!(
                    "{} not in simulated workspace",
                    location.host_path().display()
                ))
            })?;
        if let Some(parent) = inbox_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(inbox_path, &file.content).await?;
        Ok(PulledCard {
            local_path: inbox_path.to_path_buf(),
            modified: Some(file.modified),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_parse() {
        let script = SimulationScript::parse(
            "build=TESTS_FAILED|ALL_TESTS_PASS+BREAKING_CHANGE, VALIDATE=STALL",
        )
        .unwrap();
        let registry = StageRegistry::default();
        let build = StageType::new("BUILD").unwrap();
        assert_eq!(
            script.step_for(&build, 0, &registry),
            ScriptStep::Complete {
                signals: vec![OutcomeSignal::TestsFailed]
            }
        );
        let later = ScriptStep::Complete {
            signals: vec![OutcomeSignal::AllTestsPass, OutcomeSignal::BreakingChange],
        };
        assert_eq!(script.step_for(&build, 1, &registry), later);
        assert_eq!(script.step_for(&build, 5, &registry), later);
        assert_eq!(
            script.step_for(&StageType::new("VALIDATE").unwrap(), 0, &registry),
            ScriptStep::Stall
        );
        assert_eq!(
            script.step_for(&StageType::new("DESIGN").unwrap(), 0, &registry),
            ScriptStep::Complete {
                signals: vec![OutcomeSignal::DesignComplete]
            }
        );
        let linger = SimulationScript::parse("DESIGN=linger:DESIGN_COMPLETE").unwrap();
        assert_eq!(
            linger.step_for(&StageType::new("DESIGN").unwrap(), 0, &registry),
            ScriptStep::Linger {
                signals: vec![OutcomeSignal::DesignComplete]
            }
        );
        assert!(SimulationScript::parse("BUILD").is_err());
        assert!(SimulationScript::parse("BUILD=not a signal").is_err());
    }

    #[tokio::test]
    async fn test_complete_run_edits_card_then_exits() {
        let world = SimulatedWorld::new();
        let registry = Arc::new(StageRegistry::default());
        let worker = SimulatedWorker::new(world.clone(), SimulationScript::default(), registry);
        let mailbox = SimulatedMailbox::new(world.clone());

        let stage = StageType::new("DESIGN").unwrap();
        let card = TaskCard {
            card_id: "card-1".to_string(),
            epic_id: "epic-1".to_string(),
            stage_type: stage.clone(),
            objective: "x".to_string(),
            requirements: vec![crate::devops::operations::task_card::Requirement {
                text: "one".to_string(),
                done: false,
            }],
            created: Some(now_ts()),
            started: None,
            completed: None,
            notes: String::new(),
            signals: Vec::new(),
        };
        let location = CardLocation::in_workspace(Path::new("/sim/ws"), "card-1");
        mailbox.deliver(&location, &card.render()).await.unwrap();

        let run_id = worker
            .invoke(WorkerInvocation {
                epic_id: "epic-1".to_string(),
                stage_type: stage,
                objective: "x".to_string(),
                session_name: "epic-1_DESIGN_1".to_string(),
                max_turns: 10,
                resume: false,
                workspace_override: Some(PathBuf::from("/sim/ws")),
                agent_type: "claude".to_string(),
                card_path: location.worker_path(),
                prompt: String::new(),
            })
            .await
            .unwrap();

        // started, checked, completed, exited
        for _ in 0..3 {
            assert!(worker.status(&run_id).await.unwrap().is_alive());
        }
        let status = worker.status(&run_id).await.unwrap();
        assert_eq!(status.state, WorkerState::Exited);
        assert_eq!(status.turns_used, 3);

        let done = TaskCard::parse(&world.file(&location.host_path()).unwrap()).unwrap();
        assert!(done.completed.is_some());
        assert_eq!(done.signals, vec![OutcomeSignal::DesignComplete]);
    }
}
