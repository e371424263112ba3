//! Adaptive monitor: polls a running stage until it reaches a terminal status.
//!
//! Progress is either signal moving: the worker's turns, cost or activity,
//! or the card's modification time and checked count. The poll interval
//! shrinks once most requirements are checked.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::devops::error::{EngineError, EngineResult, Rationale};
use crate::devops::operations::agent_lifecycle::SessionHandle;
use crate::devops::operations::task_card::{CardStatus, CardView, TaskCardStore};
use crate::devops::orchestrator::{WorkerBackend, WorkerStatus};
use crate::devops::pipeline::{RunStatus, WorkflowRun};
use crate::devops::store::Store;
use crate::settings::MonitorSettings;

/// Polling parameters
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub base_interval: Duration,
    pub max_wait: Duration,
    pub min_interval: Duration,
    pub shrink_threshold: f64,
    pub shrink_factor: u32,
    pub max_unreachable_polls: u32,
}

impl From<&MonitorSettings> for MonitorConfig {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            base_interval: settings.base_interval(),
            max_wait: settings.max_wait(),
            min_interval: Duration::from_secs(settings.min_interval_secs),
            shrink_threshold: settings.shrink_threshold,
            shrink_factor: settings.shrink_factor.max(1),
            max_unreachable_polls: settings.max_unreachable_polls.max(1),
        }
    }
}

impl MonitorConfig {
    /// Interval to use after observing `ratio` of requirements checked.
    pub fn interval_for(&self, ratio: f64) -> Duration {
        if ratio > self.shrink_threshold {
            let shrunk = self.base_interval / self.shrink_factor;
            shrunk.max(self.min_interval).min(self.base_interval)
        } else {
            self.base_interval
        }
    }
}

/// What the previous poll saw
#[derive(Debug, Default)]
struct Observed {
    turns: u64,
    cost: f64,
    activity: Option<i64>,
    card_modified: Option<u64>,
    checked: usize,
}

impl Observed {
    /// Update from a worker status. Returns whether anything moved.
    fn worker(&mut self, status: &WorkerStatus) -> bool {
        let moved = status.turns_used != self.turns
            || status.cost != self.cost
            || status.last_activity_ts != self.activity;
        self.turns = status.turns_used;
        self.cost = status.cost;
        self.activity = status.last_activity_ts;
        moved
    }

    /// Update from a card view. Returns whether anything moved.
    fn card(&mut self, view: &CardView) -> bool {
        let moved = view.modified != self.card_modified || view.checked != self.checked;
        self.card_modified = view.modified;
        self.checked = view.checked;
        moved
    }
}

pub struct AdaptiveMonitor {
    backend: Arc<dyn WorkerBackend>,
    store: Arc<Store>,
    config: MonitorConfig,
}

impl AdaptiveMonitor {
    pub fn new(backend: Arc<dyn WorkerBackend>, store: Arc<Store>, config: MonitorConfig) -> Self {
        Self {
            backend,
            store,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn finish(
        &self,
        mut run: WorkflowRun,
        status: RunStatus,
        reason: Option<Rationale>,
    ) -> EngineResult<WorkflowRun> {
        run.finish(status, reason);
        self.store.update_run(&run)?;
        log::info!(
            "Run {} ({}) finished {}{}",
            run.run_id,
            run.stage_type,
            run.status,
            reason.map(|r| format!(" ({})", r)).unwrap_or_default()
        );
        Ok(run)
    }

    /// Watch a RUNNING run until it is COMPLETED, FAILED, NEEDS_HUMAN or STUCK.
    ///
    /// Cancellation is honoured at each wait boundary and yields FAILED with
    /// `Aborted`; tearing the session down is left to the caller.
    pub async fn watch(
        &self,
        handle: &SessionHandle,
        mut run: WorkflowRun,
        cards: &mut TaskCardStore,
        cancel: &CancellationToken,
    ) -> EngineResult<WorkflowRun> {
        let mut observed = Observed {
            turns: run.turns_used,
            cost: run.cost,
            ..Observed::default()
        };
        let mut last_progress = Instant::now();
        let mut interval = self.config.base_interval;
        let mut unreachable = 0u32;

        log::debug!(
            "Watching run {} in session {} every {:?}",
            run.run_id,
            handle.session_id,
            interval
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::warn!("Run {} aborted", run.run_id);
                    return self.finish(run, RunStatus::Failed, Some(Rationale::Aborted));
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let status = match self.backend.status(&run.run_id).await {
                Ok(status) => status,
                Err(e) => {
                    log::warn!("Status query for run {} failed: {}", run.run_id, e);
                    return self.finish(run, RunStatus::Failed, Some(Rationale::WorkerFailed));
                }
            };
            let mut progressed = observed.worker(&status);
            let mut changed = run.record_usage(status.turns_used, status.cost);

            match cards.pull_and_read(&run.card_id).await {
                Ok(view) => {
                    unreachable = 0;
                    progressed |= observed.card(&view);
                    let summary = view.summary();
                    if run.last_card_status.as_deref() != Some(summary.as_str()) {
                        run.last_card_status = Some(summary);
                        changed = true;
                    }

                    match view.status {
                        CardStatus::Complete => {
                            run.record_signals(&view.card.signals);
                            return self.finish(run, RunStatus::Completed, None);
                        }
                        CardStatus::Ambiguous if view.card.completed.is_some() => {
                            // No requirements to judge completion by
                            run.record_signals(&view.card.signals);
                            return self.finish(
                                run,
                                RunStatus::NeedsHuman,
                                Some(Rationale::SignalMissing),
                            );
                        }
                        _ => {}
                    }
                    interval = self.config.interval_for(view.progress_ratio());
                }
                Err(EngineError::CardUnreachable(reason)) => {
                    unreachable += 1;
                    log::warn!(
                        "Card {} unreachable ({}/{}): {}",
                        run.card_id,
                        unreachable,
                        self.config.max_unreachable_polls,
                        reason
                    );
                    if unreachable >= self.config.max_unreachable_polls {
                        return self.finish(
                            run,
                            RunStatus::NeedsHuman,
                            Some(Rationale::CardUnreachable),
                        );
                    }
                }
                Err(EngineError::CardCorruption(reason)) => {
                    log::warn!("Card {} corrupted: {}", run.card_id, reason);
                    return self.finish(run, RunStatus::NeedsHuman, Some(Rationale::CardCorruption));
                }
                Err(e) => return Err(e),
            }

            if !status.is_alive() {
                log::warn!(
                    "Worker for run {} is {:?} with card {}",
                    run.run_id,
                    status.state,
                    run.last_card_status.as_deref().unwrap_or("UNKNOWN")
                );
                return self.finish(run, RunStatus::Failed, Some(Rationale::WorkerFailed));
            }

            if progressed {
                last_progress = Instant::now();
            } else if last_progress.elapsed() >= self.config.max_wait {
                log::warn!(
                    "Run {} made no progress for {:?}",
                    run.run_id,
                    last_progress.elapsed()
                );
                return self.finish(run, RunStatus::Stuck, Some(Rationale::Stuck));
            }

            if changed {
                self.store.update_run(&run)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devops::operations::agent_lifecycle::{SessionSupervisor, SpawnRequest};
    use crate::devops::operations::task_card::{CardLocation, CardMailbox, PulledCard};
    use crate::devops::pipeline::OutcomeSignal;
    use crate::devops::sim::{SimulatedMailbox, SimulatedWorker, SimulatedWorld, SimulationScript};
    use crate::devops::stages::{StageRegistry, StageType};
    use async_trait::async_trait;
    use std::ops::Range;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the pulls whose call index falls in `failing`
    struct DroppingMailbox {
        inner: SimulatedMailbox,
        failing: Range<usize>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CardMailbox for DroppingMailbox {
        async fn deliver(&self, location: &CardLocation, content: &str) -> EngineResult<()> {
            self.inner.deliver(location, content).await
        }

        async fn pull(
            &self,
            location: &CardLocation,
            inbox_path: &Path,
        ) -> EngineResult<PulledCard> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&call) {
                return Err(EngineError::CardUnreachable(format!("pull {} dropped", call)));
            }
            self.inner.pull(location, inbox_path).await
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            base_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(60),
            min_interval: Duration::from_secs(2),
            shrink_threshold: 0.8,
            shrink_factor: 4,
            max_unreachable_polls: 3,
        }
    }

    struct Rig {
        monitor: AdaptiveMonitor,
        supervisor: SessionSupervisor,
        cards: TaskCardStore,
        store: Arc<Store>,
        _inbox: tempfile::TempDir,
    }

    fn rig(script: &str) -> Rig {
        rig_with(script, |mailbox| -> Arc<dyn CardMailbox> { Arc::new(mailbox) })
    }

    fn rig_with(script: &str, wrap: impl FnOnce(SimulatedMailbox) -> Arc<dyn CardMailbox>) -> Rig {
        let world = SimulatedWorld::new();
        let registry = Arc::new(StageRegistry::default());
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .insert_epic(&crate::devops::store::tests::sample_epic("epic-1"))
            .unwrap();
        let backend: Arc<dyn WorkerBackend> = Arc::new(SimulatedWorker::new(
            world.clone(),
            SimulationScript::parse(script).unwrap(),
            registry.clone(),
        ));
        let inbox = tempfile::tempdir().unwrap();
        let cards = TaskCardStore::new(
            wrap(SimulatedMailbox::new(world)),
            inbox.path().to_path_buf(),
            1,
            Duration::from_millis(100),
        );
        Rig {
            monitor: AdaptiveMonitor::new(backend.clone(), store.clone(), config()),
            supervisor: SessionSupervisor::new(backend, registry, store.clone()),
            cards,
            store,
            _inbox: inbox,
        }
    }

    async fn start(
        rig: &mut Rig,
        stage: &str,
        requirements: &[&str],
    ) -> (SessionHandle, WorkflowRun) {
        let stage_type = StageType::new(stage).unwrap();
        let reqs: Vec<String> = requirements.iter().map(|r| r.to_string()).collect();
        let card_id = rig.cards.create_card("epic-1", &stage_type, "obj", &reqs, "");
        let workspace = Path::new("/sim/epic-1");
        let name = format!("epic-1_{}", stage);
        let handle = rig
            .supervisor
            .spawn(SpawnRequest {
                stage_type: stage,
                epic_id: "epic-1",
                card_ref: &card_id,
                session_name: &name,
                turn_budget: 10,
                resume: false,
                workspace,
            })
            .unwrap();
        let card_path = rig
            .cards
            .publish(&card_id, CardLocation::in_workspace(workspace, &card_id))
            .await
            .unwrap();
        let run = rig
            .supervisor
            .start_run(&handle, &card_id, &card_path, "obj")
            .await
            .unwrap();
        (handle, run)
    }

    #[test]
    fn test_interval_shrinks_with_floor() {
        let cfg = config();
        assert_eq!(cfg.interval_for(0.5), Duration::from_secs(10));
        assert_eq!(cfg.interval_for(0.8), Duration::from_secs(10));
        assert_eq!(cfg.interval_for(0.9), Duration::from_millis(2500));

        let tight = MonitorConfig {
            base_interval: Duration::from_secs(4),
            ..config()
        };
        assert_eq!(tight.interval_for(1.0), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_card_records_signals() {
        let mut rig = rig("BUILD=TESTS_FAILED");
        let (handle, run) = start(&mut rig, "BUILD", &["a", "b"]).await;
        let cancel = CancellationToken::new();

        let done = rig
            .monitor
            .watch(&handle, run, &mut rig.cards, &cancel)
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.outcome_signals, vec![OutcomeSignal::TestsFailed]);
        assert_eq!(done.turns_used, 4);
        assert_eq!(done.last_card_status.as_deref(), Some("COMPLETE 2/2"));
        assert_eq!(rig.store.load_run(&done.run_id).unwrap().unwrap().status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flat_run_becomes_stuck() {
        let mut rig = rig("BUILD=STALL");
        let (handle, run) = start(&mut rig, "BUILD", &["a"]).await;
        let began = Instant::now();

        let done = rig
            .monitor
            .watch(&handle, run, &mut rig.cards, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Stuck);
        assert_eq!(done.stop_reason, Some(Rationale::Stuck));
        assert!(began.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_card_progress_is_not_stuck() {
        // Card edits every 3 polls (30s) stay inside the 60s window
        let mut rig = rig("BUILD=SILENT:ALL_TESTS_PASS");
        let (handle, run) = start(&mut rig, "BUILD", &["a", "b", "c", "d", "e"]).await;

        let done = rig
            .monitor
            .watch(&handle, run, &mut rig.cards, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.turns_used, 0);
        assert_eq!(done.outcome_signals, vec![OutcomeSignal::AllTestsPass]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchecked_box_is_corruption() {
        let mut rig = rig("BUILD=REGRESS");
        let (handle, run) = start(&mut rig, "BUILD", &["a", "b"]).await;

        let done = rig
            .monitor
            .watch(&handle, run, &mut rig.cards, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::NeedsHuman);
        assert_eq!(done.stop_reason, Some(Rationale::CardCorruption));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_card_escalates_after_limit() {
        let mut rig = rig("BUILD=VANISH");
        let (handle, run) = start(&mut rig, "BUILD", &["a"]).await;

        let done = rig
            .monitor
            .watch(&handle, run, &mut rig.cards, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::NeedsHuman);
        assert_eq!(done.stop_reason, Some(Rationale::CardUnreachable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_worker_fails_run() {
        let mut rig = rig("BUILD=CRASH");
        let (handle, run) = start(&mut rig, "BUILD", &["a"]).await;

        let done = rig
            .monitor
            .watch(&handle, run, &mut rig.cards, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.stop_reason, Some(Rationale::WorkerFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_at_wait_boundary() {
        let mut rig = rig("BUILD=STALL");
        let (handle, run) = start(&mut rig, "BUILD", &["a"]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let done = rig
            .monitor
            .watch(&handle, run, &mut rig.cards, &cancel)
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.stop_reason, Some(Rationale::Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_brief_card_outage_does_not_escalate() {
        // One read attempt plus one retry per poll: polls 2 and 3 fail, poll 4 recovers
        let mut rig = rig_with("BUILD=ALL_TESTS_PASS", |mailbox| -> Arc<dyn CardMailbox> {
            Arc::new(DroppingMailbox {
                inner: mailbox,
                failing: 1..5,
                calls: AtomicUsize::new(0),
            })
        });
        let (handle, run) = start(&mut rig, "BUILD", &["a", "b", "c", "d", "e"]).await;

        let done = rig
            .monitor
            .watch(&handle, run, &mut rig.cards, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.stop_reason, None);
        assert_eq!(done.outcome_signals, vec![OutcomeSignal::AllTestsPass]);
        assert_eq!(done.last_card_status.as_deref(), Some("COMPLETE 5/5"));
    }
}
