//! Orchestration CLI commands.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cli::{Command, PatternCommand};
use crate::devops::check_all_dependencies;
use crate::devops::operations::{
    resolve_escalation, CardMailbox, DockerMailbox, DriverDeps, Epic, EpicDriver, EpicManager,
    EpicStatus, EscalationRecord, MonitorConfig, PatternRecord, PatternStore, ResolutionOption,
    RoutingDecision, SqlitePatternStore, StoreEscalations, WorktreeMailbox,
};
use crate::devops::orchestrator::{TmuxWorker, WorkerBackend};
use crate::devops::pipeline::{OutcomeSignal, WorkflowRun};
use crate::devops::sim::{SimulatedMailbox, SimulatedWorker, SimulatedWorld, SimulationScript};
use crate::devops::store::Store;
use crate::settings::{self, CardTransport, EngineSettings, WorkerBackendKind};

/// Settings and output mode shared by every command
pub struct CommandContext {
    pub settings: EngineSettings,
    /// Where `config --write` saves
    pub config_path: PathBuf,
    pub json: bool,
}

impl CommandContext {
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }
}

pub async fn dispatch(ctx: &CommandContext, command: Command) -> Result<()> {
    match command {
        Command::CreateEpic { objective, run } => create_epic(ctx, &objective, run).await,
        Command::Run { epic_id } => run(ctx, epic_id).await,
        Command::OverrideStage { epic_id, stage } => override_stage(ctx, &epic_id, &stage),
        Command::DryRun { objective, script } => dry_run(ctx, &objective, &script).await,
        Command::Status { epic_id } => status(ctx, epic_id.as_deref()),
        Command::Escalations { all } => escalations(ctx, all),
        Command::Resolve { id, option } => resolve(ctx, id, &option),
        Command::Recover => recover(ctx).await,
        Command::Doctor => doctor(ctx).await,
        Command::Patterns { command } => patterns(ctx, command).await,
        Command::Config { write } => config(ctx, write),
    }
}

fn open_store(settings: &EngineSettings) -> Result<Arc<Store>> {
    let path = settings.database_path();
    let store = Store::open(&path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(store))
}

fn epic_manager(settings: &EngineSettings, store: Arc<Store>) -> Result<EpicManager> {
    let registry = Arc::new(settings.stage_registry()?);
    Ok(EpicManager::new(store, registry, settings)?)
}

/// Driver wired to the backend the settings select.
fn build_driver(settings: &EngineSettings, store: Arc<Store>) -> Result<EpicDriver> {
    let (backend, mailbox): (Arc<dyn WorkerBackend>, Arc<dyn CardMailbox>) = match settings.worker {
        WorkerBackendKind::Tmux => {
            let mailbox: Arc<dyn CardMailbox> = match settings.cards.transport {
                CardTransport::Worktree => Arc::new(WorktreeMailbox),
                CardTransport::Docker => Arc::new(DockerMailbox),
            };
            (Arc::new(TmuxWorker::new(settings)), mailbox)
        }
        WorkerBackendKind::Simulated => {
            let world = SimulatedWorld::new();
            let registry = Arc::new(settings.stage_registry()?);
            (
                Arc::new(SimulatedWorker::new(
                    world.clone(),
                    SimulationScript::default(),
                    registry,
                )),
                Arc::new(SimulatedMailbox::new(world)),
            )
        }
    };

    let deps = DriverDeps {
        store: store.clone(),
        backend,
        mailbox,
        escalations: Arc::new(StoreEscalations::new(store.clone())),
        patterns: Some(Arc::new(SqlitePatternStore::new(store, settings.pattern_limit))),
    };
    Ok(EpicDriver::new(settings, deps)?)
}

/// Token cancelled on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, aborting running stages");
            trigger.cancel();
        }
    });
    token
}

fn signal_list(signals: &[OutcomeSignal]) -> String {
    signals
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("+")
}

fn print_epic(epic: &Epic) {
    let reason = epic
        .blocked_reason
        .map(|r| format!(" ({})", r))
        .unwrap_or_default();
    println!(
        "{}  {}{}  stage {}  {}",
        epic.id, epic.status, reason, epic.current_stage, epic.objective
    );
}

async fn create_epic(ctx: &CommandContext, objective: &str, run: bool) -> Result<()> {
    let store = open_store(&ctx.settings)?;
    let manager = epic_manager(&ctx.settings, store.clone())?;
    let id = manager.create_epic(objective)?;
    let epic = manager.get(&id)?;
    ctx.emit(&epic, || print_epic(&epic))?;

    if run {
        let mut driver = build_driver(&ctx.settings, store)?;
        let epic = driver.run_epic(&id, &cancel_on_ctrl_c()).await?;
        ctx.emit(&epic, || print_epic(&epic))?;
    }
    Ok(())
}

async fn run(ctx: &CommandContext, epic_id: Option<String>) -> Result<()> {
    let ids = match epic_id {
        Some(id) => vec![id],
        None => open_store(&ctx.settings)?
            .list_epics(Some(EpicStatus::Active))?
            .into_iter()
            .map(|epic| epic.id)
            .collect(),
    };
    if ids.is_empty() {
        log::info!("No ACTIVE epics to run");
        return Ok(());
    }

    // One task per epic, each with its own connection and driver
    let cancel = cancel_on_ctrl_c();
    let mut tasks = JoinSet::new();
    for id in ids {
        let settings = ctx.settings.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let store = open_store(&settings)?;
            let mut driver = build_driver(&settings, store)?;
            let epic = driver.run_epic(&id, &cancel).await?;
            Ok::<Epic, anyhow::Error>(epic)
        });
    }

    let mut finished = Vec::new();
    let mut failures = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.context("Epic task panicked")? {
            Ok(epic) => finished.push(epic),
            Err(e) => {
                failures += 1;
                log::error!("Epic run failed: {:#}", e);
            }
        }
    }

    ctx.emit(&finished, || finished.iter().for_each(print_epic))?;
    if failures > 0 {
        anyhow::bail!("{} epic(s) failed", failures);
    }
    Ok(())
}

fn override_stage(ctx: &CommandContext, epic_id: &str, stage: &str) -> Result<()> {
    let manager = epic_manager(&ctx.settings, open_store(&ctx.settings)?)?;
    let epic = manager.override_stage(epic_id, stage)?;
    ctx.emit(&epic, || print_epic(&epic))
}

#[derive(Serialize)]
struct DryRunReport {
    epic: Epic,
    runs: Vec<WorkflowRun>,
    decisions: Vec<RoutingDecision>,
    escalations: Vec<EscalationRecord>,
}

async fn dry_run(ctx: &CommandContext, objective: &str, script: &str) -> Result<()> {
    let script = SimulationScript::parse(script).map_err(anyhow::Error::msg)?;

    let short = uuid::Uuid::new_v4().simple().to_string();
    let scratch = std::env::temp_dir().join(format!("handy-conductor-dry-run-{}", &short[..8]));
    let mut settings = ctx.settings.clone();
    settings.workspace_root = scratch.join("workspaces");
    settings.inbox_dir = scratch.join("inbox");
    settings.source_repo = None;
    settings.worker = WorkerBackendKind::Simulated;
    settings.cards.transport = CardTransport::Worktree;
    settings.cards.retry_backoff_ms = 10;

    let store = Arc::new(Store::open_in_memory()?);
    let world = SimulatedWorld::new();
    let registry = Arc::new(settings.stage_registry()?);
    let deps = DriverDeps {
        store: store.clone(),
        backend: Arc::new(SimulatedWorker::new(world.clone(), script, registry)),
        mailbox: Arc::new(SimulatedMailbox::new(world)),
        escalations: Arc::new(StoreEscalations::new(store.clone())),
        patterns: Some(Arc::new(SqlitePatternStore::new(store.clone(), settings.pattern_limit))),
    };

    let monitor = MonitorConfig {
        base_interval: Duration::from_millis(20),
        max_wait: Duration::from_secs(2),
        min_interval: Duration::from_millis(5),
        ..MonitorConfig::from(&settings.monitor)
    };
    let mut driver = EpicDriver::new(&settings, deps)?
        .with_monitor_config(monitor, Duration::from_millis(50));

    let id = driver.manager().create_epic(objective)?;
    let result = driver.run_epic(&id, &cancel_on_ctrl_c()).await;

    if let Err(e) = std::fs::remove_dir_all(&scratch) {
        log::debug!("Failed to remove {}: {}", scratch.display(), e);
    }
    let epic = result?;

    let report = DryRunReport {
        runs: store.runs_for_epic(&id)?,
        decisions: store.decisions_for_epic(&id)?,
        escalations: store.list_escalations(false)?,
        epic,
    };
    ctx.emit(&report, || {
        for run in &report.runs {
            println!(
                "{:<10} {:<11} {:<28} {:>3} turns  ${:.2}  card {}",
                run.stage_type.as_str(),
                run.status.as_str(),
                signal_list(&run.outcome_signals),
                run.turns_used,
                run.cost,
                run.last_card_status.as_deref().unwrap_or("-")
            );
        }
        for esc in &report.escalations {
            println!(
                "escalation #{}: {} at {}: {}",
                esc.id,
                esc.message.rationale,
                esc.message.stage,
                esc.message.blocking_issues.join("; ")
            );
        }
        print_epic(&report.epic);
    })
}

fn status(ctx: &CommandContext, epic_id: Option<&str>) -> Result<()> {
    let store = open_store(&ctx.settings)?;
    let manager = epic_manager(&ctx.settings, store.clone())?;

    match epic_id {
        None => {
            let epics = manager.list(None)?;
            ctx.emit(&epics, || {
                for epic in &epics {
                    let usage = manager.usage(&epic.id).unwrap_or_default();
                    println!(
                        "{:<14} {:<9} {:<10} {:>4} turns ${:>7.2}  {}",
                        epic.id,
                        epic.status.to_string(),
                        epic.current_stage.to_string(),
                        usage.turns,
                        usage.cost,
                        epic.objective
                    );
                }
            })
        }
        Some(id) => {
            let epic = manager.get(id)?;
            let runs = store.runs_for_epic(id)?;
            let decisions = store.decisions_for_epic(id)?;
            let usage = manager.usage(id)?;
            ctx.emit(
                &serde_json::json!({
                    "epic": &epic,
                    "usage": usage,
                    "runs": &runs,
                    "decisions": &decisions,
                }),
                || {
                    print_epic(&epic);
                    println!(
                        "  workspace {} ({})",
                        epic.workspace.path.display(),
                        epic.workspace.branch
                    );
                    println!("  {} runs, {} turns, ${:.2}", usage.runs, usage.turns, usage.cost);
                    for run in &runs {
                        println!(
                            "  run {} {} {} [{}]{}",
                            run.run_id,
                            run.stage_type,
                            run.status,
                            signal_list(&run.outcome_signals),
                            run.stop_reason.map(|r| format!(" {}", r)).unwrap_or_default()
                        );
                    }
                    for d in &decisions {
                        println!(
                            "  {} {} -> {} ({}, {})",
                            d.decided_at, d.source_stage, d.target, d.rationale, d.priority
                        );
                    }
                },
            )
        }
    }
}

fn escalations(ctx: &CommandContext, all: bool) -> Result<()> {
    let store = open_store(&ctx.settings)?;
    let records = store.list_escalations(!all)?;
    ctx.emit(&records, || {
        if records.is_empty() {
            println!("No open escalations");
        }
        for record in &records {
            let options: Vec<String> =
                record.message.options.iter().map(|o| o.to_string()).collect();
            println!(
                "#{} {} at {}: {}{}",
                record.id,
                record.message.epic_id,
                record.message.stage,
                record.message.rationale,
                record
                    .resolution
                    .as_ref()
                    .map(|r| format!(" [resolved: {}]", r))
                    .unwrap_or_default()
            );
            println!(
                "    ${:.2} / {} turns so far; options: {}",
                record.message.cost_so_far,
                record.message.turns_so_far,
                options.join(", ")
            );
            for issue in &record.message.blocking_issues {
                println!("    - {}", issue);
            }
        }
    })
}

fn resolve(ctx: &CommandContext, id: i64, option: &str) -> Result<()> {
    let option: ResolutionOption = option.parse().map_err(anyhow::Error::msg)?;
    let store = open_store(&ctx.settings)?;
    let manager = epic_manager(&ctx.settings, store.clone())?;
    let epic = resolve_escalation(&store, &manager, id, &option)?;
    ctx.emit(&epic, || print_epic(&epic))
}

async fn recover(ctx: &CommandContext) -> Result<()> {
    let mut driver = build_driver(&ctx.settings, open_store(&ctx.settings)?)?;
    let recovered = driver.recover_interrupted_runs().await?;
    ctx.emit(&recovered, || {
        if recovered.is_empty() {
            println!("No interrupted runs");
        }
        for run_id in &recovered {
            println!("Marked {} FAILED (Interrupted)", run_id);
        }
    })
}

async fn doctor(ctx: &CommandContext) -> Result<()> {
    let settings = ctx.settings.clone();
    let report = tokio::task::spawn_blocking(move || check_all_dependencies(&settings))
        .await
        .context("Failed to check dependencies")?;

    ctx.emit(&report, || {
        for tool in &report.tools {
            let state = match (tool.installed, tool.authenticated) {
                (false, _) => format!("missing ({})", tool.install_hint),
                (true, Some(false)) => "installed, not authenticated".to_string(),
                (true, _) => tool.version.clone().unwrap_or_else(|| "installed".to_string()),
            };
            println!(
                "{} {:<7} {}",
                if tool.is_blocking() { "x" } else if tool.required { "+" } else { " " },
                tool.name,
                state
            );
        }
        if let Some(daemon) = report.docker_daemon {
            println!("  docker daemon {}", if daemon { "running" } else { "not reachable" });
        }
    })?;

    if !report.all_satisfied {
        anyhow::bail!("Required dependencies are missing");
    }
    Ok(())
}

async fn patterns(ctx: &CommandContext, command: PatternCommand) -> Result<()> {
    let patterns = SqlitePatternStore::new(open_store(&ctx.settings)?, ctx.settings.pattern_limit);
    match command {
        PatternCommand::Search { query, scope } => {
            let found = patterns.search(&query, &scope).await?;
            ctx.emit(&found, || {
                for p in &found {
                    println!("{} [{}] ({:.2}): {}", p.name, p.scope, p.confidence, p.body);
                }
            })
        }
        PatternCommand::Add {
            name,
            body,
            scope,
            confidence,
        } => {
            let record = PatternRecord {
                name,
                body,
                scope,
                confidence,
            };
            let created = patterns.store(record.clone()).await?;
            ctx.emit(&record, || {
                println!(
                    "{} pattern {} in {}",
                    if created { "Added" } else { "Updated" },
                    record.name,
                    record.scope
                )
            })
        }
    }
}

fn config(ctx: &CommandContext, write: bool) -> Result<()> {
    if write {
        settings::save_settings(&ctx.config_path, &ctx.settings)?;
        log::info!("Wrote settings to {}", ctx.config_path.display());
    }
    println!("{}", serde_json::to_string_pretty(&ctx.settings)?);
    Ok(())
}
