//! Outcome routing: map a finished run to the next stage or to a human.
//!
//! Order of evaluation:
//! 1. Runs that did not complete go to HUMAN with their stop reason.
//! 2. Safety-critical signals go to HUMAN, regardless of the stage table.
//! 3. The stage's route rules, in declaration order.
//! 4. Nothing matched: HUMAN with `SignalMissing`.
//!
//! Budget ceilings are enforced by the epic manager on top of this.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::devops::error::Rationale;
use crate::devops::pipeline::{OutcomeSignal, RunStatus, WorkflowRun};
use crate::devops::stages::{RouteTarget, StageRegistry, StageType};

/// Urgency of a routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NORMAL" => Ok(Self::Normal),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("Unknown priority '{}'", other)),
        }
    }
}

/// Where an epic goes after a run, and why. Immutable once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Epic being routed
    pub epic_id: String,
    /// Run that produced the decision (None for operator and gate decisions)
    pub run_id: Option<String>,
    /// Stage the decision was made from
    pub source_stage: StageType,
    /// Next stage, HUMAN, COMPLETED or FAILED
    pub target: RouteTarget,
    /// Urgency for the escalation channel
    pub priority: Priority,
    /// Why the decision went where it did
    pub rationale: Rationale,
    /// Details an operator needs to unblock the epic
    pub blocking_issues: Vec<String>,
    /// ISO timestamp of the decision
    pub decided_at: String,
}

impl RoutingDecision {
    /// A HUMAN decision.
    pub fn human(
        epic_id: &str,
        run_id: Option<&str>,
        source_stage: &StageType,
        priority: Priority,
        rationale: Rationale,
        blocking_issues: Vec<String>,
    ) -> Self {
        Self {
            epic_id: epic_id.to_string(),
            run_id: run_id.map(str::to_string),
            source_stage: source_stage.clone(),
            target: RouteTarget::Human,
            priority,
            rationale,
            blocking_issues,
            decided_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Deterministic decision table over the registered stages.
pub struct OutcomeRouter {
    registry: Arc<StageRegistry>,
}

impl OutcomeRouter {
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self { registry }
    }

    /// Decide where the epic goes after `run`.
    pub fn decide(&self, epic_id: &str, run: &WorkflowRun) -> RoutingDecision {
        let run_id = Some(run.run_id.as_str());
        let stage = &run.stage_type;

        if run.status != RunStatus::Completed {
            let rationale = match run.status {
                RunStatus::Stuck => Rationale::Stuck,
                _ => run.stop_reason.unwrap_or(Rationale::WorkerFailed),
            };
            let mut issues = vec![format!(
                "{} run {} ended {}",
                stage, run.run_id, run.status
            )];
            if let Some(card) = &run.last_card_status {
                issues.push(format!("last card status: {}", card));
            }
            issues.push(format!(
                "turns used {}, cost ${:.2}",
                run.turns_used, run.cost
            ));
            return RoutingDecision::human(
                epic_id,
                run_id,
                stage,
                Priority::High,
                rationale,
                issues,
            );
        }

        for signal in OutcomeSignal::SAFETY_ORDER.iter() {
            if run.has_signal(signal) {
                let issues = run
                    .outcome_signals
                    .iter()
                    .filter(|s| s.is_safety_critical())
                    .map(|s| format!("{} declared {}", stage, s))
                    .collect();
                let rationale = signal.safety_rationale().unwrap_or(Rationale::BreakingChange);
                return RoutingDecision::human(
                    epic_id,
                    run_id,
                    stage,
                    Priority::Critical,
                    rationale,
                    issues,
                );
            }
        }

        let descriptor = match self.registry.get(stage) {
            Some(descriptor) => descriptor,
            None => {
                return RoutingDecision::human(
                    epic_id,
                    run_id,
                    stage,
                    Priority::High,
                    Rationale::InvalidTransition,
                    vec![format!("stage {} is no longer registered", stage)],
                );
            }
        };

        for rule in &descriptor.routes {
            if !run.has_signal(&rule.signal) {
                continue;
            }
            if !self.registry.accepts(&rule.target) {
                return RoutingDecision::human(
                    epic_id,
                    run_id,
                    stage,
                    Priority::High,
                    Rationale::InvalidTransition,
                    vec![format!(
                        "{} routes {} to unregistered stage {}",
                        stage, rule.signal, rule.target
                    )],
                );
            }
            return RoutingDecision {
                epic_id: epic_id.to_string(),
                run_id: run_id.map(str::to_string),
                source_stage: stage.clone(),
                target: rule.target.clone(),
                priority: Priority::Normal,
                rationale: Rationale::Routed,
                blocking_issues: Vec::new(),
                decided_at: chrono::Utc::now().to_rfc3339(),
            };
        }

        let emitted: Vec<String> = run.outcome_signals.iter().map(|s| s.to_string()).collect();
        let expected: Vec<String> =
            descriptor.routes.iter().map(|r| r.signal.to_string()).collect();
        RoutingDecision::human(
            epic_id,
            run_id,
            stage,
            Priority::High,
            Rationale::SignalMissing,
            vec![
                format!("emitted: [{}]", emitted.join(", ")),
                format!("{} routes on: [{}]", stage, expected.join(", ")),
            ],
        )
    }
}
