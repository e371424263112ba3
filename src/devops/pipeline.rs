//! Run state tracking for epic stages.
//!
//! A `WorkflowRun` is one execution attempt of one stage. It is created by the
//! session supervisor, moved to a terminal status by the monitor and consumed
//! by the outcome router.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::Rationale;
use super::stages::StageType;

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Session handle allocated, worker not yet invoked
    Pending,
    /// Worker invoked and being monitored
    Running,
    /// Worker finished and the task card says COMPLETE
    Completed,
    /// Worker died, the backend failed, or the run was aborted
    Failed,
    /// Monitoring hit a condition that needs an operator
    NeedsHuman,
    /// No progress from status or card for longer than max_wait
    Stuck,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::NeedsHuman => "NEEDS_HUMAN",
            Self::Stuck => "STUCK",
        }
    }

    /// Whether the run can no longer change status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::NeedsHuman | Self::Stuck
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "NEEDS_HUMAN" => Ok(Self::NeedsHuman),
            "STUCK" => Ok(Self::Stuck),
            other => Err(format!("Unknown run status '{}'", other)),
        }
    }
}

/// Structured outcome code a stage emits on completion.
///
/// Workers declare these in the `signals` list of their task card. Unknown
/// codes are kept as `Custom` so a registered stage table can route on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutcomeSignal {
    BreakingChange,
    SecurityRisk,
    ScopeViolation,
    TestsFailed,
    AllTestsPass,
    DesignComplete,
    PolishComplete,
    Custom(String),
}

impl OutcomeSignal {
    pub fn as_str(&self) -> &str {
        match self {
            Self::BreakingChange => "BREAKING_CHANGE",
            Self::SecurityRisk => "SECURITY_RISK",
            Self::ScopeViolation => "SCOPE_VIOLATION",
            Self::TestsFailed => "TESTS_FAILED",
            Self::AllTestsPass => "ALL_TESTS_PASS",
            Self::DesignComplete => "DESIGN_COMPLETE",
            Self::PolishComplete => "POLISH_COMPLETE",
            Self::Custom(code) => code,
        }
    }

    /// Signals that always escalate, checked in this order before any table lookup.
    pub const SAFETY_ORDER: [OutcomeSignal; 3] = [
        OutcomeSignal::BreakingChange,
        OutcomeSignal::SecurityRisk,
        OutcomeSignal::ScopeViolation,
    ];

    pub fn is_safety_critical(&self) -> bool {
        matches!(
            self,
            Self::BreakingChange | Self::SecurityRisk | Self::ScopeViolation
        )
    }

    /// Escalation rationale for a safety-critical signal.
    pub fn safety_rationale(&self) -> Option<Rationale> {
        match self {
            Self::BreakingChange => Some(Rationale::BreakingChange),
            Self::SecurityRisk => Some(Rationale::SecurityRisk),
            Self::ScopeViolation => Some(Rationale::ScopeViolation),
            _ => None,
        }
    }
}

impl FromStr for OutcomeSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        if code.is_empty() {
            return Err("Outcome signal cannot be empty".to_string());
        }
        if !code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(format!("Invalid outcome signal '{}'", s));
        }

        Ok(match code.as_str() {
            "BREAKING_CHANGE" => Self::BreakingChange,
            "SECURITY_RISK" => Self::SecurityRisk,
            "SCOPE_VIOLATION" => Self::ScopeViolation,
            "TESTS_FAILED" => Self::TestsFailed,
            "ALL_TESTS_PASS" => Self::AllTestsPass,
            "DESIGN_COMPLETE" => Self::DesignComplete,
            "POLISH_COMPLETE" => Self::PolishComplete,
            _ => Self::Custom(code),
        })
    }
}

impl TryFrom<String> for OutcomeSignal {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OutcomeSignal> for String {
    fn from(signal: OutcomeSignal) -> Self {
        signal.as_str().to_string()
    }
}

impl fmt::Display for OutcomeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run identifier returned by the worker backend (empty until invoked)
    pub run_id: String,
    /// Epic this run belongs to
    pub epic_id: String,
    /// Stage being executed
    pub stage_type: StageType,
    /// Session key `{epic}_{stage}_{iteration}`
    pub session_id: String,
    /// Iteration number of the session key
    pub iteration: u32,
    /// Task card coordinating this run
    pub card_id: String,
    /// Current status
    pub status: RunStatus,
    /// Declared outcome signals, in first-seen order without duplicates
    pub outcome_signals: Vec<OutcomeSignal>,
    /// Turns consumed as reported by the worker
    pub turns_used: u64,
    /// Cost in USD as reported by the worker
    pub cost: f64,
    /// ISO timestamp when the worker was invoked
    pub started_at: Option<String>,
    /// ISO timestamp when the run reached a terminal status
    pub completed_at: Option<String>,
    /// Why the run ended in a non-COMPLETED terminal status
    pub stop_reason: Option<Rationale>,
    /// Last card state the monitor observed, kept for escalations
    pub last_card_status: Option<String>,
}

impl WorkflowRun {
    /// Create a pending run for a session.
    pub fn pending(
        epic_id: &str,
        stage_type: &StageType,
        session_id: &str,
        iteration: u32,
        card_id: &str,
    ) -> Self {
        Self {
            run_id: String::new(),
            epic_id: epic_id.to_string(),
            stage_type: stage_type.clone(),
            session_id: session_id.to_string(),
            iteration,
            card_id: card_id.to_string(),
            status: RunStatus::Pending,
            outcome_signals: Vec::new(),
            turns_used: 0,
            cost: 0.0,
            started_at: None,
            completed_at: None,
            stop_reason: None,
            last_card_status: None,
        }
    }

    /// Mark the run as started by the worker backend.
    pub fn start(&mut self, run_id: &str) {
        self.run_id = run_id.to_string();
        self.status = RunStatus::Running;
        self.started_at = Some(chrono::Utc::now().to_rfc3339());
    }

    /// Record signals, keeping first-seen order and dropping duplicates.
    pub fn record_signals<'a>(&mut self, signals: impl IntoIterator<Item = &'a OutcomeSignal>) {
        for signal in signals {
            if !self.outcome_signals.contains(signal) {
                self.outcome_signals.push(signal.clone());
            }
        }
    }

    /// Fold in worker-reported usage. Totals never decrease. Returns true on change.
    pub fn record_usage(&mut self, turns: u64, cost: f64) -> bool {
        let changed = turns > self.turns_used || cost > self.cost;
        self.turns_used = self.turns_used.max(turns);
        self.cost = self.cost.max(cost);
        changed
    }

    /// Move the run to a terminal status.
    pub fn finish(&mut self, status: RunStatus, reason: Option<Rationale>) {
        self.status = status;
        self.stop_reason = reason;
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
    }

    /// Check if the run is currently executing.
    pub fn is_active(&self) -> bool {
        matches!(self.status, RunStatus::Pending | RunStatus::Running)
    }

    /// Check if the run reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_signal(&self, signal: &OutcomeSignal) -> bool {
        self.outcome_signals.contains(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_run_lifecycle() {
        let stage = StageType::new("BUILD").unwrap();
        let mut run = WorkflowRun::pending("epic-1", &stage, "epic-1_BUILD_1", 1, "card-1");
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.is_active());
        assert!(!run.is_complete());

        run.start("run-abc");
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());

        run.finish(RunStatus::Stuck, Some(Rationale::Stuck));
        assert!(!run.is_active());
        assert!(run.is_complete());
        assert_eq!(run.stop_reason, Some(Rationale::Stuck));
    }

    #[test]
    fn test_signal_parsing() {
        assert_eq!(
            "tests_failed".parse::<OutcomeSignal>().unwrap(),
            OutcomeSignal::TestsFailed
        );
        assert_eq!(
            "DOCS_UPDATED".parse::<OutcomeSignal>().unwrap(),
            OutcomeSignal::Custom("DOCS_UPDATED".to_string())
        );
        assert!("".parse::<OutcomeSignal>().is_err());
        assert!("all tests pass".parse::<OutcomeSignal>().is_err());
    }

    #[test]
    fn test_signal_serde_uses_codes() {
        let json = serde_json::to_string(&vec![
            OutcomeSignal::BreakingChange,
            OutcomeSignal::Custom("X_DONE".into()),
        ])
        .unwrap();
        assert_eq!(json, r#"["BREAKING_CHANGE","X_DONE"]"#);
        let back: Vec<OutcomeSignal> = serde_json::from_str(&json).unwrap();
        assert!(back[0].is_safety_critical());
    }

    #[test]
    fn test_record_signals_dedups_in_order() {
        let stage = StageType::new("BUILD").unwrap();
        let mut run = WorkflowRun::pending("e", &stage, "s", 1, "c");
        run.record_signals(&[OutcomeSignal::TestsFailed, OutcomeSignal::AllTestsPass]);
        run.record_signals(&[OutcomeSignal::TestsFailed]);
        assert_eq!(
            run.outcome_signals,
            vec![OutcomeSignal::TestsFailed, OutcomeSignal::AllTestsPass]
        );
    }
}
