//! Human escalation: structured messages, the delivery channel, and
//! validation of operator resolutions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::epic::{Epic, EpicManager, EpicUsage};
use super::router::RoutingDecision;
use crate::devops::docker::sanitize_sensitive_data;
use crate::devops::error::{EngineError, EngineResult, Rationale};
use crate::devops::stages::{RouteTarget, StageRegistry, StageType};
use crate::devops::store::Store;

/// An answer an operator can give to a blocked epic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResolutionOption {
    /// Re-enter the current stage, continuing the previous session
    Resume,
    /// Re-run the current stage in a fresh session
    Retry,
    /// Move to a named stage
    Route(StageType),
    /// Accept the work as done
    Complete,
    /// Give up on the epic
    Abandon,
    /// Leave the epic blocked
    Pause,
}

impl fmt::Display for ResolutionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resume => f.write_str("resume"),
            Self::Retry => f.write_str("retry"),
            Self::Route(stage) => write!(f, "route:{}", stage),
            Self::Complete => f.write_str("complete"),
            Self::Abandon => f.write_str("abandon"),
            Self::Pause => f.write_str("pause"),
        }
    }
}

impl FromStr for ResolutionOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((head, stage)) = s.split_once(':') {
            if head.eq_ignore_ascii_case("route") {
                return Ok(Self::Route(StageType::new(stage)?));
            }
        }
        match s.to_ascii_lowercase().as_str() {
            "resume" => Ok(Self::Resume),
            "retry" => Ok(Self::Retry),
            "complete" => Ok(Self::Complete),
            "abandon" => Ok(Self::Abandon),
            "pause" => Ok(Self::Pause),
            other => Err(format!(
                "Unknown resolution '{}' (expected resume, retry, route:STAGE, complete, \
                 abandon or pause)",
                other
            )),
        }
    }
}

impl TryFrom<String> for ResolutionOption {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResolutionOption> for String {
    fn from(value: ResolutionOption) -> Self {
        value.to_string()
    }
}

/// Everything an operator needs to decide on a blocked epic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationMessage {
    /// Blocked epic
    pub epic_id: String,
    /// Stage the epic is blocked at
    pub stage: StageType,
    /// Why the epic was blocked
    pub rationale: Rationale,
    /// Answers the operator may pick from
    pub options: Vec<ResolutionOption>,
    /// Cumulative cost so far (USD)
    pub cost_so_far: f64,
    /// Cumulative turns so far
    pub turns_so_far: u64,
    /// Sanitized details from the routing decision
    pub blocking_issues: Vec<String>,
    /// ISO timestamp when the escalation was raised
    pub raised_at: String,
}

/// A persisted escalation and its resolution state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: i64,
    #[serde(flatten)]
    pub message: EscalationMessage,
    pub resolved_at: Option<String>,
    pub resolution: Option<ResolutionOption>,
}

impl EscalationRecord {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

impl EscalationMessage {
    /// Build the message for a HUMAN decision.
    pub fn from_decision(
        epic: &Epic,
        decision: &RoutingDecision,
        usage: &EpicUsage,
        registry: &StageRegistry,
    ) -> Self {
        Self {
            epic_id: epic.id.clone(),
            stage: decision.source_stage.clone(),
            rationale: decision.rationale,
            options: resolution_options(decision, registry),
            cost_so_far: usage.cost,
            turns_so_far: usage.turns,
            blocking_issues: decision
                .blocking_issues
                .iter()
                .map(|issue| sanitize_sensitive_data(issue))
                .collect(),
            raised_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Check if `option` may be used to answer this escalation.
    pub fn allows(&self, option: &ResolutionOption) -> bool {
        matches!(option, ResolutionOption::Pause) || self.options.contains(option)
    }
}

/// Options offered for a decision, in presentation order.
fn resolution_options(
    decision: &RoutingDecision,
    registry: &StageRegistry,
) -> Vec<ResolutionOption> {
    let mut options = Vec::new();

    if matches!(
        decision.rationale,
        Rationale::Stuck
            | Rationale::Interrupted
            | Rationale::Aborted
            | Rationale::CardUnreachable
            | Rationale::BudgetExceeded
    ) {
        options.push(ResolutionOption::Resume);
    }
    options.push(ResolutionOption::Retry);

    if let Some(descriptor) = registry.get(&decision.source_stage) {
        for rule in &descriptor.routes {
            if let RouteTarget::Stage(stage) = &rule.target {
                let option = ResolutionOption::Route(stage.clone());
                if !options.contains(&option) {
                    options.push(option);
                }
            }
        }
    }

    if matches!(
        decision.rationale,
        Rationale::BreakingChange
            | Rationale::SecurityRisk
            | Rationale::ScopeViolation
            | Rationale::SignalMissing
    ) {
        options.push(ResolutionOption::Complete);
    }

    options.push(ResolutionOption::Abandon);
    options.push(ResolutionOption::Pause);
    options
}

/// Delivery target for escalations
#[async_trait]
pub trait EscalationChannel: Send + Sync {
    /// Deliver the message. Returns the escalation id.
    async fn escalate(&self, message: EscalationMessage) -> EngineResult<i64>;
}

/// Records escalations in the store and logs them.
pub struct StoreEscalations {
    store: Arc<Store>,
}

impl StoreEscalations {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EscalationChannel for StoreEscalations {
    async fn escalate(&self, message: EscalationMessage) -> EngineResult<i64> {
        if let Some(open) = self.store.open_escalation_for(&message.epic_id)? {
            if open.message.stage == message.stage && open.message.rationale == message.rationale {
                log::info!(
                    "Epic {} already has open escalation {} for {}",
                    message.epic_id,
                    open.id,
                    message.rationale
                );
                return Ok(open.id);
            }
        }

        let id = self.store.insert_escalation(&message)?;
        let options: Vec<String> = message.options.iter().map(|o| o.to_string()).collect();
        log::warn!(
            "Escalation {}: epic {} blocked at {} ({}); options: {}",
            id,
            message.epic_id,
            message.stage,
            message.rationale,
            options.join(", ")
        );
        for issue in &message.blocking_issues {
            log::warn!("  {}", issue);
        }
        Ok(id)
    }
}

/// Logs escalations without persisting them (dry runs).
#[derive(Default)]
pub struct LogEscalations {
    next_id: std::sync::atomic::AtomicI64,
}

#[async_trait]
impl EscalationChannel for LogEscalations {
    async fn escalate(&self, message: EscalationMessage) -> EngineResult<i64> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        log::warn!(
            "Escalation {}: epic {} blocked at {} ({}): {}",
            id,
            message.epic_id,
            message.stage,
            message.rationale,
            message.blocking_issues.join("; ")
        );
        Ok(id)
    }
}

/// Apply an operator's answer to escalation `id`.
///
/// The option must be one of those offered (pause is always allowed and
/// leaves the escalation open).
pub fn resolve_escalation(
    store: &Store,
    manager: &EpicManager,
    id: i64,
    option: &ResolutionOption,
) -> EngineResult<Epic> {
    let record = store
        .load_escalation(id)?
        .ok_or_else(|| EngineError::not_found(format!("escalation {}", id)))?;

    if !record.is_open() {
        return Err(EngineError::invalid_transition(format!(
            "escalation {} was already resolved",
            id
        )));
    }
    if !record.message.allows(option) {
        let offered: Vec<String> = record.message.options.iter().map(|o| o.to_string()).collect();
        return Err(EngineError::invalid_transition(format!(
            "'{}' is not an offered option for escalation {} (offered: {})",
            option,
            id,
            offered.join(", ")
        )));
    }

    let epic = manager.resolve(&record.message.epic_id, option)?;
    if *option != ResolutionOption::Pause {
        store.resolve_escalation(id, option)?;
        log::info!("Escalation {} resolved with {}", id, option);
    }
    Ok(epic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devops::operations::epic::{EpicStatus, EpicWorkspace};
    use crate::devops::operations::router::Priority;

    fn decision(stage: &str, rationale: Rationale) -> RoutingDecision {
        RoutingDecision::human(
            "epic-1",
            Some("run-1"),
            &StageType::new(stage).unwrap(),
            Priority::High,
            rationale,
            vec!["token sk-ant-abc123 leaked".to_string()],
        )
    }

    #[test]
    fn test_option_strings() {
        for raw in ["resume", "retry", "route:REMEDIATE", "complete", "abandon", "pause"] {
            let option: ResolutionOption = raw.parse().unwrap();
            assert_eq!(option.to_string(), raw);
        }
        assert_eq!(
            "Route:build".parse::<ResolutionOption>().unwrap(),
            ResolutionOption::Route(StageType::new("BUILD").unwrap())
        );
        assert!("skip".parse::<ResolutionOption>().is_err());
        assert!("route:".parse::<ResolutionOption>().is_err());
    }

    #[test]
    fn test_options_for_stuck_build() {
        let registry = StageRegistry::default();
        let options = resolution_options(&decision("BUILD", Rationale::Stuck), &registry);
        let rendered: Vec<String> = options.iter().map(|o| o.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "resume",
                "retry",
                "route:REMEDIATE",
                "route:VALIDATE",
                "abandon",
                "pause"
            ]
        );
    }

    #[test]
    fn test_options_for_breaking_change_offer_complete() {
        let registry = StageRegistry::default();
        let options = resolution_options(&decision("BUILD", Rationale::BreakingChange), &registry);
        assert!(options.contains(&ResolutionOption::Complete));
        assert!(!options.contains(&ResolutionOption::Resume));
    }

    #[test]
    fn test_message_is_sanitized_and_pause_always_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let epic = Epic {
            id: "epic-1".to_string(),
            objective: "x".to_string(),
            workspace: EpicWorkspace {
                path: dir.path().to_path_buf(),
                branch: "epic/epic-1".to_string(),
            },
            current_stage: StageType::new("BUILD").unwrap(),
            status: EpicStatus::Blocked,
            stage_history: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
            resume_next: false,
            blocked_reason: Some(Rationale::SecurityRisk),
            attempt_floor: 0,
        };
        let message = EscalationMessage::from_decision(
            &epic,
            &decision("BUILD", Rationale::SecurityRisk),
            &EpicUsage::default(),
            &StageRegistry::default(),
        );
        assert!(message.blocking_issues[0].contains("[REDACTED]"));
        assert!(!message.blocking_issues[0].contains("sk-ant-abc123"));
        assert!(message.allows(&ResolutionOption::Pause));
        assert!(!message.allows(&ResolutionOption::Resume));
    }
}
