//! Error taxonomy for the orchestration engine.
//!
//! Shell wrappers (`tmux`, `docker`, `dependencies`) keep returning plain
//! `String` errors; everything above them speaks `EngineError`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad stage or session input. Nothing was created.
    #[error("Spawn rejected: {0}")]
    SpawnRejected(String),

    /// The task card could not be pulled or parsed after all retries
    #[error("Task card unreachable: {0}")]
    CardUnreachable(String),

    /// A task card field moved backwards
    #[error("Task card corruption: {0}")]
    CardCorruption(String),

    /// A routing target outside the registered stage table, or a move out of a terminal state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Worker backend failures (tmux, docker, agent CLI)
    #[error("Worker error: {0}")]
    Worker(String),

    /// Unknown epic, run, card or escalation
    #[error("Not found: {0}")]
    NotFound(String),

    /// Settings that failed to load or validate
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQLite errors (auto-converted from rusqlite::Error)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema migration errors
    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for engine errors
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Create a spawn rejection
    pub fn spawn_rejected(msg: impl Into<String>) -> Self {
        Self::SpawnRejected(msg.into())
    }

    /// Create an invalid transition error
    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    /// Create a worker error
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The rationale an escalation should carry for this error, if it has one.
    pub fn rationale(&self) -> Option<Rationale> {
        match self {
            Self::CardUnreachable(_) => Some(Rationale::CardUnreachable),
            Self::CardCorruption(_) => Some(Rationale::CardCorruption),
            Self::InvalidTransition(_) => Some(Rationale::InvalidTransition),
            Self::SpawnRejected(_) => Some(Rationale::SpawnRejected),
            Self::Worker(_) => Some(Rationale::WorkerFailed),
            _ => None,
        }
    }
}

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}

/// Why a routing decision went where it did.
///
/// Every decision that targets HUMAN carries one of the escalation variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rationale {
    /// Normal decision-table route
    Routed,
    /// Operator forced the next stage
    Override,
    /// Operator answered an escalation
    Resolution,
    /// No progress signal for longer than max_wait
    Stuck,
    /// Cumulative cost or turns above the configured ceiling
    BudgetExceeded,
    /// Stage attempted more times than allowed
    AttemptLimit,
    /// Run completed without a recognized outcome signal
    SignalMissing,
    /// Task card could not be read
    CardUnreachable,
    /// Task card monotonicity violated
    CardCorruption,
    /// Target outside the registered stage table
    InvalidTransition,
    /// Worker declared a breaking change
    BreakingChange,
    /// Worker declared a security-relevant change
    SecurityRisk,
    /// Worker touched something outside its stage scope
    ScopeViolation,
    /// Worker session died or the backend failed
    WorkerFailed,
    /// Spawn was refused before anything started
    SpawnRejected,
    /// Run was cancelled by an operator
    Aborted,
    /// Run was found orphaned during startup recovery
    Interrupted,
}

impl Rationale {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routed => "Routed",
            Self::Override => "Override",
            Self::Resolution => "Resolution",
            Self::Stuck => "Stuck",
            Self::BudgetExceeded => "BudgetExceeded",
            Self::AttemptLimit => "AttemptLimit",
            Self::SignalMissing => "SignalMissing",
            Self::CardUnreachable => "CardUnreachable",
            Self::CardCorruption => "CardCorruption",
            Self::InvalidTransition => "InvalidTransition",
            Self::BreakingChange => "BreakingChange",
            Self::SecurityRisk => "SecurityRisk",
            Self::ScopeViolation => "ScopeViolation",
            Self::WorkerFailed => "WorkerFailed",
            Self::SpawnRejected => "SpawnRejected",
            Self::Aborted => "Aborted",
            Self::Interrupted => "Interrupted",
        }
    }

    /// Declared by the worker through a safety signal. Outranks budget overrides.
    pub fn is_safety(&self) -> bool {
        matches!(
            self,
            Self::BreakingChange | Self::SecurityRisk | Self::ScopeViolation
        )
    }

    /// Parse the stored form produced by `as_str`.
    pub fn parse(value: &str) -> Option<Self> {
        const ALL: [Rationale; 17] = [
            Rationale::Routed,
            Rationale::Override,
            Rationale::Resolution,
            Rationale::Stuck,
            Rationale::BudgetExceeded,
            Rationale::AttemptLimit,
            Rationale::SignalMissing,
            Rationale::CardUnreachable,
            Rationale::CardCorruption,
            Rationale::InvalidTransition,
            Rationale::BreakingChange,
            Rationale::SecurityRisk,
            Rationale::ScopeViolation,
            Rationale::WorkerFailed,
            Rationale::SpawnRejected,
            Rationale::Aborted,
            Rationale::Interrupted,
        ];
        ALL.into_iter().find(|r| r.as_str() == value)
    }
}

impl fmt::Display for Rationale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rationale_round_trip_through_str() {
        for r in [
            Rationale::BudgetExceeded,
            Rationale::SignalMissing,
            Rationale::Interrupted,
        ] {
            assert_eq!(Rationale::parse(r.as_str()), Some(r));
        }
        assert_eq!(Rationale::parse("Nope"), None);
    }

    #[test]
    fn test_error_rationale_mapping() {
        let err = EngineError::CardCorruption("checkbox 1 unset".into());
        assert_eq!(err.rationale(), Some(Rationale::CardCorruption));
        assert_eq!(EngineError::not_found("epic-x").rationale(), None);
    }
}
