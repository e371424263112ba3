//! Registered stage capability table.
//!
//! Stages are data, not types: each `StageDescriptor` names its worker role,
//! turn budget, default card requirements and an ordered route table keyed on
//! outcome signals. New stages are added by registering a descriptor.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::error::{EngineError, EngineResult};
use super::pipeline::OutcomeSignal;

static STAGE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]{0,31}$").unwrap());

/// Target names that can never be registered as stages
const RESERVED_TARGETS: [&str; 3] = ["HUMAN", "COMPLETED", "FAILED"];

/// Name of a registered stage (e.g. "BUILD").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StageType(String);

impl StageType {
    /// Normalize to upper case and validate the name shape.
    pub fn new(name: &str) -> Result<Self, String> {
        let upper = name.trim().to_ascii_uppercase();
        if !STAGE_NAME.is_match(&upper) {
            return Err(format!(
                "Invalid stage name '{}': expected letters, digits and underscores",
                name
            ));
        }
        Ok(Self(upper))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for StageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for StageType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<StageType> for String {
    fn from(stage: StageType) -> Self {
        stage.0
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a routing decision sends the epic next.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RouteTarget {
    /// Spawn another stage
    Stage(StageType),
    /// Hand off to an operator; the epic becomes BLOCKED
    Human,
    /// Finish the epic successfully
    Completed,
    /// Finish the epic as failed
    Failed,
}

impl RouteTarget {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stage(stage) => stage.as_str(),
            Self::Human => "HUMAN",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Self::Human)
    }
}

impl FromStr for RouteTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HUMAN" => Ok(Self::Human),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => StageType::new(other).map(Self::Stage),
        }
    }
}

impl TryFrom<String> for RouteTarget {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RouteTarget> for String {
    fn from(target: RouteTarget) -> Self {
        target.as_str().to_string()
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decision-table entry: when `signal` was emitted, go to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub signal: OutcomeSignal,
    pub target: RouteTarget,
}

impl RouteRule {
    fn to_stage(signal: OutcomeSignal, stage: &str) -> Self {
        Self {
            signal,
            target: RouteTarget::Stage(StageType(stage.to_string())),
        }
    }
}

/// Registration entry for a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Stage name
    pub name: StageType,
    /// Agent CLI that runs this stage (e.g., "claude", "aider")
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    /// Maximum turns handed to the worker per run
    #[serde(default = "default_turn_budget")]
    pub turn_budget: u32,
    /// One-line role description prepended to the worker prompt
    #[serde(default)]
    pub brief: String,
    /// Default requirement checklist for the stage's task card
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Ordered decision table; the first rule whose signal was emitted wins
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    /// Arriving at this stage completes the epic
    #[serde(default)]
    pub terminal: bool,
}

fn default_agent_type() -> String {
    "claude".to_string()
}

fn default_turn_budget() -> u32 {
    40
}

impl StageDescriptor {
    fn builtin(name: &str, brief: &str, requirements: &[&str], routes: Vec<RouteRule>) -> Self {
        Self {
            name: StageType(name.to_string()),
            agent_type: default_agent_type(),
            turn_budget: default_turn_budget(),
            brief: brief.to_string(),
            requirements: requirements.iter().map(|r| r.to_string()).collect(),
            routes,
            terminal: false,
        }
    }
}

/// The built-in stage table.
pub fn default_stage_descriptors() -> Vec<StageDescriptor> {
    use OutcomeSignal::*;

    let mut release = StageDescriptor::builtin(
        "RELEASE",
        "Hand the validated branch to release tooling.",
        &[],
        Vec::new(),
    );
    release.terminal = true;

    vec![
        StageDescriptor::builtin(
            "DESIGN",
            "Write the design for the objective. Do not implement it.",
            &["Design document written", "Open questions listed"],
            vec![RouteRule::to_stage(DesignComplete, "BUILD")],
        ),
        StageDescriptor::builtin(
            "BUILD",
            "Implement the design and run the test suite.",
            &["Implementation complete", "Tests written", "Test suite run"],
            vec![
                RouteRule::to_stage(TestsFailed, "REMEDIATE"),
                RouteRule::to_stage(AllTestsPass, "VALIDATE"),
            ],
        ),
        StageDescriptor::builtin(
            "REMEDIATE",
            "Fix the failing tests without widening scope.",
            &["Failures triaged", "Fixes applied", "Test suite run"],
            vec![
                RouteRule::to_stage(AllTestsPass, "VALIDATE"),
                RouteRule::to_stage(TestsFailed, "REMEDIATE"),
            ],
        ),
        StageDescriptor::builtin(
            "VALIDATE",
            "Independently verify the change against the objective.",
            &["Acceptance checks run", "Test suite run"],
            vec![
                RouteRule::to_stage(AllTestsPass, "RELEASE"),
                RouteRule::to_stage(TestsFailed, "REMEDIATE"),
            ],
        ),
        StageDescriptor::builtin(
            "POLISH",
            "Clean up naming, docs and lint without changing behavior.",
            &["Lint clean", "Docs updated"],
            vec![RouteRule::to_stage(PolishComplete, "VALIDATE")],
        ),
        release,
    ]
}

/// Registered stages keyed by name.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: BTreeMap<StageType, StageDescriptor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        // The built-in table is known to be consistent.
        let mut stages = BTreeMap::new();
        for descriptor in default_stage_descriptors() {
            stages.insert(descriptor.name.clone(), descriptor);
        }
        Self { stages }
    }
}

impl StageRegistry {
    /// Build a registry and reject any table that routes outside itself.
    pub fn from_descriptors(descriptors: Vec<StageDescriptor>) -> EngineResult<Self> {
        let mut stages = BTreeMap::new();
        for descriptor in descriptors {
            if RESERVED_TARGETS.contains(&descriptor.name.as_str()) {
                return Err(EngineError::config(format!(
                    "'{}' is a reserved routing target and cannot be a stage",
                    descriptor.name
                )));
            }
            if descriptor.turn_budget == 0 {
                return Err(EngineError::config(format!(
                    "Stage '{}' has a zero turn budget",
                    descriptor.name
                )));
            }
            if stages.insert(descriptor.name.clone(), descriptor).is_some() {
                return Err(EngineError::config("Duplicate stage registration"));
            }
        }
        let registry = Self { stages };
        registry.validate()?;
        Ok(registry)
    }

    /// Check every route target is registered.
    pub fn validate(&self) -> EngineResult<()> {
        if self.stages.is_empty() {
            return Err(EngineError::config("Stage table is empty"));
        }
        for descriptor in self.stages.values() {
            for rule in &descriptor.routes {
                if let RouteTarget::Stage(target) = &rule.target {
                    if !self.stages.contains_key(target) {
                        return Err(EngineError::config(format!(
                            "Stage '{}' routes {} to unregistered stage '{}'",
                            descriptor.name, rule.signal, target
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Add or replace a stage. The table must still validate afterwards.
    pub fn register(&mut self, descriptor: StageDescriptor) -> EngineResult<()> {
        let previous = self.stages.insert(descriptor.name.clone(), descriptor.clone());
        if let Err(e) = self.validate() {
            match previous {
                Some(old) => {
                    self.stages.insert(old.name.clone(), old);
                }
                None => {
                    self.stages.remove(&descriptor.name);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn get(&self, stage: &StageType) -> Option<&StageDescriptor> {
        self.stages.get(stage)
    }

    /// Look up a stage by its (case-insensitive) name.
    pub fn lookup(&self, name: &str) -> Option<&StageDescriptor> {
        StageType::new(name).ok().and_then(|s| self.stages.get(&s))
    }

    pub fn contains(&self, stage: &StageType) -> bool {
        self.stages.contains_key(stage)
    }

    /// Whether a target is acceptable for `advance`.
    pub fn accepts(&self, target: &RouteTarget) -> bool {
        match target {
            RouteTarget::Stage(stage) => self.contains(stage),
            _ => true,
        }
    }

    pub fn is_terminal(&self, stage: &StageType) -> bool {
        self.get(stage).map(|d| d.terminal).unwrap_or(false)
    }

    pub fn names(&self) -> Vec<&StageType> {
        self.stages.keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_type_normalizes_case() {
        assert_eq!(StageType::new("build").unwrap().as_str(), "BUILD");
        assert!(StageType::new("").is_err());
        assert!(StageType::new("1BUILD").is_err());
        assert!(StageType::new("BUILD.X").is_err());
    }

    #[test]
    fn test_route_target_parsing() {
        assert_eq!("human".parse::<RouteTarget>().unwrap(), RouteTarget::Human);
        assert_eq!(
            "VALIDATE".parse::<RouteTarget>().unwrap(),
            RouteTarget::Stage(StageType::new("VALIDATE").unwrap())
        );
    }

    #[test]
    fn test_default_table_validates() {
        let registry = StageRegistry::default();
        registry.validate().unwrap();
        assert!(registry.is_terminal(&StageType::new("RELEASE").unwrap()));
        assert!(!registry.is_terminal(&StageType::new("BUILD").unwrap()));
        assert_eq!(registry.names().len(), 6);
    }

    #[test]
    fn test_unregistered_route_target_rejected() {
        let mut descriptors = default_stage_descriptors();
        descriptors.retain(|d| d.name.as_str() != "REMEDIATE");
        let err = StageRegistry::from_descriptors(descriptors).unwrap_err();
        assert!(err.to_string().contains("REMEDIATE"));
    }

    #[test]
    fn test_reserved_stage_name_rejected() {
        let mut descriptors = default_stage_descriptors();
        descriptors.push(StageDescriptor::builtin("HUMAN", "", &[], Vec::new()));
        assert!(StageRegistry::from_descriptors(descriptors).is_err());
    }

    #[test]
    fn test_register_rolls_back_invalid_stage() {
        let mut registry = StageRegistry::default();
        let bad = StageDescriptor::builtin(
            "DOCS",
            "",
            &[],
            vec![RouteRule::to_stage(OutcomeSignal::PolishComplete, "NOWHERE")],
        );
        assert!(registry.register(bad).is_err());
        assert!(registry.lookup("DOCS").is_none());
    }

    #[test]
    fn test_descriptor_json_defaults() {
        let json = r#"{"name": "docs", "routes": [{"signal": "DOCS_DONE", "target": "VALIDATE"}]}"#;
        let descriptor: StageDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.name.as_str(), "DOCS");
        assert_eq!(descriptor.agent_type, "claude");
        assert_eq!(descriptor.turn_budget, 40);
        assert!(!descriptor.terminal);
        assert_eq!(
            descriptor.routes[0].signal,
            OutcomeSignal::Custom("DOCS_DONE".into())
        );
    }
}
