//! DevOps module: the epic orchestration engine.
//!
//! This module provides:
//! - Dependency detection (tmux, docker, git, agent CLIs)
//! - tmux session management
//! - Docker sandbox containers for isolated agent execution
//! - Git worktree management
//! - Stage registry, runs and persistence
//! - Worker backends (tmux and simulated)
//! - Epic operations (cards, sessions, monitoring, routing, escalation)

mod dependencies;
pub mod docker;
pub mod error;
pub mod operations;
pub mod orchestrator;
pub mod pipeline;
pub mod sim;
pub mod stages;
pub mod store;
pub mod tmux;
pub mod worktree;

pub use dependencies::*;
pub use error::{EngineError, EngineResult, Rationale};
