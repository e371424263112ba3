//! Handy Conductor: staged epic orchestration for coding agents.

pub mod cli;
pub mod commands;
pub mod devops;
pub mod logging;
pub mod settings;
