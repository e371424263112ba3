//! Command-line argument definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Drive coding-agent epics through registered stages
///
/// Each stage runs one agent session coordinated by a markdown task card.
/// The agent's declared outcome signals pick the next stage; anything
/// safety-relevant stops the epic and waits for an operator.
#[derive(Parser, Debug, Clone)]
#[command(name = "handy-conductor")]
#[command(version)]
pub struct Args {
    /// Settings file (defaults to $HANDY_CONDUCTOR_CONFIG or the config dir)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log filter directives, e.g. "debug" or "handy_conductor::devops=trace"
    #[arg(long, global = true, value_name = "FILTER")]
    pub log: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create an epic at the initial stage
    CreateEpic {
        /// What the epic should achieve
        objective: String,
        /// Start driving the epic right away
        #[arg(long)]
        run: bool,
    },

    /// Drive ACTIVE epics until they block or finish
    Run {
        /// Epic to drive (all ACTIVE epics when omitted)
        epic_id: Option<String>,
    },

    /// Move an epic to a stage regardless of routing
    OverrideStage { epic_id: String, stage: String },

    /// Run an epic end to end against the simulated worker
    DryRun {
        /// Objective for the throwaway epic
        #[arg(default_value = "dry run")]
        objective: String,
        /// Behaviour per stage, e.g. "BUILD=TESTS_FAILED|ALL_TESTS_PASS,VALIDATE=STALL"
        #[arg(long, default_value = "")]
        script: String,
    },

    /// Show epics, or one epic with its runs and decisions
    Status { epic_id: Option<String> },

    /// List escalations waiting for an operator
    Escalations {
        /// Include resolved escalations
        #[arg(long)]
        all: bool,
    },

    /// Answer an escalation (resume, retry, route:STAGE, complete, abandon, pause)
    Resolve { id: i64, option: String },

    /// Fail RUNNING runs whose worker is gone and block their epics
    Recover,

    /// Check the tools the current settings need
    Doctor,

    /// Pattern memory
    Patterns {
        #[command(subcommand)]
        command: PatternCommand,
    },

    /// Print the effective settings
    Config {
        /// Write them to the settings file
        #[arg(long)]
        write: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum PatternCommand {
    /// Find patterns relevant to a query
    Search {
        query: String,
        /// Stage scope (global patterns are always included)
        #[arg(long, default_value = "global")]
        scope: String,
    },
    /// Add or replace a pattern
    Add {
        name: String,
        body: String,
        #[arg(long, default_value = "global")]
        scope: String,
        #[arg(long, default_value_t = 0.5)]
        confidence: f64,
    },
}
