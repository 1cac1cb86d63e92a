//! CLI argument parsing for uipilot.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Clone, Debug)]
#[command(name = "uipilot")]
#[command(about = "Drive UI tests from natural-language intents")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Discard newly generated cache entries instead of committing them
    #[arg(long, global = true)]
    pub discard: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Perform one or more intents in order
    Step {
        /// Intents, executed in the order given
        #[arg(required = true)]
        intents: Vec<String>,
    },

    /// Let the planner work toward a goal
    Autopilot {
        goal: String,

        /// Write the JSON report to this path
        #[arg(long, value_name = "PATH")]
        report: Option<PathBuf>,
    },

    /// Manage the step cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum CacheAction {
    /// Delete every cached step
    Clear,
}
