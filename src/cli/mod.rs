//! CLI interface using clap
//!
//! Provides the process-runner surface used by the scheduler and operators

mod commands;

pub use commands::*;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Metaloop - self-maintenance orchestrator for an autonomous assistant
#[derive(Parser, Debug)]
#[command(name = "metaloop")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the config file
    #[arg(short, long, global = true, env = "METALOOP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the database (overrides the config file)
    #[arg(long, global = true, env = "METALOOP_DB")]
    pub db: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(short = 'o', long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default config file
    Init(InitArgs),

    /// Run self-maintenance actions, or print the dashboard
    Run(RunArgs),

    /// Answer a chat subcommand (status, audit, proposal, log, gaps, stop, start)
    Meta(MetaArgs),

    /// Turn the global kill switch on or off
    KillSwitch(KillSwitchArgs),

    /// Turn one feature on or off
    Feature(FeatureArgs),

    /// Record an approval decision on a suggestion, proposal or gap
    Review(ReviewArgs),
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// On/off argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    pub fn is_on(self) -> bool {
        self == Switch::On
    }
}

/// Arguments for init command
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config file
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Run the usage self-audit
    #[arg(long)]
    pub self_audit: bool,

    /// Review source files
    #[arg(long)]
    pub code_review: bool,

    /// Propose refactors
    #[arg(long)]
    pub refactor: bool,

    /// Track manual operations as capability gaps
    #[arg(long)]
    pub gap_analysis: bool,

    /// Shorthand for all four actions
    #[arg(short, long)]
    pub all: bool,

    /// Print the dashboard instead of running anything
    #[arg(long)]
    pub dashboard: bool,
}

impl RunArgs {
    pub fn options(&self) -> crate::orchestrator::RunOptions {
        if self.all {
            return crate::orchestrator::RunOptions::all();
        }
        crate::orchestrator::RunOptions {
            self_audit: self.self_audit,
            code_review: self.code_review,
            refactor: self.refactor,
            gap_analysis: self.gap_analysis,
        }
    }
}

/// Arguments for meta command
#[derive(Parser, Debug)]
pub struct MetaArgs {
    /// Subcommand to answer
    #[arg(default_value = "status")]
    pub subcommand: String,
}

/// Arguments for kill-switch command
#[derive(Parser, Debug)]
pub struct KillSwitchArgs {
    #[arg(value_enum)]
    pub state: Switch,
}

/// Arguments for feature command
#[derive(Parser, Debug)]
pub struct FeatureArgs {
    /// Feature name (self-audit, code-review, refactor, gap-analysis)
    pub name: String,

    #[arg(value_enum)]
    pub state: Switch,
}

/// What a review decision applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReviewTarget {
    Suggestion,
    Proposal,
    Gap,
}

/// Arguments for review command
#[derive(Parser, Debug)]
pub struct ReviewArgs {
    #[arg(value_enum)]
    pub target: ReviewTarget,

    /// Record id
    pub id: String,

    /// New status (e.g. approved, rejected, applied)
    pub status: String,

    /// Free-text feedback (suggestions and proposals only)
    #[arg(short, long)]
    pub feedback: Option<String>,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
