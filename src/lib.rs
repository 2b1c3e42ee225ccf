//! Metaloop - self-maintenance orchestrator for an autonomous assistant
//!
//! This library provides the kill switch and feature flags, the four
//! self-maintenance actions, their record lifecycles and the action log
//! that brackets every run.

pub mod actions;
pub mod chat;
pub mod cli;
pub mod config;
pub mod dashboard;
pub mod llm;
pub mod orchestrator;
pub mod records;
pub mod storage;
pub mod usage;

/// Re-export commonly used types
pub use config::AppConfig;
pub use dashboard::Dashboard;
pub use orchestrator::{Orchestrator, RunOptions, RunOutcome, RunReport};
pub use records::{ActionKind, ActionLog, ActionStatus, Feature, Settings};
pub use storage::Database;

/// Application-wide error type
pub use anyhow::Result;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = "metaloop";
