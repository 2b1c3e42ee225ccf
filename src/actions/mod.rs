//! Self-maintenance actions
//!
//! Each action reads signals, asks the text generator for structured
//! output and writes records. Actions never touch the action log; the
//! orchestrator brackets every invocation.

mod code_review;
mod gap_analysis;
mod refactor;
mod self_audit;
mod sources;

pub use code_review::CodeReview;
pub use gap_analysis::GapAnalysis;
pub use refactor::RefactorProposals;
pub use self_audit::SelfAudit;
pub use sources::{collect_source_files, SourceFile};

use crate::config::AppConfig;
use crate::llm::TextGenerator;
use crate::records::{ActionKind, Feature};
use crate::storage::Database;
use crate::usage::UsageSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Why an action failed
#[derive(Debug, Error)]
pub enum ActionError {
    /// The action or one generator call exceeded its time bound
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("text generation failed: {0:#}")]
    Generator(anyhow::Error),

    #[error("could not parse generated content: {0:#}")]
    Parse(anyhow::Error),

    #[error("usage signals unavailable: {0:#}")]
    Usage(anyhow::Error),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

/// What an action produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub records_written: usize,
    pub summary: String,
}

impl ActionOutcome {
    pub fn new(records_written: usize, summary: impl Into<String>) -> Self {
        Self {
            records_written,
            summary: summary.into(),
        }
    }
}

/// Everything an action may use while it runs
pub struct ActionContext<'a> {
    pub db: &'a Database,
    pub generator: &'a dyn TextGenerator,
    pub usage: &'a dyn UsageSource,
    pub config: &'a AppConfig,
    /// Bound for a single generator call
    pub call_timeout: Duration,
    /// When this invocation started; usage windows end here
    pub started_at: DateTime<Utc>,
}

impl<'a> ActionContext<'a> {
    pub fn new(
        db: &'a Database,
        generator: &'a dyn TextGenerator,
        usage: &'a dyn UsageSource,
        config: &'a AppConfig,
    ) -> Self {
        Self {
            db,
            generator,
            usage,
            config,
            call_timeout: config.schedule.call_timeout(),
            started_at: Utc::now(),
        }
    }

    /// Run one generator call under the per-call timeout
    pub async fn generate(&self, prompt: &str) -> Result<String, ActionError> {
        match tokio::time::timeout(self.call_timeout, self.generator.complete(prompt)).await {
            Ok(Ok(response)) => Ok(response.content),
            Ok(Err(e)) => Err(ActionError::Generator(e)),
            Err(_) => Err(ActionError::Timeout(self.call_timeout)),
        }
    }
}

/// A self-maintenance action
#[async_trait(?Send)]
pub trait Action {
    /// The feature flag gating this action
    fn feature(&self) -> Feature;

    fn kind(&self) -> ActionKind {
        self.feature().action_kind()
    }

    async fn run(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError>;
}

/// The four actions in their fixed execution order
pub fn standard_actions() -> Vec<Box<dyn Action>> {
    vec![
        Box::new(SelfAudit),
        Box::new(CodeReview),
        Box::new(RefactorProposals),
        Box::new(GapAnalysis),
    ]
}
