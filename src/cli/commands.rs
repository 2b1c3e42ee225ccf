//! Command implementations

use crate::chat;
use crate::config::{default_config_path, AppConfig};
use crate::dashboard::{log_line, Dashboard};
use crate::llm::LlmClient;
use crate::orchestrator::{self, Orchestrator, RunOptions, RunReport};
use crate::records::{Feature, GapStatus, ProposalStatus, Settings, SuggestionStatus};
use crate::storage::Database;
use crate::usage::{JsonlUsageLog, StaticUsage, UsageSnapshot, UsageSource};
use super::ReviewTarget;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Who CLI toggles are attributed to
const CLI_ACTOR: &str = "cli";

/// Resolve the config path and load it, falling back to defaults
pub fn load_config(path: Option<&Path>) -> Result<(AppConfig, PathBuf)> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    let config = AppConfig::load_or_default(&path)?;
    Ok((config, path))
}

/// Open the database named by the override or the config
pub fn open_database(config: &AppConfig, db_override: Option<&Path>) -> Result<Database> {
    let path = config.resolve_database_path(db_override);
    tracing::debug!("Opening database {:?}", path);
    Database::open(&path)
}

/// Write a default config file and create the database
pub fn init(config_path: &Path, db_override: Option<&Path>, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {:?}. Use --force to overwrite.",
            config_path
        );
    }

    let config = AppConfig::default();
    config.save(config_path)?;

    let db = open_database(&config, db_override)?;
    let settings = db.load_settings()?;

    println!("✓ Initialized metaloop");
    println!("  Config: {:?}", config_path);
    println!("  Database: {:?}", config.resolve_database_path(db_override));
    println!(
        "  Kill switch: {}",
        if settings.enabled { "on" } else { "off" }
    );

    Ok(())
}

/// Run the requested actions against the configured generator and usage log
pub async fn run(db: &Database, config: &AppConfig, options: RunOptions) -> Result<RunReport> {
    if options.is_empty() {
        anyhow::bail!("No action requested. Pass --all or at least one action flag.");
    }

    let llm = LlmClient::new(config.llm.client_config(config.schedule.call_timeout()))
        .context("Failed to create LLM client")?;

    let usage: Box<dyn UsageSource> = match &config.usage_log {
        Some(path) => Box::new(JsonlUsageLog::new(path)),
        None => {
            tracing::debug!("No usage log configured; usage signals are empty");
            Box::new(StaticUsage::new(UsageSnapshot::empty(Utc::now(), Utc::now())))
        }
    };

    Orchestrator::new(db, &llm, usage.as_ref(), config)
        .run(options)
        .await
}

/// Print a run report in JSON format
pub fn print_report_json(report: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    println!("{}", json);
    Ok(())
}

/// Print a run report in text format
pub fn print_report_text(report: &RunReport) {
    println!("{}", report.notice());

    for log in &report.logs {
        let icon = if log.action_status == crate::records::ActionStatus::Completed {
            "✓"
        } else {
            "✗"
        };
        println!("  {} {}", icon, log_line(log));
    }

    for kind in &report.skipped_by_policy {
        println!("  - {} skipped (feature disabled)", kind);
    }
}

/// Print the dashboard in JSON format
pub fn print_dashboard_json(dashboard: &Dashboard) -> Result<()> {
    let json = serde_json::to_string_pretty(dashboard)?;
    println!("{}", json);
    Ok(())
}

/// Print the dashboard in text format
pub fn print_dashboard_text(dashboard: &Dashboard) {
    print!("{}", dashboard.render_text());
}

/// Answer a chat subcommand
pub fn meta(db: &Database, subcommand: &str) -> String {
    chat::handle(db, subcommand)
}

/// Turn the kill switch on or off
pub fn kill_switch(db: &Database, enabled: bool) -> Result<Settings> {
    orchestrator::set_kill_switch(db, enabled, CLI_ACTOR)
}

/// Turn one feature on or off
pub fn feature(db: &Database, name: &str, enabled: bool) -> Result<Settings> {
    let feature = Feature::parse_flag(name)?;
    orchestrator::set_feature(db, feature, enabled, CLI_ACTOR)
}

/// Print settings in text format
pub fn print_settings_text(settings: &Settings) {
    let flag = |on: bool| if on { "on" } else { "off" };
    println!("Kill switch: {}", flag(settings.enabled));
    for feature in Feature::ALL {
        println!("  {}: {}", feature, flag(settings.feature_flag(*feature)));
    }
}

/// Apply an approval decision and describe the result
pub fn review(
    db: &Database,
    target: ReviewTarget,
    id: &str,
    status: &str,
    feedback: Option<&str>,
) -> Result<String> {
    let line = match target {
        ReviewTarget::Suggestion => {
            let to: SuggestionStatus = status.parse()?;
            let s = db.update_suggestion_status(id, to, feedback)?;
            format!("✓ Suggestion {} is now {}", s.id, s.status)
        }
        ReviewTarget::Proposal => {
            let to: ProposalStatus = status.parse()?;
            let p = db.update_proposal_status(id, to, feedback)?;
            format!("✓ Proposal {} is now {}", p.id, p.status)
        }
        ReviewTarget::Gap => {
            if feedback.is_some() {
                tracing::warn!("Feedback is not stored for capability gaps");
            }
            let to: GapStatus = status.parse()?;
            let g = db.update_gap_status(id, to)?;
            format!("✓ Gap {} is now {}", g.id, g.status)
        }
    };
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{CodeReviewSuggestion, Severity};

    #[test]
    fn test_review_applies_valid_transition() {
        let db = Database::open_in_memory().unwrap();
        let suggestion = CodeReviewSuggestion::new("a.rs", "bug", Severity::Low, "x");
        db.insert_suggestion(&suggestion).unwrap();

        let line = review(
            &db,
            ReviewTarget::Suggestion,
            &suggestion.id,
            "approved",
            Some("good catch"),
        )
        .unwrap();
        assert!(line.ends_with("is now approved"));

        let stored = db.get_suggestion(&suggestion.id).unwrap().unwrap();
        assert_eq!(stored.user_feedback.as_deref(), Some("good catch"));
    }

    #[test]
    fn test_review_rejects_invalid_transition() {
        let db = Database::open_in_memory().unwrap();
        let suggestion = CodeReviewSuggestion::new("a.rs", "bug", Severity::Low, "x");
        db.insert_suggestion(&suggestion).unwrap();

        assert!(review(&db, ReviewTarget::Suggestion, &suggestion.id, "applied", None).is_err());
        assert!(review(&db, ReviewTarget::Suggestion, &suggestion.id, "bogus", None).is_err());
    }

    #[test]
    fn test_feature_accepts_dashed_names() {
        let db = Database::open_in_memory().unwrap();
        let settings = feature(&db, "gap-analysis", true).unwrap();
        assert!(settings.gap_analysis);
        assert!(feature(&db, "telepathy", true).is_err());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let db_path = dir.path().join("metaloop.db");

        init(&config_path, Some(db_path.as_path()), false).unwrap();
        assert!(config_path.exists());
        assert!(db_path.exists());
        assert!(init(&config_path, Some(db_path.as_path()), false).is_err());
        init(&config_path, Some(db_path.as_path()), true).unwrap();
    }
}
