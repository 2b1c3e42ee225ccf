//! Run orchestration
//!
//! A run loads the settings, takes the run lock and executes the requested
//! and enabled actions one after another in a fixed order. Every executed
//! action is bracketed by an action log that always reaches a terminal
//! state, whatever the action does.

use crate::actions::{standard_actions, Action, ActionContext, ActionError};
use crate::config::AppConfig;
use crate::llm::TextGenerator;
use crate::records::{new_id, ActionKind, ActionLog, ActionStatus, Feature, Settings};
use crate::storage::Database;
use crate::usage::UsageSource;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Longest error message stored in an action log
pub const MAX_ERROR_CHARS: usize = 1000;

/// Which actions a run is asked to execute
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub self_audit: bool,
    pub code_review: bool,
    pub refactor: bool,
    pub gap_analysis: bool,
}

impl RunOptions {
    pub fn all() -> Self {
        Self {
            self_audit: true,
            code_review: true,
            refactor: true,
            gap_analysis: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.self_audit || self.code_review || self.refactor || self.gap_analysis)
    }

    pub fn requests(&self, feature: Feature) -> bool {
        match feature {
            Feature::SelfAudit => self.self_audit,
            Feature::CodeReview => self.code_review,
            Feature::Refactor => self.refactor,
            Feature::GapAnalysis => self.gap_analysis,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The kill switch was off; nothing was written
    KillSwitchOff,
    /// Another run holds the lock; nothing was written
    AlreadyRunning,
    Executed,
}

/// Result of one orchestrator run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Terminal log of every executed action, in execution order
    pub logs: Vec<ActionLog>,
    /// Requested actions whose feature flag was off
    pub skipped_by_policy: Vec<ActionKind>,
}

impl RunReport {
    fn empty(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            logs: Vec::new(),
            skipped_by_policy: Vec::new(),
        }
    }

    /// True when no executed action failed
    pub fn succeeded(&self) -> bool {
        self.logs
            .iter()
            .all(|log| log.action_status != ActionStatus::Failed)
    }

    /// One line for the scheduler's output
    pub fn notice(&self) -> String {
        match self.outcome {
            RunOutcome::KillSwitchOff => {
                "Self-maintenance is disabled (kill switch off); nothing to do.".to_string()
            }
            RunOutcome::AlreadyRunning => {
                "Another run is in progress; skipping this one.".to_string()
            }
            RunOutcome::Executed if self.logs.is_empty() => {
                "No requested action is enabled.".to_string()
            }
            RunOutcome::Executed => {
                let failed = self
                    .logs
                    .iter()
                    .filter(|log| log.action_status == ActionStatus::Failed)
                    .count();
                format!("Ran {} actions, {} failed.", self.logs.len(), failed)
            }
        }
    }
}

/// Runs actions against the store under the kill switch and feature flags
pub struct Orchestrator<'a> {
    db: &'a Database,
    generator: &'a dyn TextGenerator,
    usage: &'a dyn UsageSource,
    config: &'a AppConfig,
    action_timeout: Duration,
    call_timeout: Duration,
    holder: String,
}

impl<'a> Orchestrator<'a> {
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
            action_timeout: config.schedule.action_timeout(),
            call_timeout: config.schedule.call_timeout(),
            holder: new_id(),
        }
    }

    /// Bound for one whole action
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Bound for one generator call inside an action
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Execute one run.
    ///
    /// Errors are reserved for the store failing outside an action; action
    /// failures are recorded in their logs and reported through
    /// [`RunReport::succeeded`].
    pub async fn run(&self, options: RunOptions) -> Result<RunReport> {
        let settings = self.db.load_settings()?;
        if !settings.is_enabled() {
            tracing::info!("Kill switch is off; skipping run");
            return Ok(RunReport::empty(RunOutcome::KillSwitchOff));
        }

        let stale_before =
            Utc::now() - chrono::Duration::seconds(self.config.schedule.lock_stale_secs as i64);
        if !self.db.try_acquire_run_lock(&self.holder, stale_before)? {
            tracing::warn!("Run lock is held by another run");
            return Ok(RunReport::empty(RunOutcome::AlreadyRunning));
        }

        let result = self.run_locked(&settings, options, stale_before).await;

        if let Err(e) = self.db.release_run_lock(&self.holder) {
            tracing::warn!("Failed to release run lock: {:#}", e);
        }

        result
    }

    async fn run_locked(
        &self,
        settings: &Settings,
        options: RunOptions,
        stale_before: chrono::DateTime<Utc>,
    ) -> Result<RunReport> {
        let cancelled = self.db.cancel_stale_action_logs(stale_before)?;
        if cancelled > 0 {
            tracing::warn!("Cancelled {} interrupted action logs", cancelled);
        }

        let mut report = RunReport::empty(RunOutcome::Executed);

        for action in standard_actions() {
            let feature = action.feature();
            if !options.requests(feature) {
                continue;
            }
            if !settings.is_feature_enabled(feature) {
                tracing::info!("Skipping {}: feature disabled", feature);
                report.skipped_by_policy.push(action.kind());
                continue;
            }

            let log = self.execute(action.as_ref()).await?;
            report.logs.push(log);
        }

        Ok(report)
    }

    /// Run one action inside its log bracket
    async fn execute(&self, action: &dyn Action) -> Result<ActionLog> {
        let kind = action.kind();
        let log = ActionLog::start(kind);
        self.db
            .insert_action_log(&log)
            .with_context(|| format!("Failed to open action log for {}", kind))?;

        let mut ctx = ActionContext::new(self.db, self.generator, self.usage, self.config);
        ctx.call_timeout = self.call_timeout;
        ctx.started_at = log.started_at;

        tracing::info!("Starting {}", kind);
        let started = Instant::now();

        let result = match tokio::time::timeout(self.action_timeout, action.run(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Timeout(self.action_timeout)),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let finished = match result {
            Ok(outcome) => {
                tracing::info!(
                    "{} completed in {} ms: {}",
                    kind,
                    duration_ms,
                    outcome.summary
                );
                self.db.finish_action_log(
                    &log.id,
                    ActionStatus::Completed,
                    duration_ms,
                    Some(outcome.summary.as_str()),
                    None,
                )?
            }
            Err(e) => {
                let message = truncate_chars(&e.to_string(), MAX_ERROR_CHARS);
                tracing::warn!("{} failed after {} ms: {}", kind, duration_ms, message);
                self.db.finish_action_log(
                    &log.id,
                    ActionStatus::Failed,
                    duration_ms,
                    None,
                    Some(message.as_str()),
                )?
            }
        };

        Ok(finished)
    }
}

/// Flip the kill switch, leaving a `kill_switch` entry in the action log
pub fn set_kill_switch(db: &Database, enabled: bool, by: &str) -> Result<Settings> {
    let log = ActionLog::start(ActionKind::KillSwitch);
    db.insert_action_log(&log)?;
    let started = Instant::now();

    let result = db.load_settings().and_then(|mut settings| {
        settings.enabled = enabled;
        settings.last_modified_at = Utc::now();
        settings.last_modified_by = by.to_string();
        db.save_settings(&settings)?;
        Ok(settings)
    });
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(settings) => {
            let state = if enabled { "on" } else { "off" };
            tracing::info!("Kill switch turned {} by {}", state, by);
            db.finish_action_log(
                &log.id,
                ActionStatus::Completed,
                duration_ms,
                Some(format!("kill switch {} by {}", state, by).as_str()),
                None,
            )?;
            Ok(settings)
        }
        Err(e) => {
            let message = truncate_chars(&format!("{:#}", e), MAX_ERROR_CHARS);
            db.finish_action_log(
                &log.id,
                ActionStatus::Failed,
                duration_ms,
                None,
                Some(message.as_str()),
            )?;
            Err(e)
        }
    }
}

/// Flip one feature flag
pub fn set_feature(db: &Database, feature: Feature, enabled: bool, by: &str) -> Result<Settings> {
    let mut settings = db.load_settings()?;
    settings.set_feature_flag(feature, enabled);
    settings.last_modified_at = Utc::now();
    settings.last_modified_by = by.to_string();
    db.save_settings(&settings)?;

    tracing::info!(
        "Feature {} turned {} by {}",
        feature,
        if enabled { "on" } else { "off" },
        by
    );
    Ok(settings)
}

/// Cut `s` to at most `max` characters
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::fixture::Fixture;
    use crate::records::{GapStatus, SuggestionStatus};
    use crate::usage::{JsonlUsageLog, ManualOperation, UsageSnapshot};

    const AUDIT_REPLY: &str = r#"{"issues_found": [], "recommendations": ["keep going"]}"#;

    fn enable(fixture: &Fixture, features: &[Feature]) {
        let mut settings = Settings {
            enabled: true,
            ..Settings::default()
        };
        for feature in features {
            settings.set_feature_flag(*feature, true);
        }
        fixture.db.save_settings(&settings).unwrap();
    }

    fn orchestrator(fixture: &Fixture) -> Orchestrator<'_> {
        Orchestrator::new(&fixture.db, &fixture.llm, &fixture.usage, &fixture.config)
    }

    #[tokio::test]
    async fn test_kill_switch_off_writes_nothing() {
        let mut fixture = Fixture::new();
        fixture.write_source("src/a.rs", "fn a() {}");
        fixture.llm.add_response("usage audit", AUDIT_REPLY);
        let mut settings = Settings::default();
        for feature in Feature::ALL {
            settings.set_feature_flag(*feature, true);
        }
        fixture.db.save_settings(&settings).unwrap();

        let report = orchestrator(&fixture).run(RunOptions::all()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::KillSwitchOff);
        assert!(report.logs.is_empty());
        assert!(fixture.llm.prompts().is_empty());

        let stats = fixture.db.get_stats().unwrap();
        assert_eq!(stats.action_logs, 0);
        assert_eq!(stats.audit_results, 0);
        assert_eq!(stats.pending_suggestions, 0);
    }

    #[tokio::test]
    async fn test_disabled_feature_is_skipped_without_log() {
        let mut fixture = Fixture::new();
        fixture.write_source("src/a.rs", "fn a() {}");
        fixture.llm.add_response("usage audit", AUDIT_REPLY);
        enable(&fixture, &[Feature::SelfAudit]);

        let options = RunOptions {
            self_audit: true,
            code_review: true,
            ..RunOptions::default()
        };
        let report = orchestrator(&fixture).run(options).await.unwrap();

        assert_eq!(report.logs.len(), 1);
        assert_eq!(report.logs[0].action_type, ActionKind::SelfAudit);
        assert_eq!(report.logs[0].action_status, ActionStatus::Completed);
        assert_eq!(report.skipped_by_policy, vec![ActionKind::CodeReview]);

        let stats = fixture.db.get_stats().unwrap();
        assert_eq!(stats.action_logs, 1);
        assert_eq!(stats.audit_results, 1);
        assert_eq!(stats.pending_suggestions, 0);
    }

    #[tokio::test]
    async fn test_only_disabled_feature_requested_writes_nothing() {
        let fixture = Fixture::new();
        enable(&fixture, &[Feature::SelfAudit]);

        let options = RunOptions {
            gap_analysis: true,
            ..RunOptions::default()
        };
        let report = orchestrator(&fixture).run(options).await.unwrap();
        assert!(report.logs.is_empty());
        assert_eq!(fixture.db.get_stats().unwrap().action_logs, 0);
    }

    #[tokio::test]
    async fn test_actions_run_in_fixed_order() {
        let mut fixture = Fixture::new();
        fixture.write_source("src/a.rs", "fn a() {}");
        fixture.llm.add_response("usage audit", AUDIT_REPLY);
        enable(&fixture, Feature::ALL);

        let options = RunOptions {
            gap_analysis: true,
            self_audit: true,
            refactor: true,
            code_review: true,
        };
        let report = orchestrator(&fixture).run(options).await.unwrap();

        let kinds: Vec<_> = report.logs.iter().map(|l| l.action_type).collect();
        assert_eq!(
            kinds,
            vec![
                ActionKind::SelfAudit,
                ActionKind::CodeReview,
                ActionKind::Refactor,
                ActionKind::GapAnalysis
            ]
        );
        assert!(report.succeeded());
        assert!(report.logs.iter().all(|l| l.is_terminal()));
        assert!(report.logs.iter().all(|l| l.completed_at.is_some()));
    }

    #[tokio::test]
    async fn test_failing_generator_fails_only_that_action() {
        let mut fixture = Fixture::with_usage(UsageSnapshot {
            manual_operations: vec![ManualOperation {
                name: "restart bot".to_string(),
                description: String::new(),
                seen_at: Utc::now(),
            }],
            ..UsageSnapshot::empty(Utc::now(), Utc::now())
        });
        fixture
            .llm
            .add_failure("usage audit", "backend exploded", Duration::from_millis(200));
        enable(&fixture, &[Feature::SelfAudit, Feature::GapAnalysis]);

        let report = orchestrator(&fixture).run(RunOptions::all()).await.unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.logs.len(), 2);

        let audit_log = &report.logs[0];
        assert_eq!(audit_log.action_status, ActionStatus::Failed);
        let duration = audit_log.duration_ms.unwrap();
        assert!(duration >= 200, "duration {} too short", duration);
        assert!(duration < 1000, "duration {} too long", duration);
        assert!(audit_log
            .error_message
            .as_deref()
            .unwrap()
            .contains("backend exploded"));
        assert!(fixture.db.latest_audit().unwrap().is_none());

        assert_eq!(report.logs[1].action_status, ActionStatus::Completed);
        assert_eq!(
            fixture.db.list_gaps(GapStatus::Detected, 10).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_partial_code_review_completes() {
        let mut fixture = Fixture::new();
        for name in ["a", "b", "c"] {
            fixture.write_source(&format!("src/{}.rs", name), "fn x() {}");
        }
        let finding = r#"[{"severity": "low", "description": "naming"}]"#;
        fixture.llm.add_response("`src/a.rs`", finding);
        fixture.llm.add_response("`src/b.rs`", finding);
        fixture
            .llm
            .add_delayed_response("`src/c.rs`", finding, Duration::from_millis(500));
        enable(&fixture, &[Feature::CodeReview]);

        let report = orchestrator(&fixture)
            .with_call_timeout(Duration::from_millis(100))
            .run(RunOptions::all())
            .await
            .unwrap();

        let log = &report.logs[0];
        assert_eq!(log.action_status, ActionStatus::Completed);
        assert!(log.result_summary.as_deref().unwrap().contains("timed out"));
        assert_eq!(
            fixture
                .db
                .list_suggestions(SuggestionStatus::Pending, 10)
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_action_timeout_is_a_failure() {
        let mut fixture = Fixture::new();
        fixture
            .llm
            .add_delayed_response("usage audit", AUDIT_REPLY, Duration::from_millis(500));
        enable(&fixture, &[Feature::SelfAudit]);

        let report = orchestrator(&fixture)
            .with_action_timeout(Duration::from_millis(100))
            .run(RunOptions::all())
            .await
            .unwrap();

        let log = &report.logs[0];
        assert_eq!(log.action_status, ActionStatus::Failed);
        assert!(log.error_message.as_deref().unwrap().starts_with("timed out"));
        assert!(fixture.db.latest_audit().unwrap().is_none());
    }

    fn append_manual(path: &std::path::Path, operation: &str, ts: chrono::DateTime<Utc>) {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        writeln!(
            file,
            r#"{{"ts":"{}","type":"manual","operation":"{}"}}"#,
            ts.to_rfc3339(),
            operation
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_gap_upsert_across_runs() {
        let fixture = Fixture::new();
        enable(&fixture, &[Feature::GapAnalysis]);
        let path = fixture.config.project_root.join("usage.jsonl");
        let usage = JsonlUsageLog::new(&path);
        let options = RunOptions {
            gap_analysis: true,
            ..RunOptions::default()
        };
        let run = || Orchestrator::new(&fixture.db, &fixture.llm, &usage, &fixture.config);

        append_manual(&path, "Clear Cache", Utc::now() - chrono::Duration::minutes(1));
        append_manual(&path, "rotate logs", Utc::now() + chrono::Duration::hours(1));
        run().run(options).await.unwrap();

        append_manual(&path, "clear cache", Utc::now());
        tokio::time::sleep(Duration::from_millis(5)).await;
        run().run(options).await.unwrap();

        // No new observations: every event has already been counted once
        tokio::time::sleep(Duration::from_millis(5)).await;
        run().run(options).await.unwrap();

        let gaps = fixture.db.list_gaps(GapStatus::Detected, 10).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].operation_name, "Clear Cache");
        assert_eq!(gaps[0].manual_count, 2);
        assert!(fixture.db.find_gap_by_name("rotate logs").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_failure_fails_only_that_action() {
        let mut fixture = Fixture::new();
        fixture.write_source("src/a.rs", "fn a() {}");
        fixture.llm.add_response("usage audit", AUDIT_REPLY);
        enable(&fixture, &[Feature::SelfAudit, Feature::CodeReview]);
        fixture.db.drop_table("audit_results").unwrap();

        let report = orchestrator(&fixture).run(RunOptions::all()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Executed);
        assert_eq!(report.logs.len(), 2);

        let audit_log = &report.logs[0];
        assert_eq!(audit_log.action_type, ActionKind::SelfAudit);
        assert_eq!(audit_log.action_status, ActionStatus::Failed);
        assert!(audit_log
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("storage error:"));

        let review_log = &report.logs[1];
        assert_eq!(review_log.action_type, ActionKind::CodeReview);
        assert_eq!(review_log.action_status, ActionStatus::Completed);
        assert!(!report.succeeded());
    }

    #[tokio::test]
    async fn test_held_lock_skips_run() {
        let fixture = Fixture::new();
        enable(&fixture, Feature::ALL);
        assert!(fixture
            .db
            .try_acquire_run_lock("other", Utc::now() - chrono::Duration::hours(1))
            .unwrap());

        let report = orchestrator(&fixture).run(RunOptions::all()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::AlreadyRunning);
        assert_eq!(fixture.db.get_stats().unwrap().action_logs, 0);
    }

    #[tokio::test]
    async fn test_lock_released_after_run() {
        let mut fixture = Fixture::new();
        fixture.llm.add_response("usage audit", AUDIT_REPLY);
        enable(&fixture, &[Feature::SelfAudit]);

        let first = orchestrator(&fixture).run(RunOptions::all()).await.unwrap();
        let second = orchestrator(&fixture).run(RunOptions::all()).await.unwrap();
        assert_eq!(first.outcome, RunOutcome::Executed);
        assert_eq!(second.outcome, RunOutcome::Executed);
    }

    #[tokio::test]
    async fn test_interrupted_logs_are_cancelled() {
        let fixture = Fixture::new();
        enable(&fixture, &[]);
        let mut orphan = ActionLog::start(ActionKind::CodeReview);
        orphan.started_at = Utc::now() - chrono::Duration::hours(3);
        fixture.db.insert_action_log(&orphan).unwrap();

        orchestrator(&fixture).run(RunOptions::all()).await.unwrap();

        let log = fixture.db.get_action_log(&orphan.id).unwrap().unwrap();
        assert_eq!(log.action_status, ActionStatus::Cancelled);
        assert!(log.completed_at.is_some());
    }

    #[test]
    fn test_kill_switch_toggle_is_logged() {
        let db = Database::open_in_memory().unwrap();

        let settings = set_kill_switch(&db, true, "operator").unwrap();
        assert!(settings.enabled);
        assert!(db.load_settings().unwrap().enabled);

        let logs = db.recent_action_logs(5).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action_type, ActionKind::KillSwitch);
        assert_eq!(logs[0].action_status, ActionStatus::Completed);
        assert_eq!(
            logs[0].result_summary.as_deref(),
            Some("kill switch on by operator")
        );
    }

    #[test]
    fn test_feature_toggle_keeps_kill_switch() {
        let db = Database::open_in_memory().unwrap();
        let settings = set_feature(&db, Feature::Refactor, true, "operator").unwrap();
        assert!(settings.refactor);
        assert!(!settings.is_feature_enabled(Feature::Refactor));
        assert_eq!(db.get_stats().unwrap().action_logs, 0);
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars(&"x".repeat(1500), MAX_ERROR_CHARS).len(), 1000);
    }
}
