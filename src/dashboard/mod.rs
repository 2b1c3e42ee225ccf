//! Read-only projection of the store for operators

use crate::records::{ActionLog, AuditResult, Settings};
use crate::storage::Database;
use anyhow::Result;
use serde::Serialize;
use std::fmt::Write;

/// Number of action logs shown
pub const RECENT_LOGS: usize = 5;

/// Configuration, pending work, the latest audit and recent activity
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub settings: Settings,
    pub pending_suggestions: usize,
    pub proposed_refactors: usize,
    pub detected_gaps: usize,
    pub latest_audit: Option<AuditResult>,
    pub recent_logs: Vec<ActionLog>,
}

impl Dashboard {
    /// Gather the projection. Works on an empty store.
    pub fn collect(db: &Database) -> Result<Self> {
        let settings = db.load_settings()?;
        let stats = db.get_stats()?;

        Ok(Self {
            settings,
            pending_suggestions: stats.pending_suggestions,
            proposed_refactors: stats.proposed_refactors,
            detected_gaps: stats.detected_gaps,
            latest_audit: db.latest_audit()?,
            recent_logs: db.recent_action_logs(RECENT_LOGS)?,
        })
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let flag = |on: bool| if on { "on" } else { "off" };

        let _ = writeln!(out, "Self-Maintenance Dashboard");
        let _ = writeln!(out, "==========================\n");

        let _ = writeln!(out, "Kill switch: {}", flag(self.settings.enabled));
        let _ = writeln!(
            out,
            "Features: self-audit {}, code-review {}, refactor {}, gap-analysis {}",
            flag(self.settings.self_audit),
            flag(self.settings.code_review),
            flag(self.settings.refactor),
            flag(self.settings.gap_analysis)
        );
        let _ = writeln!(
            out,
            "Last changed: {} by {}\n",
            self.settings.last_modified_at.format("%Y-%m-%d %H:%M UTC"),
            self.settings.last_modified_by
        );

        let _ = writeln!(out, "Pending suggestions: {}", self.pending_suggestions);
        let _ = writeln!(out, "Proposed refactors: {}", self.proposed_refactors);
        let _ = writeln!(out, "Detected gaps: {}\n", self.detected_gaps);

        match &self.latest_audit {
            Some(audit) => {
                let _ = writeln!(
                    out,
                    "Latest audit: {} ({} messages, {} errors, satisfaction {:.1})",
                    audit.audit_date,
                    audit.total_messages,
                    audit.error_count,
                    audit.satisfaction_score
                );
            }
            None => {
                let _ = writeln!(out, "Latest audit: none");
            }
        }

        if self.recent_logs.is_empty() {
            let _ = writeln!(out, "\nNo actions recorded yet.");
        } else {
            let _ = writeln!(out, "\nRecent actions:");
            for log in &self.recent_logs {
                let _ = writeln!(out, "  {}", log_line(log));
            }
        }

        out
    }
}

/// One-line rendering of an action log
pub fn log_line(log: &ActionLog) -> String {
    let mut line = format!(
        "{} {} [{}]",
        log.started_at.format("%Y-%m-%d %H:%M:%S"),
        log.action_type,
        log.action_status
    );
    if let Some(ms) = log.duration_ms {
        let _ = write!(line, " {} ms", ms);
    }
    if let Some(summary) = &log.result_summary {
        let _ = write!(line, " - {}", summary);
    }
    if let Some(error) = &log.error_message {
        let _ = write!(line, " - error: {}", error);
    }
    line
}
