//! Chat command surface
//!
//! `handle` answers one `/meta <subcommand>` message with plain text. It
//! never fails: store errors and empty data become readable replies.

use crate::dashboard::{log_line, Dashboard, RECENT_LOGS};
use crate::orchestrator::set_kill_switch;
use crate::records::{AuditResult, GapStatus, RefactorProposal};
use crate::storage::Database;
use anyhow::Result;
use std::fmt::Write;

/// Valid subcommands, in help order
pub const SUBCOMMANDS: &[&str] = &["status", "audit", "proposal", "log", "gaps", "stop", "start"];

/// Gaps listed by `gaps`
const GAP_LIMIT: usize = 10;

/// Who chat toggles are attributed to
const CHAT_ACTOR: &str = "chat";

/// Answer one chat subcommand. An empty subcommand means `status`.
pub fn handle(db: &Database, input: &str) -> String {
    let sub = input.trim().to_lowercase();

    let reply = match sub.as_str() {
        "" | "status" => status(db),
        "audit" => audit(db),
        "proposal" => proposal(db),
        "log" => log(db),
        "gaps" => gaps(db),
        "stop" => toggle(db, false),
        "start" => toggle(db, true),
        _ => return unknown_subcommand(&sub),
    };

    reply.unwrap_or_else(|e| {
        tracing::warn!("Chat command {:?} failed: {:#}", sub, e);
        format!("Could not read self-maintenance data: {:#}", e)
    })
}

/// The fixed reply for anything not in [`SUBCOMMANDS`]
pub fn unknown_subcommand(sub: &str) -> String {
    format!(
        "Unknown subcommand '{}'. Valid subcommands: {}",
        sub,
        SUBCOMMANDS.join(", ")
    )
}

fn status(db: &Database) -> Result<String> {
    let dashboard = Dashboard::collect(db)?;
    let settings = &dashboard.settings;
    let flag = |on: bool| if on { "on" } else { "off" };

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Self-maintenance is {}.",
        if settings.enabled { "ENABLED" } else { "DISABLED" }
    );
    let _ = writeln!(
        out,
        "Features: self-audit {}, code-review {}, refactor {}, gap-analysis {}",
        flag(settings.self_audit),
        flag(settings.code_review),
        flag(settings.refactor),
        flag(settings.gap_analysis)
    );
    let _ = writeln!(
        out,
        "Pending: {} suggestions, {} proposals, {} gaps",
        dashboard.pending_suggestions, dashboard.proposed_refactors, dashboard.detected_gaps
    );
    match &dashboard.latest_audit {
        Some(audit) => {
            let _ = write!(
                out,
                "Latest audit: {}, {} errors, satisfaction {:.1}",
                audit.audit_date, audit.error_count, audit.satisfaction_score
            );
        }
        None => {
            let _ = write!(out, "Latest audit: none yet");
        }
    }
    Ok(out)
}

fn audit(db: &Database) -> Result<String> {
    Ok(match db.latest_audit()? {
        Some(audit) => render_audit(&audit),
        None => "No audit results found. Run self-audit first.".to_string(),
    })
}

fn render_audit(audit: &AuditResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Audit of {}", audit.audit_date);
    let _ = writeln!(
        out,
        "Messages: {} in {} sessions",
        audit.total_messages, audit.total_sessions
    );
    let _ = writeln!(out, "Errors: {}", audit.error_count);
    match audit.avg_response_ms {
        Some(ms) => {
            let _ = writeln!(out, "Average response: {:.0} ms", ms);
        }
        None => {
            let _ = writeln!(out, "Average response: not measured");
        }
    }
    let _ = writeln!(out, "Satisfaction: {:.1}", audit.satisfaction_score);
    let _ = write!(out, "Log size: {} bytes", audit.log_file_size);

    if !audit.issues_found.is_empty() {
        let _ = write!(out, "\n\nIssues:");
        for issue in &audit.issues_found {
            let _ = write!(out, "\n- {}", issue);
        }
    }
    if !audit.recommendations.is_empty() {
        let _ = write!(out, "\n\nRecommendations:");
        for rec in &audit.recommendations {
            let _ = write!(out, "\n- {}", rec);
        }
    }
    out
}

fn proposal(db: &Database) -> Result<String> {
    Ok(match db.latest_pending_proposal()? {
        Some(proposal) => render_proposal(&proposal),
        None => "No pending refactor proposals. Run refactor first.".to_string(),
    })
}

fn render_proposal(p: &RefactorProposal) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} [{}]", p.title, p.status);
    let _ = writeln!(out, "ID: {}", p.id);
    let _ = writeln!(
        out,
        "Impact: {}, about {} minutes",
        p.estimated_impact, p.estimated_time_minutes
    );
    let _ = write!(out, "{}", p.description);
    if !p.affected_files.is_empty() {
        let _ = write!(out, "\nFiles: {}", p.affected_files.join(", "));
    }
    for (label, value) in [
        ("Benefits", &p.benefits),
        ("Risks", &p.risks),
        ("Rollback", &p.rollback_plan),
    ] {
        if let Some(value) = value {
            let _ = write!(out, "\n{}: {}", label, value);
        }
    }
    out
}

fn log(db: &Database) -> Result<String> {
    let logs = db.recent_action_logs(RECENT_LOGS)?;
    if logs.is_empty() {
        return Ok("No self-maintenance activity recorded yet.".to_string());
    }
    Ok(logs.iter().map(log_line).collect::<Vec<_>>().join("\n"))
}

fn gaps(db: &Database) -> Result<String> {
    let gaps = db.list_gaps(GapStatus::Detected, GAP_LIMIT)?;
    if gaps.is_empty() {
        return Ok("No capability gaps detected. Run gap-analysis first.".to_string());
    }

    let lines: Vec<String> = gaps
        .iter()
        .map(|gap| {
            let mut line = format!(
                "[{}] {} (seen {} times)",
                gap.priority, gap.operation_name, gap.manual_count
            );
            if let Some(suggestion) = &gap.automation_suggestion {
                let _ = write!(line, " - {}", suggestion);
            }
            line
        })
        .collect();
    Ok(lines.join("\n"))
}

fn toggle(db: &Database, enabled: bool) -> Result<String> {
    set_kill_switch(db, enabled, CHAT_ACTOR)?;
    Ok(if enabled {
        "Self-maintenance enabled. Feature flags still apply.".to_string()
    } else {
        "Self-maintenance disabled. No actions will run until it is started again.".to_string()
    })
}
