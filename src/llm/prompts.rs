//! Prompt templates for LLM interactions

use crate::records::{AuditResult, CapabilityGap};
use crate::usage::UsageSnapshot;

/// Prompt for summarizing usage statistics into issues and recommendations
pub struct SelfAuditPrompt;

impl SelfAuditPrompt {
    /// Generate a prompt for the self-audit
    pub fn generate(snapshot: &UsageSnapshot) -> String {
        let mut prompt = String::new();

        prompt.push_str("You are performing a usage audit of an autonomous assistant.\n\n");

        prompt.push_str("## Usage Statistics\n\n");
        prompt.push_str(&format!(
            "**Window:** {} to {}\n",
            snapshot.window_start.to_rfc3339(),
            snapshot.window_end.to_rfc3339()
        ));
        prompt.push_str(&format!("**Messages:** {}\n", snapshot.total_messages));
        prompt.push_str(&format!("**Sessions:** {}\n", snapshot.total_sessions));
        prompt.push_str(&format!("**Errors:** {}\n", snapshot.error_count));
        match snapshot.avg_response_ms {
            Some(ms) => prompt.push_str(&format!("**Average response:** {:.0} ms\n", ms)),
            None => prompt.push_str("**Average response:** not measured\n"),
        }
        match snapshot.satisfaction_score {
            Some(score) => prompt.push_str(&format!("**Satisfaction:** {:.2} / 5\n", score)),
            None => prompt.push_str("**Satisfaction:** no feedback recorded\n"),
        }

        if !snapshot.recent_errors.is_empty() {
            prompt.push_str("\n### Recent Errors\n\n");
            for error in &snapshot.recent_errors {
                prompt.push_str(&format!("- {}\n", error));
            }
        }

        prompt.push('\n');
        prompt.push_str(AUDIT_INSTRUCTIONS);

        prompt
    }
}

/// Prompt for reviewing a single source file
pub struct CodeReviewPrompt;

impl CodeReviewPrompt {
    /// Generate a prompt for reviewing `path`
    pub fn generate(path: &str, content: &str) -> String {
        let mut prompt = String::new();

        prompt.push_str("You are doing a code review of one file of an assistant's own source.\n\n");
        prompt.push_str(&format!("**File:** `{}`\n\n", path));
        prompt.push_str("```\n");
        for (i, line) in content.lines().enumerate() {
            prompt.push_str(&format!("{:>5} | {}\n", i + 1, line));
        }
        prompt.push_str("```\n\n");
        prompt.push_str(REVIEW_INSTRUCTIONS);

        prompt
    }
}

/// A source file as presented to the refactor prompt
#[derive(Debug, Clone)]
pub struct FileSummary {
    pub path: String,
    pub lines: usize,
}

/// Prompt for proposing refactors
pub struct RefactorPrompt;

impl RefactorPrompt {
    /// Generate a prompt for refactor proposals
    pub fn generate(
        latest_audit: Option<&AuditResult>,
        files: &[FileSummary],
        open_findings: &[String],
    ) -> String {
        let mut prompt = String::new();

        prompt.push_str("You are proposing refactors for an assistant's own source tree.\n\n");

        if let Some(audit) = latest_audit {
            prompt.push_str("## Latest Audit\n\n");
            prompt.push_str(&format!("**Date:** {}\n", audit.audit_date));
            prompt.push_str(&format!("**Errors:** {}\n", audit.error_count));
            for issue in &audit.issues_found {
                prompt.push_str(&format!("- Issue: {}\n", issue));
            }
            for rec in &audit.recommendations {
                prompt.push_str(&format!("- Recommendation: {}\n", rec));
            }
            prompt.push('\n');
        }

        prompt.push_str("## Source Files\n\n");
        for file in files {
            prompt.push_str(&format!("- `{}` ({} lines)\n", file.path, file.lines));
        }

        if !open_findings.is_empty() {
            prompt.push_str("\n## Open Review Findings\n\n");
            for finding in open_findings {
                prompt.push_str(&format!("- {}\n", finding));
            }
        }

        prompt.push('\n');
        prompt.push_str(REFACTOR_INSTRUCTIONS);

        prompt
    }
}

/// Prompt for suggesting how to automate a manual operation
pub struct GapAutomationPrompt;

impl GapAutomationPrompt {
    /// Generate a prompt for one capability gap
    pub fn generate(gap: &CapabilityGap) -> String {
        let mut prompt = String::new();

        prompt.push_str("An operator keeps doing the following task by hand.\n\n");
        prompt.push_str(&format!("**Operation:** {}\n", gap.operation_name));
        if !gap.operation_description.is_empty() {
            prompt.push_str(&format!("**Details:** {}\n", gap.operation_description));
        }
        prompt.push_str(&format!("**Times observed:** {}\n\n", gap.manual_count));
        prompt.push_str(AUTOMATION_INSTRUCTIONS);

        prompt
    }
}

const AUDIT_INSTRUCTIONS: &str = r#"## Instructions

Respond with a JSON object:
{
  "issues_found": ["short description of each problem"],
  "recommendations": ["one concrete improvement per entry"],
  "satisfaction_score": 0.0
}

`satisfaction_score` is your 0-5 estimate and is only used when no feedback was recorded.
Respond ONLY with valid JSON, no other text.
"#;

const REVIEW_INSTRUCTIONS: &str = r#"## Instructions

List concrete problems in this file. Respond with a JSON array where each element is:
{
  "line_number": 12,
  "issue_type": "error_handling | performance | security | readability | bug",
  "severity": "low | medium | high | critical",
  "description": "what is wrong",
  "suggested_fix": "how to fix it, or null"
}

Return [] if the file has no problems worth reporting.
Respond ONLY with valid JSON, no other text.
"#;

const REFACTOR_INSTRUCTIONS: &str = r#"## Instructions

Propose at most three refactors. Respond with a JSON array where each element is:
{
  "title": "short title",
  "description": "what changes and why",
  "affected_files": ["path"],
  "estimated_impact": "low | medium | high",
  "estimated_time_minutes": 30,
  "benefits": "or null",
  "risks": "or null",
  "rollback_plan": "or null"
}

Respond ONLY with valid JSON, no other text.
"#;

const AUTOMATION_INSTRUCTIONS: &str = r#"## Instructions

Suggest how the assistant could do this automatically. Respond with a JSON object:
{
  "automation_suggestion": "the proposed automation",
  "estimated_time_saved_minutes": 10
}

Respond ONLY with valid JSON, no other text.
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_audit_prompt_mentions_unmeasured_latency() {
        let snapshot = UsageSnapshot {
            total_messages: 12,
            recent_errors: vec!["timeout talking to device".to_string()],
            ..UsageSnapshot::empty(Utc::now(), Utc::now())
        };
        let prompt = SelfAuditPrompt::generate(&snapshot);

        assert!(prompt.contains("**Messages:** 12"));
        assert!(prompt.contains("not measured"));
        assert!(prompt.contains("timeout talking to device"));
        assert!(prompt.contains("JSON"));
    }

    #[test]
    fn test_review_prompt_numbers_lines() {
        let prompt = CodeReviewPrompt::generate("src/a.rs", "fn a() {}\nfn b() {}");
        assert!(prompt.contains("`src/a.rs`"));
        assert!(prompt.contains("    2 | fn b() {}"));
    }
}
