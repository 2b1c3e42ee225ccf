//! Persisted record types
//!
//! This module defines what the self-maintenance actions produce:
//! - Audit results (one per audit run, append-only)
//! - Code review suggestions and refactor proposals awaiting approval
//! - Capability gaps, upserted by operation name
//! - Action logs, the audit trail around every action invocation

mod lifecycle;

pub use lifecycle::{
    ActionStatus, GapStatus, Lifecycle, ParseEnumError, ProposalStatus, SuggestionStatus,
    TransitionError,
};

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use lifecycle::wire_enum;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Generate a new time-sortable record id
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Normalize an operation name for matching: trimmed, lowercase, single spaces
pub fn normalize_operation_name(name: &str) -> String {
    name.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The kinds of activity recorded in the action log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SelfAudit,
    CodeReview,
    Refactor,
    GapAnalysis,
    /// Administrative kill switch toggle
    KillSwitch,
}

wire_enum!(ActionKind, "action type", {
    SelfAudit => "self_audit",
    CodeReview => "code_review",
    Refactor => "refactor",
    GapAnalysis => "gap_analysis",
    KillSwitch => "kill_switch",
});

/// A feature that can be individually switched on or off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    SelfAudit,
    CodeReview,
    Refactor,
    GapAnalysis,
}

wire_enum!(Feature, "feature", {
    SelfAudit => "self_audit",
    CodeReview => "code_review",
    Refactor => "refactor",
    GapAnalysis => "gap_analysis",
});

impl Feature {
    /// Action kind logged when this feature runs
    pub fn action_kind(&self) -> ActionKind {
        match self {
            Feature::SelfAudit => ActionKind::SelfAudit,
            Feature::CodeReview => ActionKind::CodeReview,
            Feature::Refactor => ActionKind::Refactor,
            Feature::GapAnalysis => ActionKind::GapAnalysis,
        }
    }

    /// Parse the dashed CLI spelling as well as the stored one
    pub fn parse_flag(s: &str) -> Result<Self, ParseEnumError> {
        Feature::from_str(&s.replace('-', "_"))
    }
}

/// Severity of a code review finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

wire_enum!(Severity, "severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// Estimated impact of a refactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Medium,
    High,
}

wire_enum!(Impact, "impact", {
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// Priority of a capability gap
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

wire_enum!(Priority, "priority", {
    Low => "low",
    Medium => "medium",
    High => "high",
});

impl Priority {
    /// Priority implied by how often a manual workaround was observed
    pub fn from_manual_count(count: u32) -> Self {
        match count {
            c if c >= 5 => Priority::High,
            c if c >= 3 => Priority::Medium,
            _ => Priority::Low,
        }
    }
}

/// The kill switch and per-feature flags (singleton)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Global kill switch; nothing runs while this is false
    pub enabled: bool,
    pub self_audit: bool,
    pub code_review: bool,
    pub refactor: bool,
    pub gap_analysis: bool,
    pub last_modified_at: DateTime<Utc>,
    pub last_modified_by: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            self_audit: false,
            code_review: false,
            refactor: false,
            gap_analysis: false,
            last_modified_at: Utc::now(),
            last_modified_by: "system".to_string(),
        }
    }
}

impl Settings {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// A feature may run only if both the kill switch and its own flag are on
    pub fn is_feature_enabled(&self, feature: Feature) -> bool {
        self.enabled && self.feature_flag(feature)
    }

    /// The raw per-feature flag, ignoring the kill switch
    pub fn feature_flag(&self, feature: Feature) -> bool {
        match feature {
            Feature::SelfAudit => self.self_audit,
            Feature::CodeReview => self.code_review,
            Feature::Refactor => self.refactor,
            Feature::GapAnalysis => self.gap_analysis,
        }
    }

    pub fn set_feature_flag(&mut self, feature: Feature, value: bool) {
        match feature {
            Feature::SelfAudit => self.self_audit = value,
            Feature::CodeReview => self.code_review = value,
            Feature::Refactor => self.refactor = value,
            Feature::GapAnalysis => self.gap_analysis = value,
        }
    }
}

/// Outcome of one self-audit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    pub id: i64,
    pub audit_date: NaiveDate,
    pub error_count: u32,
    /// None when no response latency was measured
    pub avg_response_ms: Option<f64>,
    pub satisfaction_score: f64,
    pub issues_found: Vec<String>,
    pub recommendations: Vec<String>,
    pub log_file_size: u64,
    pub total_messages: u32,
    pub total_sessions: u32,
    pub created_at: DateTime<Utc>,
}

/// Fields of an audit result before it is stored
#[derive(Debug, Clone, Default)]
pub struct NewAuditResult {
    pub audit_date: Option<NaiveDate>,
    pub error_count: u32,
    pub avg_response_ms: Option<f64>,
    pub satisfaction_score: f64,
    pub issues_found: Vec<String>,
    pub recommendations: Vec<String>,
    pub log_file_size: u64,
    pub total_messages: u32,
    pub total_sessions: u32,
}

/// A single finding from the code review action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeReviewSuggestion {
    pub id: String,
    pub file_path: String,
    pub line_number: Option<u32>,
    pub issue_type: String,
    pub severity: Severity,
    pub description: String,
    pub suggested_fix: Option<String>,
    pub status: SuggestionStatus,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub user_feedback: Option<String>,
}

impl CodeReviewSuggestion {
    /// Create a pending suggestion
    pub fn new(file_path: &str, issue_type: &str, severity: Severity, description: &str) -> Self {
        Self {
            id: new_id(),
            file_path: file_path.to_string(),
            line_number: None,
            issue_type: issue_type.to_string(),
            severity,
            description: description.to_string(),
            suggested_fix: None,
            status: SuggestionStatus::Pending,
            created_at: Utc::now(),
            reviewed_at: None,
            resolved_at: None,
            user_feedback: None,
        }
    }

    pub fn with_line(mut self, line: Option<u32>) -> Self {
        self.line_number = line;
        self
    }

    pub fn with_suggested_fix(mut self, fix: Option<String>) -> Self {
        self.suggested_fix = fix;
        self
    }
}

/// A proposed refactor awaiting approval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefactorProposal {
    pub id: String,
    pub title: String,
    pub description: String,
    pub affected_files: Vec<String>,
    pub estimated_impact: Impact,
    pub estimated_time_minutes: u32,
    pub benefits: Option<String>,
    pub risks: Option<String>,
    pub rollback_plan: Option<String>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub user_feedback: Option<String>,
}

impl RefactorProposal {
    /// Create a proposal in the `proposed` state
    pub fn new(title: &str, description: &str, impact: Impact, minutes: u32) -> Self {
        Self {
            id: new_id(),
            title: title.to_string(),
            description: description.to_string(),
            affected_files: Vec::new(),
            estimated_impact: impact,
            estimated_time_minutes: minutes,
            benefits: None,
            risks: None,
            rollback_plan: None,
            status: ProposalStatus::Proposed,
            created_at: Utc::now(),
            approved_at: None,
            completed_at: None,
            user_feedback: None,
        }
    }
}

/// A recurring manual operation that could be automated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityGap {
    pub id: String,
    pub operation_name: String,
    pub operation_description: String,
    pub manual_count: u32,
    pub last_seen_at: DateTime<Utc>,
    pub automation_suggestion: Option<String>,
    pub estimated_time_saved_minutes: Option<u32>,
    pub priority: Priority,
    pub status: GapStatus,
    pub created_at: DateTime<Utc>,
}

/// One observation of a manual operation, input to the gap upsert
#[derive(Debug, Clone, PartialEq)]
pub struct GapObservation {
    pub operation_name: String,
    pub operation_description: String,
    pub seen_at: DateTime<Utc>,
}

/// Whether a gap upsert created a new row or bumped an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Incremented,
}

/// Audit trail entry for one action invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLog {
    pub id: String,
    pub action_type: ActionKind,
    pub action_status: ActionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
}

impl ActionLog {
    /// Create a log entry in the `started` state
    pub fn start(kind: ActionKind) -> Self {
        Self {
            id: new_id(),
            action_type: kind,
            action_status: ActionStatus::Started,
            // Stored with millisecond precision; usage windows start here
            started_at: Utc::now().trunc_subsecs(3),
            completed_at: None,
            duration_ms: None,
            result_summary: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.action_status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_operation_name() {
        assert_eq!(normalize_operation_name("  Restart   Bot\t"), "restart bot");
        assert_eq!(
            normalize_operation_name("restart bot"),
            normalize_operation_name("RESTART\nBOT")
        );
        assert_eq!(normalize_operation_name("   "), "");
    }

    #[test]
    fn test_feature_gating() {
        let mut settings = Settings::default();
        settings.self_audit = true;
        assert!(!settings.is_feature_enabled(Feature::SelfAudit));

        settings.enabled = true;
        assert!(settings.is_feature_enabled(Feature::SelfAudit));
        assert!(!settings.is_feature_enabled(Feature::Refactor));
    }

    #[test]
    fn test_feature_flag_spelling() {
        assert_eq!(Feature::parse_flag("gap-analysis").unwrap(), Feature::GapAnalysis);
        assert_eq!(Feature::parse_flag("code_review").unwrap(), Feature::CodeReview);
        assert!(Feature::parse_flag("kill-switch").is_err());
    }

    #[test]
    fn test_priority_from_count() {
        assert_eq!(Priority::from_manual_count(1), Priority::Low);
        assert_eq!(Priority::from_manual_count(3), Priority::Medium);
        assert_eq!(Priority::from_manual_count(9), Priority::High);
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let first = new_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_id();
        assert!(first < second);
    }
}
