//! Text-generation collaborator
//!
//! This module handles:
//! - The `TextGenerator` seam and its HTTP and mock implementations
//! - Prompt generation for each self-maintenance action
//! - Parsing structured JSON out of model replies

mod client;
mod prompts;

pub use client::{Backend, LlmClient, LlmConfig, LlmResponse, MockLlmClient, TextGenerator};
pub use prompts::{
    CodeReviewPrompt, FileSummary, GapAutomationPrompt, RefactorPrompt, SelfAuditPrompt,
};

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Issues and recommendations produced by the self-audit prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditAnalysis {
    #[serde(default)]
    pub issues_found: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub satisfaction_score: Option<f64>,
}

/// One finding from the code review prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFinding {
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default = "default_issue_type")]
    pub issue_type: String,
    #[serde(default)]
    pub severity: String,
    pub description: String,
    #[serde(default)]
    pub suggested_fix: Option<String>,
}

fn default_issue_type() -> String {
    "general".to_string()
}

/// One proposal from the refactor prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalDraft {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub estimated_impact: String,
    #[serde(default)]
    pub estimated_time_minutes: u32,
    #[serde(default)]
    pub benefits: Option<String>,
    #[serde(default)]
    pub risks: Option<String>,
    #[serde(default)]
    pub rollback_plan: Option<String>,
}

/// Automation idea for a capability gap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationIdea {
    pub automation_suggestion: String,
    #[serde(default)]
    pub estimated_time_saved_minutes: Option<u32>,
}

/// Cut the JSON payload out of a model reply.
///
/// Models often wrap JSON in markdown fences or add a sentence before it;
/// this returns the span from the first `{` or `[` to the matching last
/// closing bracket.
pub fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();

    let start = trimmed.find(['{', '[']);
    let Some(start) = start else {
        return trimmed;
    };

    let close = if trimmed[start..].starts_with('{') { '}' } else { ']' };
    match trimmed.rfind(close) {
        Some(end) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

/// Parse a structured reply
pub fn parse_reply<T: DeserializeOwned>(content: &str) -> Result<T> {
    serde_json::from_str(extract_json(content))
        .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"issues_found\": [\"slow\"]}\n```\n";
        assert_eq!(extract_json(reply), "{\"issues_found\": [\"slow\"]}");

        let array = "```\n[{\"description\": \"x\"}]\n```";
        assert_eq!(extract_json(array), "[{\"description\": \"x\"}]");
    }

    #[test]
    fn test_parse_audit_analysis() {
        let analysis: AuditAnalysis =
            parse_reply(r#"{"issues_found": ["a"], "recommendations": []}"#).unwrap();
        assert_eq!(analysis.issues_found, vec!["a"]);
        assert!(analysis.satisfaction_score.is_none());
    }

    #[test]
    fn test_parse_rejects_prose() {
        let result: Result<AuditAnalysis> = parse_reply("I could not analyze this.");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse LLM response"));
    }

    #[test]
    fn test_review_finding_defaults() {
        let findings: Vec<ReviewFinding> =
            parse_reply(r#"[{"description": "unchecked index"}]"#).unwrap();
        assert_eq!(findings[0].issue_type, "general");
        assert!(findings[0].line_number.is_none());
    }
}
