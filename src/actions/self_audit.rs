//! Self-audit: summarize recent usage into an audit result

use super::{Action, ActionContext, ActionError, ActionOutcome};
use crate::llm::{parse_reply, AuditAnalysis, SelfAuditPrompt};
use crate::records::{Feature, NewAuditResult};
use async_trait::async_trait;

pub struct SelfAudit;

#[async_trait(?Send)]
impl Action for SelfAudit {
    fn feature(&self) -> Feature {
        Feature::SelfAudit
    }

    async fn run(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let until = ctx.started_at;
        let since = until - ctx.config.schedule.window();
        let snapshot = ctx
            .usage
            .snapshot(since, until)
            .map_err(ActionError::Usage)?;

        let reply = ctx.generate(&SelfAuditPrompt::generate(&snapshot)).await?;
        let analysis: AuditAnalysis = parse_reply(&reply).map_err(ActionError::Parse)?;

        let audit = NewAuditResult {
            audit_date: None,
            error_count: snapshot.error_count,
            avg_response_ms: snapshot.avg_response_ms,
            satisfaction_score: snapshot
                .satisfaction_score
                .or(analysis.satisfaction_score)
                .unwrap_or(0.0),
            issues_found: analysis.issues_found,
            recommendations: analysis.recommendations,
            log_file_size: snapshot.log_file_size,
            total_messages: snapshot.total_messages,
            total_sessions: snapshot.total_sessions,
        };

        let stored = ctx
            .db
            .insert_audit_result(&audit)
            .map_err(ActionError::Storage)?;

        Ok(ActionOutcome::new(
            1,
            format!(
                "audit {}: {} messages in {} sessions, {} errors, {} issues, {} recommendations",
                stored.audit_date,
                stored.total_messages,
                stored.total_sessions,
                stored.error_count,
                stored.issues_found.len(),
                stored.recommendations.len()
            ),
        ))
    }
}
