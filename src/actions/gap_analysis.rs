//! Gap analysis: turn manual operations into capability gaps

use super::{Action, ActionContext, ActionError, ActionOutcome};
use crate::llm::{parse_reply, AutomationIdea, GapAutomationPrompt};
use crate::records::{
    normalize_operation_name, ActionKind, CapabilityGap, Feature, GapObservation, UpsertOutcome,
};
use crate::usage::ManualOperation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Operation name used for the error-triage gap
const ERROR_TRIAGE_OPERATION: &str = "triage recurring errors";

pub struct GapAnalysis;

#[async_trait(?Send)]
impl Action for GapAnalysis {
    fn feature(&self) -> Feature {
        Feature::GapAnalysis
    }

    async fn run(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let until = ctx.started_at;
        let since = window_start(ctx)?.min(until);
        let snapshot = ctx
            .usage
            .snapshot(since, until)
            .map_err(ActionError::Usage)?;

        let mut observations = dedupe(&snapshot.manual_operations);
        if let Some(triage) = error_triage_observation(ctx, since, until)? {
            observations.push(triage);
        }

        let mut created = 0;
        let mut incremented = 0;
        let mut notes = Vec::new();

        for observation in &observations {
            let (gap, outcome) = ctx
                .db
                .upsert_capability_gap(observation)
                .map_err(ActionError::Storage)?;

            match outcome {
                UpsertOutcome::Incremented => incremented += 1,
                UpsertOutcome::Created => {
                    created += 1;
                    if let Err(e) = suggest_automation(ctx, &gap).await {
                        tracing::warn!(
                            "No automation suggestion for {:?}: {}",
                            gap.operation_name,
                            e
                        );
                        notes.push(format!("{}: {}", gap.operation_name, e));
                    }
                }
            }
        }

        let mut summary = format!(
            "{} manual operations since {}: {} new gaps, {} recurring",
            observations.len(),
            since.format("%Y-%m-%d %H:%M"),
            created,
            incremented
        );
        if !notes.is_empty() {
            summary.push_str(&format!("; suggestion failed for {}", notes.join("; ")));
        }

        Ok(ActionOutcome::new(created + incremented, summary))
    }
}

/// Start of the analysis window: where the last completed gap analysis
/// ended, or the configured lookback when there is none
fn window_start(ctx: &ActionContext<'_>) -> Result<DateTime<Utc>, ActionError> {
    let last = ctx
        .db
        .last_completed_action(ActionKind::GapAnalysis)
        .map_err(ActionError::Storage)?;

    Ok(match last {
        Some(log) => log.started_at,
        None => ctx.started_at - ctx.config.schedule.window(),
    })
}

/// Collapse repeated observations of the same operation within one run
fn dedupe(operations: &[ManualOperation]) -> Vec<GapObservation> {
    let mut by_name: BTreeMap<String, GapObservation> = BTreeMap::new();

    for op in operations {
        let key = normalize_operation_name(&op.name);
        if key.is_empty() {
            continue;
        }

        by_name
            .entry(key)
            .and_modify(|existing| {
                existing.seen_at = existing.seen_at.max(op.seen_at);
                if existing.operation_description.is_empty() {
                    existing.operation_description = op.description.clone();
                }
            })
            .or_insert_with(|| GapObservation {
                operation_name: op.name.trim().to_string(),
                operation_description: op.description.clone(),
                seen_at: op.seen_at,
            });
    }

    by_name.into_values().collect()
}

fn error_triage_observation(
    ctx: &ActionContext<'_>,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Option<GapObservation>, ActionError> {
    let Some(audit) = ctx.db.latest_audit().map_err(ActionError::Storage)? else {
        return Ok(None);
    };

    let in_window = since <= audit.created_at && audit.created_at < until;
    if !in_window || audit.error_count <= ctx.config.schedule.error_gap_threshold {
        return Ok(None);
    }

    Ok(Some(GapObservation {
        operation_name: ERROR_TRIAGE_OPERATION.to_string(),
        operation_description: format!(
            "audit of {} recorded {} errors",
            audit.audit_date, audit.error_count
        ),
        seen_at: audit.created_at,
    }))
}

async fn suggest_automation(
    ctx: &ActionContext<'_>,
    gap: &CapabilityGap,
) -> Result<(), ActionError> {
    let reply = ctx.generate(&GapAutomationPrompt::generate(gap)).await?;
    let idea: AutomationIdea = parse_reply(&reply).map_err(ActionError::Parse)?;

    ctx.db
        .set_gap_automation(
            &gap.id,
            idea.automation_suggestion.trim(),
            idea.estimated_time_saved_minutes,
        )
        .map_err(ActionError::Storage)
}
