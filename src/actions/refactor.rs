//! Refactor proposals drawn from the source tree, the latest audit and
//! open review findings

use super::{collect_source_files, Action, ActionContext, ActionError, ActionOutcome};
use crate::llm::{parse_reply, FileSummary, ProposalDraft, RefactorPrompt};
use crate::records::{Feature, Impact, ParseEnumError, RefactorProposal, SuggestionStatus};
use async_trait::async_trait;

/// Upper bound on proposals stored per run
const MAX_PROPOSALS: usize = 5;

/// Open findings included in the prompt
const MAX_OPEN_FINDINGS: usize = 20;

pub struct RefactorProposals;

#[async_trait(?Send)]
impl Action for RefactorProposals {
    fn feature(&self) -> Feature {
        Feature::Refactor
    }

    async fn run(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let files: Vec<FileSummary> = collect_source_files(ctx.config)
            .into_iter()
            .filter_map(|file| match std::fs::read_to_string(&file.absolute) {
                Ok(content) => Some(FileSummary {
                    path: file.relative,
                    lines: content.lines().count(),
                }),
                Err(e) => {
                    tracing::debug!("Skipping unreadable {}: {}", file.relative, e);
                    None
                }
            })
            .collect();

        let latest_audit = ctx.db.latest_audit().map_err(ActionError::Storage)?;
        let open_findings: Vec<String> = ctx
            .db
            .list_suggestions(SuggestionStatus::Pending, MAX_OPEN_FINDINGS)
            .map_err(ActionError::Storage)?
            .into_iter()
            .map(|s| format!("[{}] {}: {}", s.severity, s.file_path, s.description))
            .collect();

        if files.is_empty() && latest_audit.is_none() && open_findings.is_empty() {
            return Ok(ActionOutcome::new(0, "nothing to analyze"));
        }

        let prompt = RefactorPrompt::generate(latest_audit.as_ref(), &files, &open_findings);
        let reply = ctx.generate(&prompt).await?;
        let drafts: Vec<ProposalDraft> = parse_reply(&reply).map_err(ActionError::Parse)?;

        let mut titles = Vec::new();
        let mut rejected = Vec::new();
        for draft in drafts.into_iter().take(MAX_PROPOSALS) {
            let proposal = match to_proposal(draft) {
                Ok(Some(proposal)) => proposal,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Dropping refactor draft: {}", e);
                    rejected.push(e.to_string());
                    continue;
                }
            };
            ctx.db
                .insert_proposal(&proposal)
                .map_err(ActionError::Storage)?;
            titles.push(proposal.title);
        }

        let mut summary = if titles.is_empty() {
            "no refactors proposed".to_string()
        } else {
            format!("{} proposals: {}", titles.len(), titles.join(", "))
        };
        if !rejected.is_empty() {
            summary.push_str(&format!("; dropped {}", rejected.join("; ")));
        }
        Ok(ActionOutcome::new(titles.len(), summary))
    }
}

/// Drafts without a title are ignored; an unrecognized impact is an error.
/// A missing impact is medium.
fn to_proposal(draft: ProposalDraft) -> Result<Option<RefactorProposal>, ParseEnumError> {
    let title = draft.title.trim();
    if title.is_empty() {
        tracing::debug!("Dropping refactor draft without a title");
        return Ok(None);
    }

    let impact = match draft.estimated_impact.trim() {
        "" => Impact::Medium,
        raw => raw.parse::<Impact>()?,
    };

    let mut proposal = RefactorProposal::new(
        title,
        draft.description.trim(),
        impact,
        draft.estimated_time_minutes,
    );
    proposal.affected_files = draft.affected_files;
    proposal.benefits = draft.benefits;
    proposal.risks = draft.risks;
    proposal.rollback_plan = draft.rollback_plan;
    Ok(Some(proposal))
}
