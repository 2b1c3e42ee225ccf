//! Code review: per-file findings stored as pending suggestions
//!
//! Files are reviewed one at a time. A file that cannot be read, times out
//! or yields unparseable findings is noted in the summary and the remaining
//! files are still reviewed. Only when every attempted file fails does the
//! action itself fail. Oversized and non-UTF-8 files are skipped before
//! their content is loaded into a prompt.

use super::{collect_source_files, Action, ActionContext, ActionError, ActionOutcome, SourceFile};
use crate::llm::{parse_reply, CodeReviewPrompt, ReviewFinding};
use crate::records::{CodeReviewSuggestion, Feature, ParseEnumError, Severity};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

pub struct CodeReview;

#[derive(Debug, Default)]
struct ReviewTally {
    reviewed: usize,
    unchanged: usize,
    oversized: usize,
    not_text: usize,
    suggestions: usize,
    dropped_findings: usize,
    failures: Vec<String>,
}

impl ReviewTally {
    fn summary(&self) -> String {
        let attempted = self.reviewed + self.failures.len();
        let mut summary = format!(
            "reviewed {} of {} files, {} suggestions",
            self.reviewed, attempted, self.suggestions
        );
        if self.unchanged > 0 {
            summary.push_str(&format!(", {} unchanged skipped", self.unchanged));
        }
        if self.oversized > 0 {
            summary.push_str(&format!(", {} oversized skipped", self.oversized));
        }
        if self.not_text > 0 {
            summary.push_str(&format!(", {} non-UTF-8 skipped", self.not_text));
        }
        if self.dropped_findings > 0 {
            summary.push_str(&format!(
                ", {} findings with unknown severity dropped",
                self.dropped_findings
            ));
        }
        if !self.failures.is_empty() {
            summary.push_str(&format!(
                "; {} failed: {}",
                self.failures.len(),
                self.failures.join("; ")
            ));
        }
        summary
    }
}

#[async_trait(?Send)]
impl Action for CodeReview {
    fn feature(&self) -> Feature {
        Feature::CodeReview
    }

    async fn run(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let files = collect_source_files(ctx.config);
        let mut tally = ReviewTally::default();

        for file in &files {
            if tally.reviewed + tally.failures.len() >= ctx.config.max_review_files {
                break;
            }

            let content = match read_source(file, ctx.config.max_file_bytes) {
                Ok(SourceRead::Text(content)) => content,
                Ok(SourceRead::Oversized(len)) => {
                    tracing::debug!("Skipping oversized file {} ({} bytes)", file.relative, len);
                    tally.oversized += 1;
                    continue;
                }
                Ok(SourceRead::NotText) => {
                    tracing::debug!("Skipping non-UTF-8 file {}", file.relative);
                    tally.not_text += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Cannot read {}: {}", file.relative, e);
                    tally.failures.push(format!("{}: {}", file.relative, e));
                    continue;
                }
            };

            let hash = hex::encode(Sha256::digest(content.as_bytes()));
            let previous = ctx
                .db
                .get_reviewed_hash(&file.relative)
                .map_err(ActionError::Storage)?;
            if previous.as_deref() == Some(hash.as_str()) {
                tracing::debug!("Skipping unchanged file {}", file.relative);
                tally.unchanged += 1;
                continue;
            }

            match review_file(ctx, file, &content).await {
                Ok(findings) => {
                    for finding in findings {
                        let suggestion = match to_suggestion(&file.relative, finding) {
                            Ok(suggestion) => suggestion,
                            Err(e) => {
                                tracing::warn!("Dropping finding for {}: {}", file.relative, e);
                                tally.dropped_findings += 1;
                                continue;
                            }
                        };
                        ctx.db
                            .insert_suggestion(&suggestion)
                            .map_err(ActionError::Storage)?;
                        tally.suggestions += 1;
                    }
                    ctx.db
                        .record_reviewed_file(&file.relative, &hash)
                        .map_err(ActionError::Storage)?;
                    tally.reviewed += 1;
                }
                Err(e) => {
                    tracing::warn!("Review of {} failed: {}", file.relative, e);
                    tally.failures.push(format!("{}: {}", file.relative, e));
                }
            }
        }

        if tally.reviewed == 0 && !tally.failures.is_empty() {
            return Err(ActionError::Generator(anyhow::anyhow!(
                "every file failed review ({})",
                tally.failures.join("; ")
            )));
        }

        Ok(ActionOutcome::new(tally.suggestions, tally.summary()))
    }
}

enum SourceRead {
    Text(String),
    Oversized(u64),
    NotText,
}

/// Load a file for review, checking its size before reading it
fn read_source(file: &SourceFile, max_bytes: u64) -> std::io::Result<SourceRead> {
    let len = std::fs::metadata(&file.absolute)?.len();
    if len > max_bytes {
        return Ok(SourceRead::Oversized(len));
    }

    let bytes = std::fs::read(&file.absolute)?;
    Ok(match String::from_utf8(bytes) {
        Ok(content) => SourceRead::Text(content),
        Err(_) => SourceRead::NotText,
    })
}

async fn review_file(
    ctx: &ActionContext<'_>,
    file: &SourceFile,
    content: &str,
) -> Result<Vec<ReviewFinding>, ActionError> {
    let reply = ctx
        .generate(&CodeReviewPrompt::generate(&file.relative, content))
        .await?;
    parse_reply(&reply).map_err(ActionError::Parse)
}

/// A finding without a severity is medium; an unrecognized one is rejected
fn to_suggestion(
    path: &str,
    finding: ReviewFinding,
) -> Result<CodeReviewSuggestion, ParseEnumError> {
    let severity = match finding.severity.trim() {
        "" => Severity::Medium,
        raw => raw.parse::<Severity>()?,
    };

    Ok(
        CodeReviewSuggestion::new(path, &finding.issue_type, severity, &finding.description)
            .with_line(finding.line_number)
            .with_suggested_fix(finding.suggested_fix),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::fixture::Fixture;
    use crate::records::SuggestionStatus;
    use std::time::Duration;

    const ONE_FINDING: &str = r#"[{"line_number": 1, "issue_type": "bug", "severity": "High", "description": "off by one"}]"#;

    #[tokio::test]
    async fn test_partial_success_commits_good_files() {
        let mut fixture = Fixture::new();
        fixture.write_source("src/a.rs", "fn a() {}");
        fixture.write_source("src/b.rs", "fn b() {}");
        fixture.write_source("src/c.rs", "fn c() {}");
        fixture.llm.add_response("`src/a.rs`", ONE_FINDING);
        fixture.llm.add_response("`src/b.rs`", ONE_FINDING);
        fixture
            .llm
            .add_delayed_response("`src/c.rs`", ONE_FINDING, Duration::from_millis(500));
        fixture.call_timeout = Duration::from_millis(100);

        let outcome = CodeReview.run(&fixture.ctx()).await.unwrap();
        assert_eq!(outcome.records_written, 2);
        assert!(outcome.summary.contains("reviewed 2 of 3 files"));
        assert!(outcome.summary.contains("src/c.rs: timed out"));

        let pending = fixture
            .db
            .list_suggestions(SuggestionStatus::Pending, 10)
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|s| s.severity == Severity::High));
    }

    #[tokio::test]
    async fn test_unchanged_files_are_skipped() {
        let mut fixture = Fixture::new();
        fixture.write_source("src/a.rs", "fn a() {}");
        fixture.llm.add_response("`src/a.rs`", ONE_FINDING);

        CodeReview.run(&fixture.ctx()).await.unwrap();
        let second = CodeReview.run(&fixture.ctx()).await.unwrap();
        assert_eq!(second.records_written, 0);
        assert!(second.summary.contains("1 unchanged skipped"));

        fixture.write_source("src/a.rs", "fn a() { todo!() }");
        let third = CodeReview.run(&fixture.ctx()).await.unwrap();
        assert_eq!(third.records_written, 1);
    }

    #[tokio::test]
    async fn test_all_files_failing_fails_the_action() {
        let mut fixture = Fixture::new();
        fixture.write_source("src/a.rs", "fn a() {}");
        fixture
            .llm
            .add_failure("`src/a.rs`", "model unavailable", Duration::ZERO);

        let err = CodeReview.run(&fixture.ctx()).await.unwrap_err();
        assert!(err.to_string().contains("model unavailable"));
    }

    #[tokio::test]
    async fn test_no_files_is_a_quiet_success() {
        let fixture = Fixture::new();
        let outcome = CodeReview.run(&fixture.ctx()).await.unwrap();
        assert_eq!(outcome.records_written, 0);
        assert_eq!(outcome.summary, "reviewed 0 of 0 files, 0 suggestions");
    }

    #[tokio::test]
    async fn test_oversized_and_binary_files_are_skipped() {
        let mut fixture = Fixture::new();
        fixture.config.max_file_bytes = 64;
        fixture.write_source("src/a.rs", "fn a() {}");
        fixture.write_source("src/big.rs", &"// padding\n".repeat(20));
        let binary = fixture.config.project_root.join("src/blob.rs");
        std::fs::write(&binary, [0xff, 0xfe, 0x00, 0x80]).unwrap();
        fixture.llm.add_response("`src/a.rs`", ONE_FINDING);

        let outcome = CodeReview.run(&fixture.ctx()).await.unwrap();
        assert_eq!(outcome.records_written, 1);
        assert!(outcome.summary.contains("reviewed 1 of 1 files"));
        assert!(outcome.summary.contains("1 oversized skipped"));
        assert!(outcome.summary.contains("1 non-UTF-8 skipped"));
        assert!(fixture
            .llm
            .prompts()
            .iter()
            .all(|p| !p.contains("src/big.rs") && !p.contains("src/blob.rs")));
    }

    #[tokio::test]
    async fn test_only_binary_files_is_not_a_failure() {
        let fixture = Fixture::new();
        std::fs::create_dir_all(fixture.config.project_root.join("src")).unwrap();
        std::fs::write(fixture.config.project_root.join("src/blob.rs"), [0xc3, 0x28]).unwrap();

        let outcome = CodeReview.run(&fixture.ctx()).await.unwrap();
        assert_eq!(outcome.records_written, 0);
        assert!(outcome.summary.contains("1 non-UTF-8 skipped"));
    }

    #[tokio::test]
    async fn test_unknown_severity_is_dropped_and_reported() {
        let mut fixture = Fixture::new();
        fixture.write_source("src/a.rs", "fn a() {}");
        fixture.llm.add_response(
            "`src/a.rs`",
            r#"[
                {"severity": "catastrophic", "description": "x"},
                {"description": "no severity given"}
            ]"#,
        );

        let outcome = CodeReview.run(&fixture.ctx()).await.unwrap();
        assert_eq!(outcome.records_written, 1);
        assert!(outcome
            .summary
            .contains("1 findings with unknown severity dropped"));

        let pending = fixture
            .db
            .list_suggestions(SuggestionStatus::Pending, 10)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].severity, Severity::Medium);
        assert_eq!(pending[0].description, "no severity given");
    }
}
