//! SQLite storage layer for metaloop
//!
//! This module handles persistent storage of:
//! - The kill switch / feature flag singleton
//! - Audit results, code review suggestions, refactor proposals
//! - Capability gaps (upserted by normalized operation name)
//! - The action log audit trail
//! - Bookkeeping for reviewed files and the run lock

mod schema;

pub use schema::SCHEMA;

use crate::records::{
    normalize_operation_name, ActionKind, ActionLog, ActionStatus, AuditResult,
    CapabilityGap, CodeReviewSuggestion, GapObservation, GapStatus, Lifecycle, NewAuditResult,
    Priority, ProposalStatus, RefactorProposal, Settings, SuggestionStatus, UpsertOutcome,
};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

/// Database connection wrapper
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {:?}", parent)
                })?;
            }
        }

        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", path.as_ref()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        let db = Self { conn };
        db.initialize()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self { conn };
        db.initialize()?;

        Ok(db)
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("Failed to initialize database schema")?;
        Ok(())
    }

    // ==================== Settings ====================

    /// Load the settings singleton, recreating it with defaults if it is
    /// missing or cannot be decoded
    pub fn load_settings(&self) -> Result<Settings> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT enabled, self_audit_enabled, code_review_enabled,
                       refactor_enabled, gap_analysis_enabled,
                       last_modified_at, last_modified_by
                FROM evolution_config WHERE id = 1
                "#,
                [],
                SettingsRow::from_row,
            )
            .optional();

        let decoded = match row {
            Ok(Some(row)) => row.into_settings(),
            Ok(None) => None,
            Err(
                e @ (rusqlite::Error::InvalidColumnType(..)
                | rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::IntegralValueOutOfRange(..)),
            ) => {
                tracing::warn!("Settings row is malformed: {}", e);
                None
            }
            Err(e) => return Err(e).context("Failed to load settings"),
        };

        match decoded {
            Some(settings) => Ok(settings),
            None => {
                tracing::warn!("Settings row missing or unreadable; restoring defaults");
                let settings = Settings::default();
                self.save_settings(&settings)?;
                Ok(settings)
            }
        }
    }

    /// Persist the settings singleton
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO evolution_config (
                    id, enabled, self_audit_enabled, code_review_enabled,
                    refactor_enabled, gap_analysis_enabled,
                    last_modified_at, last_modified_by
                ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    settings.enabled,
                    settings.self_audit,
                    settings.code_review,
                    settings.refactor,
                    settings.gap_analysis,
                    ts(&settings.last_modified_at),
                    settings.last_modified_by,
                ],
            )
            .context("Failed to save settings")?;
        Ok(())
    }

    // ==================== Audit Results ====================

    /// Append an audit result and return it with its assigned id
    pub fn insert_audit_result(&self, audit: &NewAuditResult) -> Result<AuditResult> {
        let now = Utc::now();
        let audit_date = audit.audit_date.unwrap_or_else(|| now.date_naive());
        let issues_json = serde_json::to_string(&audit.issues_found)?;
        let recommendations_json = serde_json::to_string(&audit.recommendations)?;

        self.conn
            .execute(
                r#"
                INSERT INTO audit_results (
                    audit_date, error_count, avg_response_ms, satisfaction_score,
                    issues_found, recommendations, log_file_size,
                    total_messages, total_sessions, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    audit_date.to_string(),
                    audit.error_count as i64,
                    audit.avg_response_ms,
                    audit.satisfaction_score,
                    issues_json,
                    recommendations_json,
                    audit.log_file_size as i64,
                    audit.total_messages as i64,
                    audit.total_sessions as i64,
                    ts(&now),
                ],
            )
            .context("Failed to insert audit result")?;

        Ok(AuditResult {
            id: self.conn.last_insert_rowid(),
            audit_date,
            error_count: audit.error_count,
            avg_response_ms: audit.avg_response_ms,
            satisfaction_score: audit.satisfaction_score,
            issues_found: audit.issues_found.clone(),
            recommendations: audit.recommendations.clone(),
            log_file_size: audit.log_file_size,
            total_messages: audit.total_messages,
            total_sessions: audit.total_sessions,
            created_at: now,
        })
    }

    /// Most recent audit result by date
    pub fn latest_audit(&self) -> Result<Option<AuditResult>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM audit_results ORDER BY audit_date DESC, id DESC LIMIT 1",
                    AuditRow::COLUMNS
                ),
                [],
                AuditRow::from_row,
            )
            .optional()
            .context("Failed to get latest audit result")?;

        row.map(AuditRow::into_audit).transpose()
    }

    // ==================== Code Review Suggestions ====================

    /// Insert a code review suggestion
    pub fn insert_suggestion(&self, s: &CodeReviewSuggestion) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO code_review_suggestions (
                    id, file_path, line_number, issue_type, severity, description,
                    suggested_fix, status, created_at, reviewed_at, resolved_at, user_feedback
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    s.id,
                    s.file_path,
                    s.line_number.map(|n| n as i64),
                    s.issue_type,
                    s.severity.as_str(),
                    s.description,
                    s.suggested_fix,
                    s.status.as_str(),
                    ts(&s.created_at),
                    s.reviewed_at.as_ref().map(ts),
                    s.resolved_at.as_ref().map(ts),
                    s.user_feedback,
                ],
            )
            .context("Failed to insert code review suggestion")?;
        Ok(())
    }

    /// Get a suggestion by id
    pub fn get_suggestion(&self, id: &str) -> Result<Option<CodeReviewSuggestion>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM code_review_suggestions WHERE id = ?1",
                    SuggestionRow::COLUMNS
                ),
                params![id],
                SuggestionRow::from_row,
            )
            .optional()
            .context("Failed to get code review suggestion")?;

        row.map(SuggestionRow::into_suggestion).transpose()
    }

    /// List suggestions in a given status, newest first
    pub fn list_suggestions(
        &self,
        status: SuggestionStatus,
        limit: usize,
    ) -> Result<Vec<CodeReviewSuggestion>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM code_review_suggestions WHERE status = ?1 ORDER BY id DESC LIMIT ?2",
            SuggestionRow::COLUMNS
        ))?;

        let rows = stmt.query_map(
            params![status.as_str(), limit as i64],
            SuggestionRow::from_row,
        )?;

        let mut suggestions = Vec::new();
        for row in rows {
            suggestions.push(row?.into_suggestion()?);
        }

        Ok(suggestions)
    }

    /// Apply a reviewer decision to a suggestion
    pub fn update_suggestion_status(
        &self,
        id: &str,
        to: SuggestionStatus,
        feedback: Option<&str>,
    ) -> Result<CodeReviewSuggestion> {
        let current = self
            .get_suggestion(id)?
            .ok_or_else(|| anyhow::anyhow!("Code review suggestion not found: {}", id))?;
        current.status.transition(to)?;

        let now = ts(&Utc::now());
        let resolved_at = to.is_terminal().then(|| now.clone());

        let changed = self
            .conn
            .execute(
                r#"
                UPDATE code_review_suggestions
                SET status = ?1,
                    reviewed_at = COALESCE(reviewed_at, ?2),
                    resolved_at = COALESCE(?3, resolved_at),
                    user_feedback = COALESCE(?4, user_feedback)
                WHERE id = ?5 AND status = ?6
                "#,
                params![
                    to.as_str(),
                    now,
                    resolved_at,
                    feedback,
                    id,
                    current.status.as_str()
                ],
            )
            .context("Failed to update code review suggestion")?;
        ensure_single_update(changed, "code review suggestion", id)?;

        self.get_suggestion(id)?
            .ok_or_else(|| anyhow::anyhow!("Code review suggestion vanished: {}", id))
    }

    // ==================== Refactor Proposals ====================

    /// Insert a refactor proposal
    pub fn insert_proposal(&self, p: &RefactorProposal) -> Result<()> {
        let affected_json = serde_json::to_string(&p.affected_files)?;

        self.conn
            .execute(
                r#"
                INSERT INTO refactor_proposals (
                    id, title, description, affected_files, estimated_impact,
                    estimated_time_minutes, benefits, risks, rollback_plan, status,
                    created_at, approved_at, completed_at, user_feedback
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                "#,
                params![
                    p.id,
                    p.title,
                    p.description,
                    affected_json,
                    p.estimated_impact.as_str(),
                    p.estimated_time_minutes as i64,
                    p.benefits,
                    p.risks,
                    p.rollback_plan,
                    p.status.as_str(),
                    ts(&p.created_at),
                    p.approved_at.as_ref().map(ts),
                    p.completed_at.as_ref().map(ts),
                    p.user_feedback,
                ],
            )
            .context("Failed to insert refactor proposal")?;
        Ok(())
    }

    /// Get a proposal by id
    pub fn get_proposal(&self, id: &str) -> Result<Option<RefactorProposal>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM refactor_proposals WHERE id = ?1",
                    ProposalRow::COLUMNS
                ),
                params![id],
                ProposalRow::from_row,
            )
            .optional()
            .context("Failed to get refactor proposal")?;

        row.map(ProposalRow::into_proposal).transpose()
    }

    /// The most recent proposal still waiting for approval
    pub fn latest_pending_proposal(&self) -> Result<Option<RefactorProposal>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM refactor_proposals WHERE status = ?1 ORDER BY id DESC LIMIT 1",
                    ProposalRow::COLUMNS
                ),
                params![ProposalStatus::Proposed.as_str()],
                ProposalRow::from_row,
            )
            .optional()
            .context("Failed to get latest pending proposal")?;

        row.map(ProposalRow::into_proposal).transpose()
    }

    /// Apply a reviewer decision to a proposal
    pub fn update_proposal_status(
        &self,
        id: &str,
        to: ProposalStatus,
        feedback: Option<&str>,
    ) -> Result<RefactorProposal> {
        let current = self
            .get_proposal(id)?
            .ok_or_else(|| anyhow::anyhow!("Refactor proposal not found: {}", id))?;
        current.status.transition(to)?;

        let now = ts(&Utc::now());
        let approved_at = (to == ProposalStatus::Approved).then(|| now.clone());
        let completed_at = to.is_terminal().then(|| now.clone());

        let changed = self
            .conn
            .execute(
                r#"
                UPDATE refactor_proposals
                SET status = ?1,
                    approved_at = COALESCE(?2, approved_at),
                    completed_at = COALESCE(?3, completed_at),
                    user_feedback = COALESCE(?4, user_feedback)
                WHERE id = ?5 AND status = ?6
                "#,
                params![
                    to.as_str(),
                    approved_at,
                    completed_at,
                    feedback,
                    id,
                    current.status.as_str()
                ],
            )
            .context("Failed to update refactor proposal")?;
        ensure_single_update(changed, "refactor proposal", id)?;

        self.get_proposal(id)?
            .ok_or_else(|| anyhow::anyhow!("Refactor proposal vanished: {}", id))
    }

    // ==================== Capability Gaps ====================

    /// Find-or-create a gap by normalized operation name.
    ///
    /// An existing gap gets its `manual_count` incremented, `last_seen_at`
    /// refreshed and its priority recomputed; otherwise a new `detected` gap
    /// with `manual_count = 1` is inserted.
    pub fn upsert_capability_gap(
        &self,
        observation: &GapObservation,
    ) -> Result<(CapabilityGap, UpsertOutcome)> {
        let normalized = normalize_operation_name(&observation.operation_name);
        if normalized.is_empty() {
            anyhow::bail!("Operation name must not be empty");
        }

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin gap upsert")?;

        let existing: Option<(String, i64)> = tx
            .query_row(
                "SELECT id, manual_count FROM capability_gaps WHERE normalized_name = ?1",
                params![normalized],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to look up capability gap")?;

        let now = ts(&Utc::now());
        let seen_at = ts(&observation.seen_at);

        let (id, outcome) = match existing {
            Some((id, count)) => {
                let count = count + 1;
                let priority = Priority::from_manual_count(count as u32);
                tx.execute(
                    r#"
                    UPDATE capability_gaps
                    SET manual_count = ?1,
                        last_seen_at = MAX(last_seen_at, ?2),
                        priority = ?3,
                        updated_at = ?4
                    WHERE id = ?5
                    "#,
                    params![count, seen_at, priority.as_str(), now, id],
                )
                .context("Failed to increment capability gap")?;
                (id, UpsertOutcome::Incremented)
            }
            None => {
                let id = crate::records::new_id();
                tx.execute(
                    r#"
                    INSERT INTO capability_gaps (
                        id, operation_name, normalized_name, operation_description,
                        manual_count, last_seen_at, priority, status, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8, ?8)
                    "#,
                    params![
                        id,
                        observation.operation_name.trim(),
                        normalized,
                        observation.operation_description,
                        seen_at,
                        Priority::from_manual_count(1).as_str(),
                        GapStatus::Detected.as_str(),
                        now,
                    ],
                )
                .context("Failed to insert capability gap")?;
                (id, UpsertOutcome::Created)
            }
        };

        tx.commit().context("Failed to commit gap upsert")?;

        let gap = self
            .get_gap(&id)?
            .ok_or_else(|| anyhow::anyhow!("Capability gap vanished: {}", id))?;
        Ok((gap, outcome))
    }

    /// Attach an automation suggestion to a gap
    pub fn set_gap_automation(
        &self,
        id: &str,
        suggestion: &str,
        time_saved_minutes: Option<u32>,
    ) -> Result<()> {
        self.conn
            .execute(
                r#"
                UPDATE capability_gaps
                SET automation_suggestion = ?1, estimated_time_saved_minutes = ?2, updated_at = ?3
                WHERE id = ?4
                "#,
                params![
                    suggestion,
                    time_saved_minutes.map(|m| m as i64),
                    ts(&Utc::now()),
                    id
                ],
            )
            .context("Failed to set gap automation suggestion")?;
        Ok(())
    }

    /// Get a gap by id
    pub fn get_gap(&self, id: &str) -> Result<Option<CapabilityGap>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM capability_gaps WHERE id = ?1", GapRow::COLUMNS),
                params![id],
                GapRow::from_row,
            )
            .optional()
            .context("Failed to get capability gap")?;

        row.map(GapRow::into_gap).transpose()
    }

    /// Get a gap by operation name (normalized before lookup)
    pub fn find_gap_by_name(&self, operation_name: &str) -> Result<Option<CapabilityGap>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM capability_gaps WHERE normalized_name = ?1",
                    GapRow::COLUMNS
                ),
                params![normalize_operation_name(operation_name)],
                GapRow::from_row,
            )
            .optional()
            .context("Failed to find capability gap")?;

        row.map(GapRow::into_gap).transpose()
    }

    /// List gaps in a status, most frequently observed first
    pub fn list_gaps(&self, status: GapStatus, limit: usize) -> Result<Vec<CapabilityGap>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {} FROM capability_gaps WHERE status = ?1
            ORDER BY manual_count DESC, last_seen_at DESC LIMIT ?2
            "#,
            GapRow::COLUMNS
        ))?;

        let rows = stmt.query_map(params![status.as_str(), limit as i64], GapRow::from_row)?;

        let mut gaps = Vec::new();
        for row in rows {
            gaps.push(row?.into_gap()?);
        }

        Ok(gaps)
    }

    /// Move a gap through its workflow
    pub fn update_gap_status(&self, id: &str, to: GapStatus) -> Result<CapabilityGap> {
        let current = self
            .get_gap(id)?
            .ok_or_else(|| anyhow::anyhow!("Capability gap not found: {}", id))?;
        current.status.transition(to)?;

        let changed = self
            .conn
            .execute(
                "UPDATE capability_gaps SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), ts(&Utc::now()), id, current.status.as_str()],
            )
            .context("Failed to update capability gap")?;
        ensure_single_update(changed, "capability gap", id)?;

        self.get_gap(id)?
            .ok_or_else(|| anyhow::anyhow!("Capability gap vanished: {}", id))
    }

    // ==================== Action Logs ====================

    /// Insert an action log entry
    pub fn insert_action_log(&self, log: &ActionLog) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO action_logs (
                    id, action_type, action_status, started_at, completed_at,
                    duration_ms, result_summary, error_message
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    log.id,
                    log.action_type.as_str(),
                    log.action_status.as_str(),
                    ts(&log.started_at),
                    log.completed_at.as_ref().map(ts),
                    log.duration_ms.map(|d| d as i64),
                    log.result_summary,
                    log.error_message,
                ],
            )
            .context("Failed to insert action log")?;
        Ok(())
    }

    /// Get an action log by id
    pub fn get_action_log(&self, id: &str) -> Result<Option<ActionLog>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM action_logs WHERE id = ?1", LogRow::COLUMNS),
                params![id],
                LogRow::from_row,
            )
            .optional()
            .context("Failed to get action log")?;

        row.map(LogRow::into_log).transpose()
    }

    /// Move an action log to a new status, stamping `completed_at` and
    /// `duration_ms` when the new status is terminal
    pub fn finish_action_log(
        &self,
        id: &str,
        to: ActionStatus,
        duration_ms: u64,
        summary: Option<&str>,
        error: Option<&str>,
    ) -> Result<ActionLog> {
        let current = self
            .get_action_log(id)?
            .ok_or_else(|| anyhow::anyhow!("Action log not found: {}", id))?;
        current.action_status.transition(to)?;

        let (completed_at, duration) = if to.is_terminal() {
            (Some(ts(&Utc::now())), Some(duration_ms as i64))
        } else {
            (None, None)
        };

        let changed = self
            .conn
            .execute(
                r#"
                UPDATE action_logs
                SET action_status = ?1, completed_at = ?2, duration_ms = ?3,
                    result_summary = COALESCE(?4, result_summary),
                    error_message = COALESCE(?5, error_message)
                WHERE id = ?6 AND action_status = ?7
                "#,
                params![
                    to.as_str(),
                    completed_at,
                    duration,
                    summary,
                    error,
                    id,
                    current.action_status.as_str()
                ],
            )
            .context("Failed to update action log")?;
        ensure_single_update(changed, "action log", id)?;

        self.get_action_log(id)?
            .ok_or_else(|| anyhow::anyhow!("Action log vanished: {}", id))
    }

    /// Most recent action logs, newest first
    pub fn recent_action_logs(&self, limit: usize) -> Result<Vec<ActionLog>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM action_logs ORDER BY started_at DESC, id DESC LIMIT ?1",
            LogRow::COLUMNS
        ))?;

        let rows = stmt.query_map(params![limit as i64], LogRow::from_row)?;

        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?.into_log()?);
        }

        Ok(logs)
    }

    /// The most recent successful run of an action kind
    pub fn last_completed_action(&self, kind: ActionKind) -> Result<Option<ActionLog>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    r#"
                    SELECT {} FROM action_logs
                    WHERE action_type = ?1 AND action_status = ?2
                    ORDER BY started_at DESC, id DESC LIMIT 1
                    "#,
                    LogRow::COLUMNS
                ),
                params![kind.as_str(), ActionStatus::Completed.as_str()],
                LogRow::from_row,
            )
            .optional()
            .context("Failed to get last completed action")?;

        row.map(LogRow::into_log).transpose()
    }

    /// Cancel action logs left non-terminal by an interrupted process.
    ///
    /// Only entries started before `started_before` are touched.
    pub fn cancel_stale_action_logs(&self, started_before: DateTime<Utc>) -> Result<usize> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM action_logs WHERE action_status IN (?1, ?2) AND started_at < ?3",
            LogRow::COLUMNS
        ))?;

        let rows = stmt.query_map(
            params![
                ActionStatus::Started.as_str(),
                ActionStatus::InProgress.as_str(),
                ts(&started_before)
            ],
            LogRow::from_row,
        )?;

        let mut stale = Vec::new();
        for row in rows {
            stale.push(row?.into_log()?);
        }
        drop(stmt);

        let now = Utc::now();
        for log in &stale {
            let elapsed = (now - log.started_at).num_milliseconds().max(0) as u64;
            self.finish_action_log(
                &log.id,
                ActionStatus::Cancelled,
                elapsed,
                None,
                Some("interrupted before reaching a terminal state"),
            )?;
        }

        Ok(stale.len())
    }

    // ==================== Reviewed Files ====================

    /// Content hash recorded at the last successful review of a file
    pub fn get_reviewed_hash(&self, path: &str) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row(
                "SELECT content_hash FROM reviewed_files WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to get reviewed file hash")?;

        Ok(result)
    }

    /// Remember that a file was reviewed at a given content hash
    pub fn record_reviewed_file(&self, path: &str, hash: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO reviewed_files (path, content_hash, reviewed_at) VALUES (?1, ?2, ?3)",
                params![path, hash, ts(&Utc::now())],
            )
            .context("Failed to record reviewed file")?;
        Ok(())
    }

    // ==================== Run Lock ====================

    /// Try to take the run lock. A lock acquired before `stale_before` is
    /// considered abandoned and is taken over.
    pub fn try_acquire_run_lock(&self, holder: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin run lock transaction")?;

        let reclaimed = tx.execute(
            "DELETE FROM run_lock WHERE acquired_at < ?1",
            params![ts(&stale_before)],
        )?;
        if reclaimed > 0 {
            tracing::warn!("Reclaimed stale run lock");
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO run_lock (id, holder, acquired_at) VALUES (1, ?1, ?2)",
            params![holder, ts(&Utc::now())],
        )?;

        tx.commit().context("Failed to commit run lock")?;

        Ok(inserted == 1)
    }

    /// Release the run lock if `holder` owns it
    pub fn release_run_lock(&self, holder: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM run_lock WHERE holder = ?1", params![holder])
            .context("Failed to release run lock")?;
        Ok(())
    }

    // ==================== Statistics ====================

    /// Get record counts used by the dashboard
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let count = |sql: &str, status: &str| -> Result<usize> {
            let n: i64 = self.conn.query_row(sql, params![status], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(DatabaseStats {
            pending_suggestions: count(
                "SELECT COUNT(*) FROM code_review_suggestions WHERE status = ?1",
                SuggestionStatus::Pending.as_str(),
            )?,
            proposed_refactors: count(
                "SELECT COUNT(*) FROM refactor_proposals WHERE status = ?1",
                ProposalStatus::Proposed.as_str(),
            )?,
            detected_gaps: count(
                "SELECT COUNT(*) FROM capability_gaps WHERE status = ?1",
                GapStatus::Detected.as_str(),
            )?,
            audit_results: self
                .conn
                .query_row("SELECT COUNT(*) FROM audit_results", [], |row| {
                    row.get::<_, i64>(0)
                })? as usize,
            action_logs: self
                .conn
                .query_row("SELECT COUNT(*) FROM action_logs", [], |row| {
                    row.get::<_, i64>(0)
                })? as usize,
        })
    }

    /// Drop a table so later statements against it fail
    #[cfg(test)]
    pub(crate) fn drop_table(&self, table: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("DROP TABLE {}", table))
            .with_context(|| format!("Failed to drop {}", table))
    }
}

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub pending_suggestions: usize,
    pub proposed_refactors: usize,
    pub detected_gaps: usize,
    pub audit_results: usize,
    pub action_logs: usize,
}

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in database: {:?}", s))?
        .with_timezone(&Utc))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn ensure_single_update(changed: usize, entity: &str, id: &str) -> Result<()> {
    if changed != 1 {
        anyhow::bail!("{} {} was modified concurrently", entity, id);
    }
    Ok(())
}

// Internal row types for database mapping

struct SettingsRow {
    enabled: bool,
    self_audit: bool,
    code_review: bool,
    refactor: bool,
    gap_analysis: bool,
    last_modified_at: String,
    last_modified_by: String,
}

impl SettingsRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            enabled: row.get(0)?,
            self_audit: row.get(1)?,
            code_review: row.get(2)?,
            refactor: row.get(3)?,
            gap_analysis: row.get(4)?,
            last_modified_at: row.get(5)?,
            last_modified_by: row.get(6)?,
        })
    }

    fn into_settings(self) -> Option<Settings> {
        let last_modified_at = match parse_ts(&self.last_modified_at) {
            Ok(at) => at,
            Err(e) => {
                tracing::warn!("Settings row is malformed: {:#}", e);
                return None;
            }
        };

        Some(Settings {
            enabled: self.enabled,
            self_audit: self.self_audit,
            code_review: self.code_review,
            refactor: self.refactor,
            gap_analysis: self.gap_analysis,
            last_modified_at,
            last_modified_by: self.last_modified_by,
        })
    }
}

struct AuditRow {
    id: i64,
    audit_date: String,
    error_count: i64,
    avg_response_ms: Option<f64>,
    satisfaction_score: f64,
    issues_found: String,
    recommendations: String,
    log_file_size: i64,
    total_messages: i64,
    total_sessions: i64,
    created_at: String,
}

impl AuditRow {
    const COLUMNS: &'static str = "id, audit_date, error_count, avg_response_ms, \
        satisfaction_score, issues_found, recommendations, log_file_size, \
        total_messages, total_sessions, created_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            audit_date: row.get(1)?,
            error_count: row.get(2)?,
            avg_response_ms: row.get(3)?,
            satisfaction_score: row.get(4)?,
            issues_found: row.get(5)?,
            recommendations: row.get(6)?,
            log_file_size: row.get(7)?,
            total_messages: row.get(8)?,
            total_sessions: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_audit(self) -> Result<AuditResult> {
        Ok(AuditResult {
            id: self.id,
            audit_date: self
                .audit_date
                .parse::<NaiveDate>()
                .with_context(|| format!("Invalid audit date: {:?}", self.audit_date))?,
            error_count: self.error_count as u32,
            avg_response_ms: self.avg_response_ms,
            satisfaction_score: self.satisfaction_score,
            issues_found: serde_json::from_str(&self.issues_found)?,
            recommendations: serde_json::from_str(&self.recommendations)?,
            log_file_size: self.log_file_size as u64,
            total_messages: self.total_messages as u32,
            total_sessions: self.total_sessions as u32,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct SuggestionRow {
    id: String,
    file_path: String,
    line_number: Option<i64>,
    issue_type: String,
    severity: String,
    description: String,
    suggested_fix: Option<String>,
    status: String,
    created_at: String,
    reviewed_at: Option<String>,
    resolved_at: Option<String>,
    user_feedback: Option<String>,
}

impl SuggestionRow {
    const COLUMNS: &'static str = "id, file_path, line_number, issue_type, severity, \
        description, suggested_fix, status, created_at, reviewed_at, resolved_at, user_feedback";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            file_path: row.get(1)?,
            line_number: row.get(2)?,
            issue_type: row.get(3)?,
            severity: row.get(4)?,
            description: row.get(5)?,
            suggested_fix: row.get(6)?,
            status: row.get(7)?,
            created_at: row.get(8)?,
            reviewed_at: row.get(9)?,
            resolved_at: row.get(10)?,
            user_feedback: row.get(11)?,
        })
    }

    fn into_suggestion(self) -> Result<CodeReviewSuggestion> {
        Ok(CodeReviewSuggestion {
            id: self.id,
            file_path: self.file_path,
            line_number: self.line_number.map(|n| n as u32),
            issue_type: self.issue_type,
            severity: self.severity.parse()?,
            description: self.description,
            suggested_fix: self.suggested_fix,
            status: self.status.parse()?,
            created_at: parse_ts(&self.created_at)?,
            reviewed_at: parse_ts_opt(self.reviewed_at)?,
            resolved_at: parse_ts_opt(self.resolved_at)?,
            user_feedback: self.user_feedback,
        })
    }
}

struct ProposalRow {
    id: String,
    title: String,
    description: String,
    affected_files: String,
    estimated_impact: String,
    estimated_time_minutes: i64,
    benefits: Option<String>,
    risks: Option<String>,
    rollback_plan: Option<String>,
    status: String,
    created_at: String,
    approved_at: Option<String>,
    completed_at: Option<String>,
    user_feedback: Option<String>,
}

impl ProposalRow {
    const COLUMNS: &'static str = "id, title, description, affected_files, estimated_impact, \
        estimated_time_minutes, benefits, risks, rollback_plan, status, created_at, \
        approved_at, completed_at, user_feedback";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            affected_files: row.get(3)?,
            estimated_impact: row.get(4)?,
            estimated_time_minutes: row.get(5)?,
            benefits: row.get(6)?,
            risks: row.get(7)?,
            rollback_plan: row.get(8)?,
            status: row.get(9)?,
            created_at: row.get(10)?,
            approved_at: row.get(11)?,
            completed_at: row.get(12)?,
            user_feedback: row.get(13)?,
        })
    }

    fn into_proposal(self) -> Result<RefactorProposal> {
        Ok(RefactorProposal {
            id: self.id,
            title: self.title,
            description: self.description,
            affected_files: serde_json::from_str(&self.affected_files)?,
            estimated_impact: self.estimated_impact.parse()?,
            estimated_time_minutes: self.estimated_time_minutes as u32,
            benefits: self.benefits,
            risks: self.risks,
            rollback_plan: self.rollback_plan,
            status: self.status.parse()?,
            created_at: parse_ts(&self.created_at)?,
            approved_at: parse_ts_opt(self.approved_at)?,
            completed_at: parse_ts_opt(self.completed_at)?,
            user_feedback: self.user_feedback,
        })
    }
}

struct GapRow {
    id: String,
    operation_name: String,
    operation_description: String,
    manual_count: i64,
    last_seen_at: String,
    automation_suggestion: Option<String>,
    estimated_time_saved_minutes: Option<i64>,
    priority: String,
    status: String,
    created_at: String,
}

impl GapRow {
    const COLUMNS: &'static str = "id, operation_name, operation_description, manual_count, \
        last_seen_at, automation_suggestion, estimated_time_saved_minutes, priority, status, \
        created_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            operation_name: row.get(1)?,
            operation_description: row.get(2)?,
            manual_count: row.get(3)?,
            last_seen_at: row.get(4)?,
            automation_suggestion: row.get(5)?,
            estimated_time_saved_minutes: row.get(6)?,
            priority: row.get(7)?,
            status: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_gap(self) -> Result<CapabilityGap> {
        Ok(CapabilityGap {
            id: self.id,
            operation_name: self.operation_name,
            operation_description: self.operation_description,
            manual_count: self.manual_count as u32,
            last_seen_at: parse_ts(&self.last_seen_at)?,
            automation_suggestion: self.automation_suggestion,
            estimated_time_saved_minutes: self.estimated_time_saved_minutes.map(|m| m as u32),
            priority: self.priority.parse()?,
            status: self.status.parse()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct LogRow {
    id: String,
    action_type: String,
    action_status: String,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    result_summary: Option<String>,
    error_message: Option<String>,
}

impl LogRow {
    const COLUMNS: &'static str = "id, action_type, action_status, started_at, completed_at, \
        duration_ms, result_summary, error_message";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            action_type: row.get(1)?,
            action_status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            duration_ms: row.get(5)?,
            result_summary: row.get(6)?,
            error_message: row.get(7)?,
        })
    }

    fn into_log(self) -> Result<ActionLog> {
        Ok(ActionLog {
            id: self.id,
            action_type: self.action_type.parse()?,
            action_status: self.action_status.parse()?,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_ts_opt(self.completed_at)?,
            duration_ms: self.duration_ms.map(|d| d as u64),
            result_summary: self.result_summary,
            error_message: self.error_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Feature, Impact, Severity};

    fn observation(name: &str) -> GapObservation {
        GapObservation {
            operation_name: name.to_string(),
            operation_description: format!("manually ran {}", name),
            seen_at: Utc::now(),
        }
    }

    #[test]
    fn test_database_creation() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats, DatabaseStats::default());
    }

    #[test]
    fn test_settings_default_on_first_read() {
        let db = Database::open_in_memory().unwrap();

        let settings = db.load_settings().unwrap();
        assert!(!settings.enabled);
        for feature in Feature::ALL {
            assert!(!settings.feature_flag(*feature));
        }

        // The default row was persisted
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM evolution_config", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_settings_self_heal_malformed_row() {
        let db = Database::open_in_memory().unwrap();
        db.conn
            .execute(
                "INSERT INTO evolution_config (id, enabled, last_modified_at, last_modified_by) \
                 VALUES (1, 'yes please', 'not a date', 'someone')",
                [],
            )
            .unwrap();

        let settings = db.load_settings().unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.last_modified_by, "system");

        let reloaded = db.load_settings().unwrap();
        assert!(!reloaded.enabled);
        assert_eq!(reloaded.last_modified_by, "system");
    }

    #[test]
    fn test_settings_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let mut settings = db.load_settings().unwrap();
        settings.enabled = true;
        settings.code_review = true;
        settings.last_modified_by = "admin".to_string();
        db.save_settings(&settings).unwrap();

        let loaded = db.load_settings().unwrap();
        assert!(loaded.is_feature_enabled(Feature::CodeReview));
        assert!(!loaded.is_feature_enabled(Feature::Refactor));
        assert_eq!(loaded.last_modified_by, "admin");
    }

    #[test]
    fn test_latest_audit_by_date() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.latest_audit().unwrap().is_none());

        let older = NewAuditResult {
            audit_date: NaiveDate::from_ymd_opt(2026, 1, 2),
            error_count: 7,
            ..Default::default()
        };
        let newer = NewAuditResult {
            audit_date: NaiveDate::from_ymd_opt(2026, 3, 4),
            error_count: 1,
            issues_found: vec!["slow replies".to_string()],
            ..Default::default()
        };
        db.insert_audit_result(&newer).unwrap();
        db.insert_audit_result(&older).unwrap();

        let latest = db.latest_audit().unwrap().unwrap();
        assert_eq!(latest.error_count, 1);
        assert_eq!(latest.issues_found, vec!["slow replies".to_string()]);
        assert!(latest.avg_response_ms.is_none());
    }

    #[test]
    fn test_suggestion_review_flow() {
        let db = Database::open_in_memory().unwrap();
        let suggestion =
            CodeReviewSuggestion::new("src/lib.rs", "unwrap", Severity::High, "Avoid unwrap")
                .with_line(Some(42));
        db.insert_suggestion(&suggestion).unwrap();

        let approved = db
            .update_suggestion_status(&suggestion.id, SuggestionStatus::Approved, Some("ok"))
            .unwrap();
        assert_eq!(approved.status, SuggestionStatus::Approved);
        assert!(approved.reviewed_at.is_some());
        assert!(approved.resolved_at.is_none());
        assert_eq!(approved.user_feedback.as_deref(), Some("ok"));

        let err = db
            .update_suggestion_status(&suggestion.id, SuggestionStatus::Pending, None)
            .unwrap_err();
        assert!(err.to_string().contains("invalid suggestion transition"));

        let applied = db
            .update_suggestion_status(&suggestion.id, SuggestionStatus::Applied, None)
            .unwrap();
        assert!(applied.resolved_at.is_some());
        assert_eq!(applied.line_number, Some(42));
    }

    #[test]
    fn test_proposal_workflow_timestamps() {
        let db = Database::open_in_memory().unwrap();
        let mut proposal = RefactorProposal::new("Split storage", "Too big", Impact::Medium, 90);
        proposal.affected_files = vec!["src/storage/mod.rs".to_string()];
        db.insert_proposal(&proposal).unwrap();

        assert_eq!(
            db.latest_pending_proposal().unwrap().unwrap().id,
            proposal.id
        );

        let approved = db
            .update_proposal_status(&proposal.id, ProposalStatus::Approved, None)
            .unwrap();
        assert!(approved.approved_at.is_some());
        assert!(db.latest_pending_proposal().unwrap().is_none());

        assert!(db
            .update_proposal_status(&proposal.id, ProposalStatus::Completed, None)
            .is_err());

        db.update_proposal_status(&proposal.id, ProposalStatus::InProgress, None)
            .unwrap();
        let done = db
            .update_proposal_status(&proposal.id, ProposalStatus::Completed, Some("shipped"))
            .unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.affected_files, proposal.affected_files);
    }

    #[test]
    fn test_gap_upsert_by_normalized_name() {
        let db = Database::open_in_memory().unwrap();

        let (first, outcome) = db.upsert_capability_gap(&observation("Restart Bot")).unwrap();
        assert_eq!(outcome, UpsertOutcome::Created);
        assert_eq!(first.manual_count, 1);
        assert_eq!(first.status, GapStatus::Detected);

        let (second, outcome) = db
            .upsert_capability_gap(&observation("  restart   bot "))
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Incremented);
        assert_eq!(second.id, first.id);
        assert_eq!(second.manual_count, 2);
        assert_eq!(second.operation_name, "Restart Bot");

        assert_eq!(db.get_stats().unwrap().detected_gaps, 1);
        assert!(db.upsert_capability_gap(&observation("   ")).is_err());
    }

    #[test]
    fn test_gap_priority_follows_count() {
        let db = Database::open_in_memory().unwrap();
        for _ in 0..5 {
            db.upsert_capability_gap(&observation("rotate logs")).unwrap();
        }
        let gap = db.find_gap_by_name("Rotate Logs").unwrap().unwrap();
        assert_eq!(gap.manual_count, 5);
        assert_eq!(gap.priority, Priority::High);
    }

    #[test]
    fn test_action_log_finish_once() {
        let db = Database::open_in_memory().unwrap();
        let log = ActionLog::start(ActionKind::SelfAudit);
        db.insert_action_log(&log).unwrap();

        let done = db
            .finish_action_log(&log.id, ActionStatus::Completed, 12, Some("ok"), None)
            .unwrap();
        assert_eq!(done.action_status, ActionStatus::Completed);
        assert_eq!(done.duration_ms, Some(12));
        assert!(done.completed_at.is_some());

        assert!(db
            .finish_action_log(&log.id, ActionStatus::Failed, 1, None, Some("late"))
            .is_err());
    }

    #[test]
    fn test_recent_logs_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for i in 0..7 {
            let mut log = ActionLog::start(ActionKind::CodeReview);
            log.started_at = Utc::now() + chrono::Duration::seconds(i);
            db.insert_action_log(&log).unwrap();
            ids.push(log.id);
        }

        let recent = db.recent_action_logs(5).unwrap();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].id, ids[6]);
        assert_eq!(recent[4].id, ids[2]);
    }

    #[test]
    fn test_cancel_stale_logs() {
        let db = Database::open_in_memory().unwrap();
        let mut stale = ActionLog::start(ActionKind::Refactor);
        stale.started_at = Utc::now() - chrono::Duration::hours(2);
        db.insert_action_log(&stale).unwrap();
        let fresh = ActionLog::start(ActionKind::Refactor);
        db.insert_action_log(&fresh).unwrap();

        let cancelled = db
            .cancel_stale_action_logs(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(cancelled, 1);

        let stale = db.get_action_log(&stale.id).unwrap().unwrap();
        assert_eq!(stale.action_status, ActionStatus::Cancelled);
        assert!(stale.duration_ms.is_some());
        let fresh = db.get_action_log(&fresh.id).unwrap().unwrap();
        assert_eq!(fresh.action_status, ActionStatus::Started);
    }

    #[test]
    fn test_run_lock_exclusive() {
        let db = Database::open_in_memory().unwrap();
        let horizon = Utc::now() - chrono::Duration::hours(1);

        assert!(db.try_acquire_run_lock("a", horizon).unwrap());
        assert!(!db.try_acquire_run_lock("b", horizon).unwrap());

        db.release_run_lock("b").unwrap();
        assert!(!db.try_acquire_run_lock("b", horizon).unwrap());

        db.release_run_lock("a").unwrap();
        assert!(db.try_acquire_run_lock("b", horizon).unwrap());

        // Everything older than "now + 1h" is stale, so "c" takes over
        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(db.try_acquire_run_lock("c", future).unwrap());
    }

    #[test]
    fn test_reviewed_file_hash() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_reviewed_hash("src/main.rs").unwrap().is_none());
        db.record_reviewed_file("src/main.rs", "abc").unwrap();
        db.record_reviewed_file("src/main.rs", "def").unwrap();
        assert_eq!(
            db.get_reviewed_hash("src/main.rs").unwrap().as_deref(),
            Some("def")
        );
    }
}
