//! Database schema definition

/// SQL schema for the metaloop database
pub const SCHEMA: &str = r#"
-- Kill switch and per-feature flags; exactly one row (id = 1)
CREATE TABLE IF NOT EXISTS evolution_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    enabled INTEGER NOT NULL DEFAULT 0,
    self_audit_enabled INTEGER NOT NULL DEFAULT 0,
    code_review_enabled INTEGER NOT NULL DEFAULT 0,
    refactor_enabled INTEGER NOT NULL DEFAULT 0,
    gap_analysis_enabled INTEGER NOT NULL DEFAULT 0,
    last_modified_at TEXT NOT NULL,
    last_modified_by TEXT NOT NULL
);

-- Self-audit history, append-only
CREATE TABLE IF NOT EXISTS audit_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_date TEXT NOT NULL,
    error_count INTEGER NOT NULL DEFAULT 0,
    avg_response_ms REAL,
    satisfaction_score REAL NOT NULL DEFAULT 0,
    issues_found TEXT NOT NULL DEFAULT '[]',
    recommendations TEXT NOT NULL DEFAULT '[]',
    log_file_size INTEGER NOT NULL DEFAULT 0,
    total_messages INTEGER NOT NULL DEFAULT 0,
    total_sessions INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_results_date ON audit_results(audit_date);

-- Code review findings awaiting a decision
CREATE TABLE IF NOT EXISTS code_review_suggestions (
    id TEXT PRIMARY KEY,
    file_path TEXT NOT NULL,
    line_number INTEGER,
    issue_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    description TEXT NOT NULL,
    suggested_fix TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    reviewed_at TEXT,
    resolved_at TEXT,
    user_feedback TEXT
);

CREATE INDEX IF NOT EXISTS idx_suggestions_status ON code_review_suggestions(status);
CREATE INDEX IF NOT EXISTS idx_suggestions_file ON code_review_suggestions(file_path);

-- Refactor proposals and their approval workflow
CREATE TABLE IF NOT EXISTS refactor_proposals (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    affected_files TEXT NOT NULL DEFAULT '[]',
    estimated_impact TEXT NOT NULL,
    estimated_time_minutes INTEGER NOT NULL DEFAULT 0,
    benefits TEXT,
    risks TEXT,
    rollback_plan TEXT,
    status TEXT NOT NULL DEFAULT 'proposed',
    created_at TEXT NOT NULL,
    approved_at TEXT,
    completed_at TEXT,
    user_feedback TEXT
);

CREATE INDEX IF NOT EXISTS idx_proposals_status ON refactor_proposals(status);

-- Recurring manual operations, one row per normalized operation name
CREATE TABLE IF NOT EXISTS capability_gaps (
    id TEXT PRIMARY KEY,
    operation_name TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    operation_description TEXT NOT NULL DEFAULT '',
    manual_count INTEGER NOT NULL DEFAULT 1,
    last_seen_at TEXT NOT NULL,
    automation_suggestion TEXT,
    estimated_time_saved_minutes INTEGER,
    priority TEXT NOT NULL DEFAULT 'low',
    status TEXT NOT NULL DEFAULT 'detected',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_gaps_normalized ON capability_gaps(normalized_name);
CREATE INDEX IF NOT EXISTS idx_gaps_status ON capability_gaps(status);

-- Audit trail: one row per action invocation
CREATE TABLE IF NOT EXISTS action_logs (
    id TEXT PRIMARY KEY,
    action_type TEXT NOT NULL,
    action_status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    duration_ms INTEGER,
    result_summary TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_action_logs_started ON action_logs(started_at);
CREATE INDEX IF NOT EXISTS idx_action_logs_status ON action_logs(action_status);

-- Content hashes of files already reviewed
CREATE TABLE IF NOT EXISTS reviewed_files (
    path TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    reviewed_at TEXT NOT NULL
);

-- Advisory lock held for the duration of one orchestration run
CREATE TABLE IF NOT EXISTS run_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);
"#;
