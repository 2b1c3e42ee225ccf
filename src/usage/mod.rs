//! Usage signals read by the self-audit and gap analysis actions
//!
//! The assistant appends one JSON object per line to a usage log:
//!
//! ```text
//! {"ts":"2026-10-16T09:00:00Z","type":"message","session":"s1","response_ms":850}
//! {"ts":"2026-10-16T09:01:00Z","type":"error","message":"device poll timed out"}
//! {"ts":"2026-10-16T09:02:00Z","type":"feedback","score":4}
//! {"ts":"2026-10-16T09:03:00Z","type":"manual","operation":"restart bot","detail":"ssh + launchctl"}
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

/// Number of error messages kept as samples for the audit prompt
const MAX_ERROR_SAMPLES: usize = 10;

/// One observation of a task done by hand
#[derive(Debug, Clone, PartialEq)]
pub struct ManualOperation {
    pub name: String,
    pub description: String,
    pub seen_at: DateTime<Utc>,
}

/// Aggregated usage over the half-open window `[window_start, window_end)`
#[derive(Debug, Clone)]
pub struct UsageSnapshot {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_messages: u32,
    pub total_sessions: u32,
    pub error_count: u32,
    /// None when no message carried a latency
    pub avg_response_ms: Option<f64>,
    /// Mean feedback score, None without feedback
    pub satisfaction_score: Option<f64>,
    pub log_file_size: u64,
    pub recent_errors: Vec<String>,
    pub manual_operations: Vec<ManualOperation>,
}

impl UsageSnapshot {
    /// A snapshot with no activity
    pub fn empty(window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            window_start,
            window_end,
            total_messages: 0,
            total_sessions: 0,
            error_count: 0,
            avg_response_ms: None,
            satisfaction_score: None,
            log_file_size: 0,
            recent_errors: Vec::new(),
            manual_operations: Vec::new(),
        }
    }
}

/// Source of usage signals
pub trait UsageSource: Send + Sync {
    /// Aggregate everything observed at or after `since` and before `until`
    fn snapshot(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<UsageSnapshot>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UsageEvent {
    Message {
        ts: DateTime<Utc>,
        #[serde(default)]
        session: Option<String>,
        #[serde(default)]
        response_ms: Option<f64>,
    },
    Error {
        ts: DateTime<Utc>,
        #[serde(default)]
        message: String,
    },
    Feedback {
        ts: DateTime<Utc>,
        score: f64,
    },
    Manual {
        ts: DateTime<Utc>,
        operation: String,
        #[serde(default)]
        detail: String,
    },
}

impl UsageEvent {
    fn timestamp(&self) -> DateTime<Utc> {
        match self {
            UsageEvent::Message { ts, .. }
            | UsageEvent::Error { ts, .. }
            | UsageEvent::Feedback { ts, .. }
            | UsageEvent::Manual { ts, .. } => *ts,
        }
    }

    fn within(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> bool {
        let ts = self.timestamp();
        since <= ts && ts < until
    }
}

/// Usage log stored as JSON lines on disk
pub struct JsonlUsageLog {
    path: PathBuf,
}

impl JsonlUsageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl UsageSource for JsonlUsageLog {
    fn snapshot(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<UsageSnapshot> {
        if !self.path.exists() {
            tracing::debug!("Usage log {:?} does not exist", self.path);
            return Ok(UsageSnapshot::empty(since, until));
        }

        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to open usage log {:?}", self.path))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        let mut aggregate = Aggregate::new(since, until);
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read usage log {:?}", self.path))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageEvent>(&line) {
                Ok(event) => aggregate.add(event),
                Err(e) => tracing::debug!("Skipping usage log line {}: {}", n + 1, e),
            }
        }

        let mut snapshot = aggregate.finish();
        snapshot.log_file_size = size;
        Ok(snapshot)
    }
}

/// Fixed in-memory usage source
pub struct StaticUsage {
    snapshot: UsageSnapshot,
}

impl StaticUsage {
    pub fn new(snapshot: UsageSnapshot) -> Self {
        Self { snapshot }
    }
}

impl UsageSource for StaticUsage {
    fn snapshot(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<UsageSnapshot> {
        let mut snapshot = self.snapshot.clone();
        snapshot.window_start = since;
        snapshot.window_end = until;
        snapshot
            .manual_operations
            .retain(|op| since <= op.seen_at && op.seen_at < until);
        Ok(snapshot)
    }
}

/// Running totals over the events that fall inside one window
struct Aggregate {
    snapshot: UsageSnapshot,
    sessions: HashSet<String>,
    latency: Mean,
    score: Mean,
}

/// Running mean
#[derive(Debug, Default)]
struct Mean {
    sum: f64,
    count: u32,
}

impl Mean {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

impl Aggregate {
    fn new(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            snapshot: UsageSnapshot::empty(since, until),
            sessions: HashSet::new(),
            latency: Mean::default(),
            score: Mean::default(),
        }
    }

    fn add(&mut self, event: UsageEvent) {
        if !event.within(self.snapshot.window_start, self.snapshot.window_end) {
            return;
        }

        match event {
            UsageEvent::Message {
                session,
                response_ms,
                ..
            } => {
                self.snapshot.total_messages += 1;
                if let Some(session) = session {
                    self.sessions.insert(session);
                }
                if let Some(ms) = response_ms {
                    self.latency.add(ms);
                }
            }
            UsageEvent::Error { message, .. } => {
                self.snapshot.error_count += 1;
                if self.snapshot.recent_errors.len() == MAX_ERROR_SAMPLES {
                    self.snapshot.recent_errors.remove(0);
                }
                self.snapshot.recent_errors.push(message);
            }
            UsageEvent::Feedback { score, .. } => self.score.add(score),
            UsageEvent::Manual {
                ts,
                operation,
                detail,
            } => self.snapshot.manual_operations.push(ManualOperation {
                name: operation,
                description: detail,
                seen_at: ts,
            }),
        }
    }

    fn finish(mut self) -> UsageSnapshot {
        self.snapshot.total_sessions = self.sessions.len() as u32;
        self.snapshot.avg_response_ms = self.latency.value();
        self.snapshot.satisfaction_score = self.score.value();
        self.snapshot
    }
}
