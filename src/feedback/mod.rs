//! Feedback store - append-only log of validation verdicts.
//!
//! Backends:
//! - `memory`: in-process vector (non-persistent, for testing)
//! - `file`: JSON-lines file, one record per line
//! - `sqlite`: SQLite database indexed by worker and time
//!
//! # Invariants
//! - Records are never updated or deleted
//! - Appends are serialized; concurrent writers never lose or interleave records
//! - Query results are ordered by timestamp, then by append order

mod file;
mod memory;
mod sqlite;

pub use file::FileFeedbackStore;
pub use memory::InMemoryFeedbackStore;
pub use sqlite::SqliteFeedbackStore;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::runner::ExecutionResult;
use crate::task::TaskId;
use crate::validation::{ValidationVerdict, Verdict};

/// Persisted form of a verdict plus the worker's self-report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    pub task_id: TaskId,
    pub worker_id: String,
    pub attempt: u32,
    pub verdict: Verdict,
    pub feedback: String,
    pub detected_violations: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning: Option<String>,
    pub duration_ms: u64,
    /// Opaque annotations; never read by the pipeline itself
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl FeedbackRecord {
    pub fn new(request_id: Uuid, verdict: &ValidationVerdict, result: &ExecutionResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            task_id: verdict.task_id,
            worker_id: verdict.worker_id.clone(),
            attempt: result.attempt,
            verdict: verdict.verdict,
            feedback: verdict.feedback.clone(),
            detected_violations: verdict.detected_violations.clone(),
            timestamp: verdict.timestamp,
            learning: result.learning.clone(),
            duration_ms: result.duration_ms,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// The verdict this record was built from.
    pub fn to_verdict(&self) -> ValidationVerdict {
        ValidationVerdict {
            task_id: self.task_id,
            worker_id: self.worker_id.clone(),
            verdict: self.verdict,
            feedback: self.feedback.clone(),
            detected_violations: self.detected_violations.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Filter for store queries. Time range is `[since, until)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackQuery {
    pub worker_id: Option<String>,
    pub request_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl FeedbackQuery {
    pub fn worker(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: Some(worker_id.into()),
            ..Self::default()
        }
    }

    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn matches(&self, record: &FeedbackRecord) -> bool {
        self.worker_id.as_deref().map_or(true, |w| record.worker_id == w)
            && self.request_id.map_or(true, |r| record.request_id == r)
            && self.since.map_or(true, |s| record.timestamp >= s)
            && self.until.map_or(true, |u| record.timestamp < u)
    }
}

/// Verdict counts and recurring violations for one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub revise: usize,
    /// Most frequent violations, highest count first
    pub top_violations: Vec<(String, usize)>,
    pub last_learning: Option<String>,
}

/// How many violations `WorkerStats` keeps.
const TOP_VIOLATIONS: usize = 5;

impl WorkerStats {
    /// Summarize `records`, which must be ordered oldest first.
    pub fn from_records(worker_id: &str, records: &[FeedbackRecord]) -> Self {
        let mut stats = WorkerStats {
            worker_id: worker_id.to_string(),
            ..Self::default()
        };
        let mut violations: HashMap<&str, usize> = HashMap::new();

        for record in records.iter().filter(|r| r.worker_id == worker_id) {
            stats.total += 1;
            match record.verdict {
                Verdict::Accepted => stats.accepted += 1,
                Verdict::Rejected => stats.rejected += 1,
                Verdict::Revise => stats.revise += 1,
            }
            for v in &record.detected_violations {
                *violations.entry(v.as_str()).or_insert(0) += 1;
            }
            if record.learning.is_some() {
                stats.last_learning = record.learning.clone();
            }
        }

        let mut top: Vec<(String, usize)> = violations
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(TOP_VIOLATIONS);
        stats.top_violations = top;
        stats
    }

    /// Share of attempts that were accepted, 0.0 when there are none.
    pub fn acceptance_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.accepted as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("failed to open feedback store: {0}")]
    Open(String),

    #[error("failed to write feedback record: {0}")]
    Write(String),

    #[error("failed to read feedback records: {0}")]
    Read(String),
}

/// Feedback store trait - implemented by all storage backends.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Whether records survive a restart.
    fn is_persistent(&self) -> bool;

    /// Append one record. Returns only after the record is durable for
    /// persistent backends.
    async fn append(&self, record: FeedbackRecord) -> Result<(), StoreError>;

    /// Records matching `query`, oldest first.
    async fn query(&self, query: &FeedbackQuery) -> Result<Vec<FeedbackRecord>, StoreError>;

    async fn by_worker(&self, worker_id: &str) -> Result<Vec<FeedbackRecord>, StoreError> {
        self.query(&FeedbackQuery::worker(worker_id)).await
    }

    async fn in_range(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<FeedbackRecord>, StoreError> {
        self.query(&FeedbackQuery::default().between(since, until)).await
    }

    async fn by_worker_in_range(
        &self,
        worker_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<FeedbackRecord>, StoreError> {
        self.query(&FeedbackQuery::worker(worker_id).between(since, until))
            .await
    }

    async fn by_request(&self, request_id: Uuid) -> Result<Vec<FeedbackRecord>, StoreError> {
        self.query(&FeedbackQuery {
            request_id: Some(request_id),
            ..FeedbackQuery::default()
        })
        .await
    }

    async fn worker_stats(&self, worker_id: &str) -> Result<WorkerStats, StoreError> {
        let records = self.by_worker(worker_id).await?;
        Ok(WorkerStats::from_records(worker_id, &records))
    }
}

/// Sort records oldest first, keeping append order for equal timestamps.
pub(crate) fn sort_records(records: &mut [FeedbackRecord]) {
    records.sort_by_key(|r| r.timestamp);
}

/// Feedback store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStoreKind {
    Memory,
    File,
    #[default]
    Sqlite,
}

impl FromStr for FeedbackStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" | "jsonl" => Ok(Self::File),
            "sqlite" | "db" => Ok(Self::Sqlite),
            other => Err(format!(
                "unknown feedback store '{}' (expected memory, file or sqlite)",
                other
            )),
        }
    }
}

/// Create a feedback store of the given kind under `base_dir`.
pub async fn create_feedback_store(
    kind: FeedbackStoreKind,
    base_dir: PathBuf,
    fsync: bool,
) -> Result<Arc<dyn FeedbackStore>, StoreError> {
    let store: Arc<dyn FeedbackStore> = match kind {
        FeedbackStoreKind::Memory => Arc::new(InMemoryFeedbackStore::new()),
        FeedbackStoreKind::File => Arc::new(FileFeedbackStore::open(base_dir, fsync).await?),
        FeedbackStoreKind::Sqlite => Arc::new(SqliteFeedbackStore::open(base_dir).await?),
    };
    tracing::info!(kind = ?kind, persistent = store.is_persistent(), "Feedback store ready");
    Ok(store)
}
