//! SQLite-backed feedback store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{FeedbackQuery, FeedbackRecord, FeedbackStore, StoreError};
use crate::task::TaskId;

const DB_FILE: &str = "feedback.db";

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS feedback (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    request_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    worker_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    verdict TEXT NOT NULL,
    feedback TEXT NOT NULL,
    violations TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    learning TEXT,
    duration_ms INTEGER NOT NULL,
    tags TEXT
);

CREATE INDEX IF NOT EXISTS idx_feedback_worker_time ON feedback(worker_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_feedback_time ON feedback(timestamp);
CREATE INDEX IF NOT EXISTS idx_feedback_request ON feedback(request_id);
"#;

const SELECT_COLUMNS: &str = "SELECT id, request_id, task_id, worker_id, attempt, verdict, feedback,
        violations, timestamp, learning, duration_ms, tags FROM feedback";

/// Fixed-width timestamp text; lexical order equals time order.
fn ts_key(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub struct SqliteFeedbackStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SqliteFeedbackStore {
    pub async fn open(base_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| StoreError::Open(format!("create {}: {}", base_dir.display(), e)))?;
        let db_path = base_dir.join(DB_FILE);

        let path = db_path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .map_err(|e| StoreError::Open(format!("open {}: {}", path.display(), e)))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| StoreError::Open(format!("schema: {}", e)))?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Open(format!("join error: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Result<FeedbackRecord, String>> {
    let id: String = row.get(0)?;
    let request_id: String = row.get(1)?;
    let task_id: String = row.get(2)?;
    let worker_id: String = row.get(3)?;
    let attempt: i64 = row.get(4)?;
    let verdict: String = row.get(5)?;
    let feedback: String = row.get(6)?;
    let violations: String = row.get(7)?;
    let timestamp: String = row.get(8)?;
    let learning: Option<String> = row.get(9)?;
    let duration_ms: i64 = row.get(10)?;
    let tags: Option<String> = row.get(11)?;

    Ok((|| -> Result<FeedbackRecord, String> {
        Ok(FeedbackRecord {
            id: Uuid::parse_str(&id).map_err(|e| e.to_string())?,
            request_id: Uuid::parse_str(&request_id).map_err(|e| e.to_string())?,
            task_id: TaskId::from_uuid(Uuid::parse_str(&task_id).map_err(|e| e.to_string())?),
            worker_id,
            attempt: attempt as u32,
            verdict: verdict.parse()?,
            feedback,
            detected_violations: serde_json::from_str::<BTreeSet<String>>(&violations)
                .map_err(|e| e.to_string())?,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| e.to_string())?
                .with_timezone(&Utc),
            learning,
            duration_ms: duration_ms as u64,
            tags: match tags {
                Some(json) => serde_json::from_str::<BTreeMap<String, String>>(&json)
                    .map_err(|e| e.to_string())?,
                None => BTreeMap::new(),
            },
        })
    })())
}

#[async_trait]
impl FeedbackStore for SqliteFeedbackStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn append(&self, record: FeedbackRecord) -> Result<(), StoreError> {
        let violations = serde_json::to_string(&record.detected_violations)
            .map_err(|e| StoreError::Write(e.to_string()))?;
        let tags = if record.tags.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&record.tags).map_err(|e| StoreError::Write(e.to_string()))?)
        };

        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO feedback (id, request_id, task_id, worker_id, attempt, verdict, feedback,
                                       violations, timestamp, learning, duration_ms, tags)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id.to_string(),
                    record.request_id.to_string(),
                    record.task_id.to_string(),
                    record.worker_id,
                    record.attempt as i64,
                    record.verdict.as_str(),
                    record.feedback,
                    violations,
                    ts_key(&record.timestamp),
                    record.learning,
                    record.duration_ms as i64,
                    tags,
                ],
            )
            .map_err(|e| StoreError::Write(e.to_string()))?;
            Ok::<_, StoreError>(())
        })
        .await
        .map_err(|e| StoreError::Write(format!("join error: {}", e)))?
    }

    async fn query(&self, query: &FeedbackQuery) -> Result<Vec<FeedbackRecord>, StoreError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(worker_id) = &query.worker_id {
            clauses.push("worker_id = ?");
            values.push(Value::Text(worker_id.clone()));
        }
        if let Some(request_id) = query.request_id {
            clauses.push("request_id = ?");
            values.push(Value::Text(request_id.to_string()));
        }
        if let Some(since) = &query.since {
            clauses.push("timestamp >= ?");
            values.push(Value::Text(ts_key(since)));
        }
        if let Some(until) = &query.until {
            clauses.push("timestamp < ?");
            values.push(Value::Text(ts_key(until)));
        }

        let mut sql = SELECT_COLUMNS.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp ASC, seq ASC");

        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::Read(e.to_string()))?;
            let rows = stmt
                .query_map(params_from_iter(values), row_to_record)
                .map_err(|e| StoreError::Read(e.to_string()))?;

            let mut records = Vec::new();
            for row in rows {
                match row.map_err(|e| StoreError::Read(e.to_string()))? {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!("Skipping unreadable feedback row: {}", e),
                }
            }
            Ok::<_, StoreError>(records)
        })
        .await
        .map_err(|e| StoreError::Read(format!("join error: {}", e)))?
    }
}
