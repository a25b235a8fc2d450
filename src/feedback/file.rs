//! JSON-lines feedback store.
//!
//! Each record is one line of `feedback.jsonl`. Appends hold an in-process
//! mutex and an exclusive file lock, so several processes sharing the
//! directory never interleave partial lines.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use super::{sort_records, FeedbackQuery, FeedbackRecord, FeedbackStore, StoreError};

const FILE_NAME: &str = "feedback.jsonl";

#[derive(Clone)]
pub struct FileFeedbackStore {
    path: PathBuf,
    fsync: bool,
    records: Arc<RwLock<Vec<FeedbackRecord>>>,
    write_lock: Arc<Mutex<()>>,
}

impl FileFeedbackStore {
    /// Open (or create) the store under `base_dir`, loading existing records.
    ///
    /// Malformed lines are skipped with a warning.
    pub async fn open(base_dir: PathBuf, fsync: bool) -> Result<Self, StoreError> {
        fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| StoreError::Open(format!("create {}: {}", base_dir.display(), e)))?;
        let path = base_dir.join(FILE_NAME);

        let records = match fs::read_to_string(&path).await {
            Ok(text) => parse_lines(&path, &text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(StoreError::Open(format!("read {}: {}", path.display(), err)));
            }
        };
        tracing::debug!(path = %path.display(), records = records.len(), "Loaded feedback file");

        Ok(Self {
            path,
            fsync,
            records: Arc::new(RwLock::new(records)),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_lines(path: &Path, text: &str) -> Vec<FeedbackRecord> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Skipping malformed line {} in {}: {}", idx + 1, path.display(), e);
                None
            }
        })
        .collect()
}

fn append_line(path: &Path, line: &[u8], fsync: bool) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    let written = file.write_all(line).and_then(|_| {
        if fsync {
            file.sync_data()
        } else {
            Ok(())
        }
    });
    let _ = FileExt::unlock(&file);
    written
}

#[async_trait]
impl FeedbackStore for FileFeedbackStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn append(&self, record: FeedbackRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&record).map_err(|e| StoreError::Write(e.to_string()))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        let fsync = self.fsync;
        tokio::task::spawn_blocking(move || append_line(&path, &line, fsync))
            .await
            .map_err(|e| StoreError::Write(format!("join error: {}", e)))?
            .map_err(|e| StoreError::Write(format!("{}: {}", self.path.display(), e)))?;

        self.records.write().await.push(record);
        Ok(())
    }

    async fn query(&self, query: &FeedbackQuery) -> Result<Vec<FeedbackRecord>, StoreError> {
        let mut matched: Vec<FeedbackRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        sort_records(&mut matched);
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::tests::{exercise_store, record};
    use crate::validation::Verdict;
    use chrono::Utc;

    #[tokio::test]
    async fn test_file_store_behaviour() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileFeedbackStore::open(dir.path().to_path_buf(), true).await.unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rec = record("alpha", Verdict::Revise, Utc::now()).with_tag("k", "v");
        {
            let store = FileFeedbackStore::open(dir.path().to_path_buf(), false).await.unwrap();
            store.append(rec.clone()).await.unwrap();
        }
        let reopened = FileFeedbackStore::open(dir.path().to_path_buf(), false).await.unwrap();
        assert_eq!(reopened.by_worker("alpha").await.unwrap(), vec![rec]);
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interleave() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileFeedbackStore::open(dir.path().to_path_buf(), false).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..40 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut rec = record(&format!("w{}", i % 5), Verdict::Accepted, Utc::now());
                rec.feedback = "x".repeat(4096);
                store.append(rec).await.unwrap();
            }));
        }
        futures::future::join_all(handles).await;

        let text = std::fs::read_to_string(store.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 40);
        for line in lines {
            serde_json::from_str::<FeedbackRecord>(line).expect("intact line");
        }
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rec = record("alpha", Verdict::Accepted, Utc::now());
        let contents = format!("{{not json\n{}\n", serde_json::to_string(&rec).unwrap());
        std::fs::write(dir.path().join(FILE_NAME), contents).unwrap();

        let store = FileFeedbackStore::open(dir.path().to_path_buf(), false).await.unwrap();
        assert_eq!(store.by_worker("alpha").await.unwrap(), vec![rec]);
    }

    #[tokio::test]
    async fn test_write_failure_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileFeedbackStore::open(dir.path().to_path_buf(), false).await.unwrap();
        // A directory where the file should be makes every append fail.
        std::fs::create_dir(store.path()).unwrap();
        let err = store
            .append(record("alpha", Verdict::Accepted, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Write(_)));
        assert!(store.by_worker("alpha").await.unwrap().is_empty());
    }
}
