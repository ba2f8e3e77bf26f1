use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use toolcore::{ExecutionRecord, HistoryFilter};

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("History IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt history line {line}: {source}")]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },

    #[error("Failed to encode record: {0}")]
    Encode(serde_json::Error),
}

/// Append-only store of finished runs.
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    async fn record(&self, record: ExecutionRecord) -> Result<(), HistoryError>;

    /// Matching records, newest first, at most `limit`.
    async fn query(
        &self,
        filter: &HistoryFilter,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, HistoryError>;
}

fn newest_first(mut records: Vec<ExecutionRecord>, filter: &HistoryFilter, limit: usize) -> Vec<ExecutionRecord> {
    records.retain(|r| filter.matches(r));
    // Stable sort after reversing keeps later appends first on equal timestamps.
    records.reverse();
    records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    records.truncate(limit);
    records
}

#[derive(Default)]
pub struct InMemoryHistory {
    records: RwLock<Vec<ExecutionRecord>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl HistoryRecorder for InMemoryHistory {
    async fn record(&self, record: ExecutionRecord) -> Result<(), HistoryError> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn query(
        &self,
        filter: &HistoryFilter,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, HistoryError> {
        let records = self.records.read().await.clone();
        Ok(newest_first(records, filter, limit))
    }
}

/// One JSON record per line, appended to a single file.
pub struct JsonlHistory {
    path: PathBuf,
    // Serializes appends from concurrent runs.
    write_lock: Mutex<()>,
}

impl JsonlHistory {
    /// Creates the parent directory if needed. The file itself appears on first record.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<ExecutionRecord>, HistoryError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|source| HistoryError::Corrupt {
                line: idx + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl HistoryRecorder for JsonlHistory {
    async fn record(&self, record: ExecutionRecord) -> Result<(), HistoryError> {
        let mut line = serde_json::to_string(&record).map_err(HistoryError::Encode)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query(
        &self,
        filter: &HistoryFilter,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, HistoryError> {
        let records = self.read_all().await?;
        Ok(newest_first(records, filter, limit))
    }
}
