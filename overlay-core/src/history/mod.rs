//! history: local log of upload attempts
//!
//! Kept newest first and bounded (20 entries by default).  The log lives in
//! an injected [`Storage`] under a single key; a failed save is logged and
//! otherwise ignored, the in-memory log stays authoritative.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::{ApiError, ErrorKind, UploadReceipt};

pub const HISTORY_KEY: &str = "uploadHistory";
pub const DEFAULT_CAPACITY: usize = 20;

// ── Storage ──────────────────────────────────────────────────────────────────

/// Durable string key/value store.
pub trait Storage {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn store(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    values: HashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn store(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per key inside `dir`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("failed to read {}", path.display()))
    }

    fn store(&mut self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub outcome: Outcome,
    pub file_name: String,
    pub file_size: u64,
    /// RFC 3339, UTC.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_info: Option<UploadReceipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, rename = "errorType", skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl UploadRecord {
    fn new(outcome: Outcome, file_name: &str, file_size: u64) -> Self {
        Self {
            id: String::new(),
            outcome,
            file_name: file_name.to_string(),
            file_size,
            timestamp: String::new(),
            task_id: None,
            video_info: None,
            error: None,
            error_kind: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HistoryStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Percentage of attempts that succeeded, `0.0` when empty.
    pub success_rate: f64,
}

// ── Log ──────────────────────────────────────────────────────────────────────

pub struct UploadHistory<S: Storage> {
    storage: S,
    records: Vec<UploadRecord>,
    capacity: usize,
}

impl<S: Storage> UploadHistory<S> {
    /// Load the log from `storage`.  Unreadable or corrupt data yields an
    /// empty log.
    pub fn open(storage: S, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut records = match storage.load(HISTORY_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<UploadRecord>>(&raw) {
                Ok(records) => records,
                Err(err) => {
                    warn!(%err, "upload history is corrupt; starting empty");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("failed to load upload history: {err:#}");
                Vec::new()
            }
        };
        records.truncate(capacity);
        Self {
            storage,
            records,
            capacity,
        }
    }

    pub fn records(&self) -> &[UploadRecord] {
        &self.records
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn record_success(&mut self, file_name: &str, file_size: u64, receipt: &UploadReceipt) -> UploadRecord {
        let mut record = UploadRecord::new(Outcome::Success, file_name, file_size);
        record.task_id = Some(receipt.task_id.to_string());
        record.video_info = Some(receipt.clone());
        self.push(record)
    }

    pub fn record_error(&mut self, file_name: &str, file_size: u64, error: &ApiError) -> UploadRecord {
        let mut record = UploadRecord::new(Outcome::Error, file_name, file_size);
        record.error = Some(error.user_message());
        record.error_kind = Some(error.kind());
        self.push(record)
    }

    pub fn record_cancelled(&mut self, file_name: &str, file_size: u64) -> UploadRecord {
        self.push(UploadRecord::new(Outcome::Cancelled, file_name, file_size))
    }

    pub fn stats(&self) -> HistoryStats {
        let count = |outcome: Outcome| self.records.iter().filter(|r| r.outcome == outcome).count();
        let total = self.records.len();
        let successful = count(Outcome::Success);
        HistoryStats {
            total,
            successful,
            failed: count(Outcome::Error),
            cancelled: count(Outcome::Cancelled),
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 * 100.0 / total as f64
            },
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        self.records.clear();
        self.storage.remove(HISTORY_KEY)
    }

    fn push(&mut self, mut record: UploadRecord) -> UploadRecord {
        let now = Utc::now();
        record.id = self.next_id(now.timestamp_millis());
        record.timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);

        self.records.insert(0, record.clone());
        self.records.truncate(self.capacity);
        debug!(id = %record.id, outcome = ?record.outcome, "upload recorded");
        self.save();
        record
    }

    /// Millisecond timestamp, bumped past the newest id so ids stay unique
    /// when two attempts land in the same millisecond.
    fn next_id(&self, millis: i64) -> String {
        let newest = self
            .records
            .first()
            .and_then(|r| r.id.parse::<i64>().ok())
            .unwrap_or(i64::MIN);
        millis.max(newest.saturating_add(1)).to_string()
    }

    fn save(&mut self) {
        let saved = serde_json::to_string(&self.records)
            .context("failed to serialize upload history")
            .and_then(|json| self.storage.store(HISTORY_KEY, &json));
        if let Err(err) = saved {
            warn!("failed to save upload history: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TaskId;

    fn receipt() -> UploadReceipt {
        UploadReceipt {
            task_id: TaskId::parse("local_c0ffee").unwrap(),
            fps: Some(30.0),
            frame_count: Some(300),
            duration: Some(10.0),
            width: Some(1920),
            height: Some(1080),
        }
    }

    #[test]
    fn test_newest_first_and_bounded() {
        let mut history = UploadHistory::open(MemoryStorage::new(), 3);
        for i in 0..5 {
            history.record_cancelled(&format!("clip{i}.mp4"), i);
        }
        let names: Vec<_> = history.records().iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, vec!["clip4.mp4", "clip3.mp4", "clip2.mp4"]);

        let ids: Vec<i64> = history.records().iter().map(|r| r.id.parse().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] > w[1]), "ids must be unique: {ids:?}");
    }

    #[test]
    fn test_records_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut history = UploadHistory::open(FileStorage::new(dir.path()), DEFAULT_CAPACITY);
            history.record_success("line.mp4", 1024, &receipt());
            history.record_error("bad.mp4", 10, &ApiError::Backend {
                code: "UPLOAD_INVALID_FILE".to_string(),
            });
        }
        let history = UploadHistory::open(FileStorage::new(dir.path()), DEFAULT_CAPACITY);
        assert_eq!(history.records().len(), 2);
        let error = &history.records()[0];
        assert_eq!(error.outcome, Outcome::Error);
        assert_eq!(error.error_kind, Some(ErrorKind::FileValidation));
        let success = &history.records()[1];
        assert_eq!(success.task_id.as_deref(), Some("local_c0ffee"));
        assert_eq!(success.video_info.as_ref().and_then(|v| v.fps), Some(30.0));
    }

    #[test]
    fn test_wire_format_matches_browser_log() {
        let mut history = UploadHistory::open(MemoryStorage::new(), DEFAULT_CAPACITY);
        history.record_error("x.mp4", 5, &ApiError::Cancelled);
        let raw = history.storage().load(HISTORY_KEY).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entry = &value[0];
        assert_eq!(entry["type"], "error");
        assert_eq!(entry["fileName"], "x.mp4");
        assert_eq!(entry["fileSize"], 5);
        assert_eq!(entry["errorType"], "cancelled");
        assert!(entry.get("taskId").is_none());
        assert!(chrono::DateTime::parse_from_rfc3339(entry["timestamp"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_corrupt_storage_starts_empty() {
        let mut storage = MemoryStorage::new();
        storage.store(HISTORY_KEY, "{not json").unwrap();
        let history = UploadHistory::open(storage, DEFAULT_CAPACITY);
        assert!(history.records().is_empty());
    }

    #[test]
    fn test_stats_and_clear() {
        let mut history = UploadHistory::open(MemoryStorage::new(), DEFAULT_CAPACITY);
        history.record_success("a.mp4", 1, &receipt());
        history.record_success("b.mp4", 1, &receipt());
        history.record_error("c.mp4", 1, &ApiError::Cancelled);
        history.record_cancelled("d.mp4", 1);

        let stats = history.stats();
        assert_eq!((stats.total, stats.successful, stats.failed, stats.cancelled), (4, 2, 1, 1));
        assert_eq!(stats.success_rate, 50.0);

        history.clear().unwrap();
        assert_eq!(history.stats(), HistoryStats::default());
        assert_eq!(history.storage().load(HISTORY_KEY).unwrap(), None);
    }

    #[test]
    fn test_file_storage_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("nested"));
        assert_eq!(storage.load("k").unwrap(), None);
        storage.remove("k").unwrap();
        storage.store("k", "v").unwrap();
        assert_eq!(storage.load("k").unwrap().as_deref(), Some("v"));
    }
}
