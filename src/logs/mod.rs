//! Status log storage on the reporter node.
//!
//! One file per received report, `<epoch-seconds>.json`, holding the status
//! body exactly as it came off the queue. Two reports in the same second
//! share a file and the later one wins.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::config::Settings;
use crate::errors::handlers::report_warning;
use crate::errors::LogStoreError;

const EXTENSION: &str = "json";

/// When stored reports are thrown away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Age thresholds in seconds; older than any one of them is stale.
    pub max_age: Vec<u64>,
    /// Keep at most this many entries, newest first.
    pub count: Option<usize>,
}

impl RetentionPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_age: settings.retention_thresholds(),
            count: settings.logs.count,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.max_age.is_empty() || self.count.is_some()
    }

    fn is_stale(&self, timestamp: i64, now: i64) -> bool {
        // Entries from the future have no age.
        let Ok(age) = u64::try_from(now.saturating_sub(timestamp)) else {
            return false;
        };
        self.max_age.iter().any(|limit| age > *limit)
    }
}

#[derive(Debug, Clone)]
pub struct LogStore {
    dir: PathBuf,
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `body` under the current time.
    pub async fn append(&self, body: &[u8]) -> Result<PathBuf, LogStoreError> {
        self.append_at(chrono::Utc::now().timestamp(), body).await
    }

    pub async fn append_at(&self, timestamp: i64, body: &[u8]) -> Result<PathBuf, LogStoreError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| self.io_error(&self.dir, source))?;

        let path = self.dir.join(format!("{timestamp}.{EXTENSION}"));
        info!("Creating log file: {}", path.display());
        fs::write(&path, body)
            .await
            .map_err(|source| self.io_error(&path, source))?;
        Ok(path)
    }

    pub async fn retire(&self, policy: &RetentionPolicy) -> Result<Vec<PathBuf>, LogStoreError> {
        self.retire_at(policy, chrono::Utc::now().timestamp()).await
    }

    /// Remove every entry that is stale at `now` or ranks past the retained
    /// count. A failed removal is reported and skipped. Returns what was
    /// actually removed.
    pub async fn retire_at(
        &self,
        policy: &RetentionPolicy,
        now: i64,
    ) -> Result<Vec<PathBuf>, LogStoreError> {
        if !policy.is_active() {
            return Ok(Vec::new());
        }

        let mut entries = self.entries().await?;
        // Newest first.
        entries.sort_by(|a, b| b.0.cmp(&a.0));

        let keep = policy.count.unwrap_or(usize::MAX);
        let doomed = entries
            .into_iter()
            .enumerate()
            .filter(|(rank, (timestamp, _))| *rank >= keep || policy.is_stale(*timestamp, now))
            .map(|(_, (_, path))| path);

        let mut removed = Vec::new();
        for path in doomed {
            info!("Removing log '{}'", path.display());
            match fs::remove_file(&path).await {
                Ok(()) => removed.push(path),
                Err(e) => report_warning(&format!("Error removing log '{}': {e}", path.display())),
            }
        }
        Ok(removed)
    }

    /// Every readable entry, keyed by its timestamp. Unreadable or non-JSON
    /// entries are reported and left out.
    pub async fn dump(&self) -> Result<Value, LogStoreError> {
        let mut logs = Map::new();

        for (timestamp, path) in self.entries().await? {
            let parsed = fs::read(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_slice::<Value>(&raw).map_err(|e| e.to_string()));

            match parsed {
                Ok(value) => {
                    logs.insert(timestamp.to_string(), value);
                }
                Err(e) => {
                    report_warning(&format!("Error reading log '{}': {e}", path.display()))
                }
            }
        }

        Ok(Value::Object(logs))
    }

    /// `(timestamp, path)` for every `<int>.json` file; a missing directory
    /// is simply empty.
    async fn entries(&self) -> Result<Vec<(i64, PathBuf)>, LogStoreError> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(&self.dir, source)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|source| self.io_error(&self.dir, source))?
        {
            let path = entry.path();
            let timestamp = path
                .extension()
                .filter(|ext| *ext == EXTENSION)
                .and(path.file_stem())
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<i64>().ok());

            match timestamp {
                Some(timestamp) => entries.push((timestamp, path)),
                None => debug!("Ignoring stray file {}", path.display()),
            }
        }
        Ok(entries)
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> LogStoreError {
        LogStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
