//! Read-only access to the recorder's registry of scheduled recordings.
//!
//! The recorder keeps a JSON database of the form
//! `{"recordings": {"<n>": {...}}}`. Each entry is parsed on its own so a
//! single malformed record only hides that recording, never the whole file.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::RegistryError;

/// How long a parsed registry snapshot is reused before re-reading the file
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Lifecycle status of a recording as reported by the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RecordingStatus {
    /// Only completed and cancelled recordings are ever processed
    pub fn is_processable(self) -> bool {
        matches!(self, RecordingStatus::Completed | RecordingStatus::Cancelled)
    }
}

impl FromStr for RecordingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "completed" => Ok(RecordingStatus::Completed),
            "failed" => Ok(RecordingStatus::Failed),
            "cancelled" | "canceled" => Ok(RecordingStatus::Cancelled),
            "recording" | "in_progress" | "in-progress" => Ok(RecordingStatus::InProgress),
            other => Err(format!("unknown recording status '{}'", other)),
        }
    }
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordingStatus::InProgress => "in-progress",
            RecordingStatus::Completed => "completed",
            RecordingStatus::Failed => "failed",
            RecordingStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A recording as known to the registry
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingRecord {
    /// Stable id; raw captures are named `<id>.ts`
    pub id: String,
    pub title: String,
    /// Series or channel description, used as the destination folder
    pub series_info: String,
    pub channel: Option<String>,
    /// Keeps the recorder's UTC offset so names use its wall-clock time
    pub scheduled_start: Option<DateTime<FixedOffset>>,
    pub requested_duration_seconds: u64,
    /// None when the registry does not know; the pipeline probes the file instead
    pub actual_duration_seconds: Option<u64>,
    pub status: RecordingStatus,
    pub file_path: Option<PathBuf>,
}

impl RecordingRecord {
    /// None without a start time, or when the requested duration runs past
    /// what a timestamp can hold
    pub fn scheduled_end(&self) -> Option<DateTime<FixedOffset>> {
        let start = self.scheduled_start?;
        let secs = i64::try_from(self.requested_duration_seconds).ok()?;
        start.checked_add_signed(chrono::Duration::try_seconds(secs)?)
    }

    /// Channel name for embedded metadata, falling back to the description
    pub fn channel_name(&self) -> &str {
        self.channel.as_deref().unwrap_or(&self.series_info)
    }
}

/// Entry shape in the recorder's JSON database
#[derive(Debug, Deserialize)]
struct RawRecording {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    duration_seconds: Option<f64>,
    #[serde(default)]
    actual_duration_seconds: Option<f64>,
    #[serde(default)]
    actual_start: Option<String>,
    #[serde(default)]
    actual_end: Option<String>,
    status: String,
    #[serde(default)]
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDatabase {
    #[serde(default)]
    recordings: HashMap<String, serde_json::Value>,
}

fn parse_timestamp(field: &str, id: &str, value: Option<&str>) -> Option<DateTime<FixedOffset>> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(value) {
        Ok(dt) => Some(dt),
        Err(e) => {
            warn!("Recording {}: invalid {} '{}': {}", id, field, value, e);
            None
        }
    }
}

impl TryFrom<RawRecording> for RecordingRecord {
    type Error = String;

    fn try_from(raw: RawRecording) -> Result<Self, Self::Error> {
        let status: RecordingStatus = raw.status.parse()?;
        let id = raw.id;

        let scheduled_start = parse_timestamp("start_time", &id, raw.start_time.as_deref());
        let actual_start = parse_timestamp("actual_start", &id, raw.actual_start.as_deref());
        let actual_end = parse_timestamp("actual_end", &id, raw.actual_end.as_deref());

        let actual_duration_seconds = raw
            .actual_duration_seconds
            .filter(|d| *d >= 0.0)
            .map(|d| d.round() as u64)
            .or_else(|| match (actual_start, actual_end) {
                (Some(start), Some(end)) if end >= start => Some((end - start).num_seconds() as u64),
                _ => None,
            });

        Ok(RecordingRecord {
            title: raw.name.unwrap_or_else(|| "Unknown".to_string()),
            series_info: raw.description.unwrap_or_default(),
            channel: raw.channel,
            scheduled_start,
            requested_duration_seconds: raw.duration_seconds.unwrap_or(0.0).max(0.0).round() as u64,
            actual_duration_seconds,
            status,
            file_path: raw.file_path.filter(|p| !p.is_empty()).map(PathBuf::from),
            id,
        })
    }
}

/// Parse the recorder's database, dropping (and logging) entries that don't fit
pub fn parse_database(content: &str, path: &Path) -> Result<HashMap<String, RecordingRecord>, RegistryError> {
    let db: RawDatabase = serde_json::from_str(content).map_err(|source| RegistryError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut records = HashMap::with_capacity(db.recordings.len());
    for (key, value) in db.recordings {
        let raw: RawRecording = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Registry entry {} is unparseable: {}", key, e);
                continue;
            }
        };
        let id = raw.id.clone();
        match RecordingRecord::try_from(raw) {
            Ok(record) => {
                records.insert(record.id.clone(), record);
            }
            Err(e) => warn!("Recording {}: {}", id, e),
        }
    }
    Ok(records)
}

/// Read-only view of recording metadata
#[async_trait]
pub trait RecordingRegistry: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<RecordingRecord>, RegistryError>;

    async fn list_all(&self) -> Result<Vec<RecordingRecord>, RegistryError>;

    /// Find the record for a raw capture: by file stem first, then by recorded path
    async fn find_for_file(&self, path: &Path) -> Result<Option<RecordingRecord>, RegistryError> {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if let Some(record) = self.get(stem).await? {
                return Ok(Some(record));
            }
        }
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .find(|r| r.file_path.as_deref() == Some(path)))
    }
}

type Snapshot = Arc<HashMap<String, RecordingRecord>>;

/// Registry backed by the recorder's JSON file, cached for a short TTL
pub struct JsonRegistry {
    path: PathBuf,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Snapshot)>>,
}

impl JsonRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_ttl(path, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            cache: Mutex::new(None),
        }
    }

    async fn snapshot(&self) -> Result<Snapshot, RegistryError> {
        let mut cache = self.cache.lock().await;
        if let Some((loaded_at, snapshot)) = cache.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return Ok(snapshot.clone());
            }
        }

        let records = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => parse_database(&content, &self.path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Recordings database file not found: {}", self.path.display());
                HashMap::new()
            }
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        debug!("Refreshed recordings cache with {} recordings", records.len());

        let snapshot = Arc::new(records);
        *cache = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }
}

#[async_trait]
impl RecordingRegistry for JsonRegistry {
    async fn get(&self, id: &str) -> Result<Option<RecordingRecord>, RegistryError> {
        Ok(self.snapshot().await?.get(id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<RecordingRecord>, RegistryError> {
        Ok(self.snapshot().await?.values().cloned().collect())
    }
}

/// In-memory registry for tests and embedding
#[derive(Default)]
pub struct MemoryRegistry {
    records: std::sync::Mutex<HashMap<String, RecordingRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: RecordingRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(record.id.clone(), record);
        }
    }
}

#[async_trait]
impl RecordingRegistry for MemoryRegistry {
    async fn get(&self, id: &str) -> Result<Option<RecordingRecord>, RegistryError> {
        Ok(self.records.lock().ok().and_then(|r| r.get(id).cloned()))
    }

    async fn list_all(&self) -> Result<Vec<RecordingRecord>, RegistryError> {
        Ok(self
            .records
            .lock()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default())
    }
}
