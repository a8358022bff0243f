//! Durable record of every raw capture the daemon has finished with.
//!
//! One entry per source key (the registry id). The JSON store rewrites the
//! whole file on each commit via a temp file and rename, so a crash leaves
//! either the previous ledger or the new one, never a torn write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::LedgerError;

const LEDGER_VERSION: u32 = 1;

/// Outcome of processing one recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Succeeded,
    SkippedThreshold,
    SkippedCancelledPolicy,
    Failed,
    /// Written just before an artifact is moved to `destination_path`.
    /// Not terminal: it only survives if the process died before the
    /// real outcome was committed.
    Relocating,
}

/// Whether the media server confirmed the new artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationState {
    /// Nothing to notify (skips, failures) or no media server configured
    #[default]
    NotApplicable,
    Confirmed,
    /// Timed out or unreachable; retried by the reconciliation pass
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEntry {
    pub source_file_key: String,
    pub source_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<PathBuf>,
    pub processed_at: DateTime<Utc>,
    pub outcome: Outcome,
    /// Only meaningful for failures: the next scan may try again
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub notification: NotificationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProcessedEntry {
    pub fn new(key: impl Into<String>, source_path: impl Into<PathBuf>, outcome: Outcome) -> Self {
        Self {
            source_file_key: key.into(),
            source_path: source_path.into(),
            destination_path: None,
            processed_at: Utc::now(),
            outcome,
            retryable: false,
            notification: NotificationState::NotApplicable,
            reason: None,
        }
    }

    pub fn with_destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination_path = Some(path.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_notification(mut self, state: NotificationState) -> Self {
        self.notification = state;
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// An existing entry blocks reprocessing unless it is a retryable
    /// failure or an interrupted relocation
    pub fn permits_reprocess(&self) -> bool {
        match self.outcome {
            Outcome::Failed => self.retryable,
            Outcome::Relocating => true,
            _ => false,
        }
    }

    /// Destination an interrupted earlier attempt was placing its artifact at
    pub fn interrupted_destination(&self) -> Option<&Path> {
        if self.outcome == Outcome::Relocating {
            self.destination_path.as_deref()
        } else {
            None
        }
    }
}

/// Keyed store of processed entries
#[async_trait]
pub trait ProcessedLedger: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ProcessedEntry>, LedgerError>;

    /// Insert or replace the entry for `entry.source_file_key`
    async fn put(&self, entry: ProcessedEntry) -> Result<(), LedgerError>;

    async fn list_all(&self) -> Result<Vec<ProcessedEntry>, LedgerError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    entries: Vec<ProcessedEntry>,
}

/// Ledger persisted as a single JSON document
pub struct JsonLedger {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, ProcessedEntry>>,
}

impl JsonLedger {
    /// Load every prior outcome. A missing file is an empty ledger;
    /// an unreadable or corrupt one is an error the caller must not ignore.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => Self::decode(&path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No ledger at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(source) => return Err(LedgerError::Read { path, source }),
        };

        debug!("Loaded {} ledger entries from {}", entries.len(), path.display());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn decode(path: &Path, content: &str) -> Result<BTreeMap<String, ProcessedEntry>, LedgerError> {
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let file: LedgerFile = serde_json::from_str(content).map_err(|source| LedgerError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        if file.version != LEDGER_VERSION {
            return Err(LedgerError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: file.version,
            });
        }
        Ok(file
            .entries
            .into_iter()
            .map(|e| (e.source_file_key.clone(), e))
            .collect())
    }

    async fn persist(&self, entries: &BTreeMap<String, ProcessedEntry>) -> Result<(), LedgerError> {
        let file = LedgerFile {
            version: LEDGER_VERSION,
            entries: entries.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let write_err = |source| LedgerError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("ledger.json");
        let temp_path = self
            .path
            .with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let result: std::io::Result<()> = async {
            let mut out = tokio::fs::File::create(&temp_path).await?;
            out.write_all(&json).await?;
            out.sync_all().await?;
            drop(out);
            tokio::fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(write_err(e));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessedLedger for JsonLedger {
    async fn get(&self, key: &str) -> Result<Option<ProcessedEntry>, LedgerError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, entry: ProcessedEntry) -> Result<(), LedgerError> {
        // Held across the write: one writer at a time, memory only changes once disk has.
        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        next.insert(entry.source_file_key.clone(), entry);
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<ProcessedEntry>, LedgerError> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }
}

/// In-memory ledger for tests and embedding
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<BTreeMap<String, ProcessedEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessedLedger for MemoryLedger {
    async fn get(&self, key: &str) -> Result<Option<ProcessedEntry>, LedgerError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, entry: ProcessedEntry) -> Result<(), LedgerError> {
        self.entries
            .lock()
            .await
            .insert(entry.source_file_key.clone(), entry);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<ProcessedEntry>, LedgerError> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }
}

/// Result of a guarded commit
#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    Written,
    /// A settled entry already exists for the key; nothing was written
    AlreadySettled(ProcessedEntry),
}

/// Serializes every check-then-write against the ledger
pub struct Committer {
    ledger: Arc<dyn ProcessedLedger>,
    lock: Mutex<()>,
}

impl Committer {
    pub fn new(ledger: Arc<dyn ProcessedLedger>) -> Self {
        Self {
            ledger,
            lock: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn ProcessedLedger> {
        &self.ledger
    }

    /// The settled entry for `key`, if the key must not be processed again
    pub async fn settled(&self, key: &str) -> Result<Option<ProcessedEntry>, LedgerError> {
        Ok(self
            .ledger
            .get(key)
            .await?
            .filter(|e| !e.permits_reprocess()))
    }

    /// Write `entry` unless a settled entry for the same key already exists
    pub async fn commit(&self, entry: ProcessedEntry) -> Result<CommitResult, LedgerError> {
        let _guard = self.lock.lock().await;
        if let Some(existing) = self.settled(&entry.source_file_key).await? {
            return Ok(CommitResult::AlreadySettled(existing));
        }
        self.ledger.put(entry).await?;
        Ok(CommitResult::Written)
    }

    /// Change the notification state of an existing succeeded entry
    pub async fn mark_notification(&self, key: &str, state: NotificationState) -> Result<bool, LedgerError> {
        let _guard = self.lock.lock().await;
        match self.ledger.get(key).await? {
            Some(mut entry) if entry.outcome == Outcome::Succeeded => {
                if entry.notification == state {
                    return Ok(false);
                }
                entry.notification = state;
                self.ledger.put(entry).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, outcome: Outcome) -> ProcessedEntry {
        ProcessedEntry::new(key, format!("/recordings/{}.ts", key), outcome)
    }

    #[tokio::test]
    async fn test_json_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remux.json");

        let ledger = JsonLedger::open(&path).await.unwrap();
        ledger
            .put(entry("a", Outcome::Succeeded).with_destination("/remux/Show/a.mkv"))
            .await
            .unwrap();
        ledger.put(entry("b", Outcome::SkippedThreshold)).await.unwrap();
        drop(ledger);

        let reopened = JsonLedger::open(&path).await.unwrap();
        let all = reopened.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        let a = reopened.get("a").await.unwrap().unwrap();
        assert_eq!(a.outcome, Outcome::Succeeded);
        assert_eq!(a.destination_path, Some(PathBuf::from("/remux/Show/a.mkv")));
    }

    #[tokio::test]
    async fn test_json_ledger_put_replaces_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonLedger::open(dir.path().join("remux.json")).await.unwrap();

        ledger.put(entry("a", Outcome::Failed).retryable(true)).await.unwrap();
        ledger.put(entry("a", Outcome::Succeeded)).await.unwrap();

        let all = ledger.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].outcome, Outcome::Succeeded);
    }

    #[tokio::test]
    async fn test_corrupt_ledger_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remux.json");
        std::fs::write(&path, "{\"version\": 1, \"entries\": [").unwrap();

        assert!(matches!(
            JsonLedger::open(&path).await,
            Err(LedgerError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_version_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remux.json");
        std::fs::write(&path, r#"{"version": 7, "entries": []}"#).unwrap();

        assert!(matches!(
            JsonLedger::open(&path).await,
            Err(LedgerError::UnsupportedVersion { version: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_ledger_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonLedger::open(dir.path().join("remux.json")).await.unwrap();
        for key in ["a", "b", "c"] {
            ledger.put(entry(key, Outcome::Succeeded)).await.unwrap();
        }

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["remux.json".to_string()]);
    }

    #[tokio::test]
    async fn test_committer_is_idempotent() {
        let committer = Committer::new(Arc::new(MemoryLedger::new()));

        let first = committer.commit(entry("a", Outcome::Succeeded)).await.unwrap();
        assert_eq!(first, CommitResult::Written);

        let second = committer.commit(entry("a", Outcome::Failed)).await.unwrap();
        assert!(matches!(second, CommitResult::AlreadySettled(e) if e.outcome == Outcome::Succeeded));
        assert_eq!(committer.ledger().list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_can_be_overwritten() {
        let committer = Committer::new(Arc::new(MemoryLedger::new()));

        committer
            .commit(entry("a", Outcome::Failed).retryable(true))
            .await
            .unwrap();
        assert!(committer.settled("a").await.unwrap().is_none());

        let result = committer.commit(entry("a", Outcome::Succeeded)).await.unwrap();
        assert_eq!(result, CommitResult::Written);
        assert!(committer.settled("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_relocation_intent_is_not_settled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remux.json");
        let ledger: Arc<dyn ProcessedLedger> = Arc::new(JsonLedger::open(&path).await.unwrap());
        let committer = Committer::new(ledger);

        committer
            .commit(entry("a", Outcome::Relocating).with_destination("/remux/Show/a.mkv"))
            .await
            .unwrap();
        assert!(committer.settled("a").await.unwrap().is_none());

        let reopened = JsonLedger::open(&path).await.unwrap();
        let intent = reopened.get("a").await.unwrap().unwrap();
        assert_eq!(intent.interrupted_destination(), Some(Path::new("/remux/Show/a.mkv")));
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"relocating\""));

        let result = committer
            .commit(entry("a", Outcome::Succeeded).with_destination("/remux/Show/a.mkv"))
            .await
            .unwrap();
        assert_eq!(result, CommitResult::Written);
        let done = committer.settled("a").await.unwrap().unwrap();
        assert_eq!(done.interrupted_destination(), None);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_settled() {
        let committer = Committer::new(Arc::new(MemoryLedger::new()));
        committer.commit(entry("a", Outcome::Failed)).await.unwrap();
        assert!(committer.settled("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_commits_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let ledger: Arc<dyn ProcessedLedger> =
            Arc::new(JsonLedger::open(dir.path().join("remux.json")).await.unwrap());
        let committer = Arc::new(Committer::new(ledger));

        let mut set = tokio::task::JoinSet::new();
        for i in 0..20 {
            let committer = committer.clone();
            set.spawn(async move {
                committer
                    .commit(entry(&format!("k{}", i % 5), Outcome::Succeeded))
                    .await
                    .unwrap()
            });
        }
        let mut written = 0;
        while let Some(res) = set.join_next().await {
            if res.unwrap() == CommitResult::Written {
                written += 1;
            }
        }
        assert_eq!(written, 5);

        let reopened = JsonLedger::open(dir.path().join("remux.json")).await.unwrap();
        assert_eq!(reopened.list_all().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_mark_notification_updates_in_place() {
        let committer = Committer::new(Arc::new(MemoryLedger::new()));
        committer
            .commit(entry("a", Outcome::Succeeded).with_notification(NotificationState::Incomplete))
            .await
            .unwrap();
        committer.commit(entry("b", Outcome::SkippedThreshold)).await.unwrap();

        assert!(committer.mark_notification("a", NotificationState::Confirmed).await.unwrap());
        assert!(!committer.mark_notification("b", NotificationState::Confirmed).await.unwrap());

        let a = committer.ledger().get("a").await.unwrap().unwrap();
        assert_eq!(a.notification, NotificationState::Confirmed);
        assert_eq!(committer.ledger().list_all().await.unwrap().len(), 2);
    }
}
