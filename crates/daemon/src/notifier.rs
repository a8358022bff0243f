//! Media server notification: rescan the library folder that received a new
//! artifact, wait for the item to show up, then push its metadata.
//!
//! Notification never fails the pipeline. Anything short of a confirmed
//! metadata push comes back as [`NotifyResult::TimedOut`] and the ledger
//! entry is flagged for a later reconciliation pass.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::PlexConfig;
use crate::error::NotifyError;
use crate::registry::RecordingRecord;

/// Per-request limit so a single poll can never hang
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded poll schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    pub fn from_config(cfg: &PlexConfig) -> Self {
        Self::new(cfg.scan_count, cfg.scan_interval())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyResult {
    Confirmed,
    TimedOut(String),
}

impl NotifyResult {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, NotifyResult::Confirmed)
    }
}

/// The handful of media server calls the notifier needs. Each is a single
/// bounded request and safe to repeat.
#[async_trait]
pub trait MediaServer: Send + Sync {
    /// Section id of the library called `library`, if there is one
    async fn section_id(&self, library: &str) -> Result<Option<String>, NotifyError>;

    async fn is_scanning(&self, section: &str) -> Result<bool, NotifyError>;

    /// Ask the server to rescan `folder` (server-side path)
    async fn refresh(&self, section: &str, folder: &Path) -> Result<(), NotifyError>;

    /// Item id whose media file is `file` (server-side path)
    async fn find_item(&self, section: &str, file: &Path) -> Result<Option<String>, NotifyError>;

    async fn update_metadata(&self, item: &str, fields: &[(String, String)]) -> Result<(), NotifyError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "MediaContainer")]
    media_container: T,
}

#[derive(Debug, Default, Deserialize)]
struct SectionList {
    #[serde(rename = "Directory", default)]
    directories: Vec<Section>,
}

#[derive(Debug, Clone, Deserialize)]
struct Section {
    key: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    refreshing: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ItemList {
    #[serde(rename = "Metadata", default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(rename = "ratingKey")]
    rating_key: String,
    #[serde(rename = "Media", default)]
    media: Vec<Media>,
}

#[derive(Debug, Deserialize)]
struct Media {
    #[serde(rename = "Part", default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    file: String,
}

fn section_by_title<'a>(list: &'a SectionList, title: &str) -> Option<&'a Section> {
    list.directories.iter().find(|s| s.title == title)
}

fn item_for_file(list: &ItemList, file: &Path) -> Option<String> {
    list.items
        .iter()
        .find(|item| {
            item.media
                .iter()
                .flat_map(|m| m.parts.iter())
                .any(|part| Path::new(&part.file) == file)
        })
        .map(|item| item.rating_key.clone())
}

/// Plex over its HTTP API, asking for JSON responses
pub struct PlexClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl PlexClient {
    pub fn new(url: &str, token: &str) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, endpoint: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, endpoint))
            .header("X-Plex-Token", &self.token)
            .header(ACCEPT, "application/json")
    }

    async fn send(&self, builder: reqwest::RequestBuilder, endpoint: &str) -> Result<reqwest::Response, NotifyError> {
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status {
                status: response.status().as_u16(),
                endpoint: endpoint.to_string(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, NotifyError> {
        let response = self
            .send(self.request(reqwest::Method::GET, endpoint), endpoint)
            .await?;
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.media_container)
    }

    async fn sections(&self) -> Result<SectionList, NotifyError> {
        self.get_json("/library/sections").await
    }
}

#[async_trait]
impl MediaServer for PlexClient {
    async fn section_id(&self, library: &str) -> Result<Option<String>, NotifyError> {
        let sections = self.sections().await?;
        Ok(section_by_title(&sections, library).map(|s| s.key.clone()))
    }

    async fn is_scanning(&self, section: &str) -> Result<bool, NotifyError> {
        let sections = self.sections().await?;
        Ok(sections
            .directories
            .iter()
            .find(|s| s.key == section)
            .map(|s| s.refreshing)
            .unwrap_or(false))
    }

    async fn refresh(&self, section: &str, folder: &Path) -> Result<(), NotifyError> {
        let endpoint = format!("/library/sections/{}/refresh", section);
        let folder = folder.display().to_string();
        let builder = self
            .request(reqwest::Method::GET, &endpoint)
            .query(&[("path", folder.as_str())]);
        self.send(builder, &endpoint).await?;
        Ok(())
    }

    async fn find_item(&self, section: &str, file: &Path) -> Result<Option<String>, NotifyError> {
        let items: ItemList = self
            .get_json(&format!("/library/sections/{}/all", section))
            .await?;
        Ok(item_for_file(&items, file))
    }

    async fn update_metadata(&self, item: &str, fields: &[(String, String)]) -> Result<(), NotifyError> {
        let endpoint = format!("/library/metadata/{}", item);
        let builder = self.request(reqwest::Method::PUT, &endpoint).query(fields);
        self.send(builder, &endpoint).await?;
        Ok(())
    }
}

/// Metadata pushed to the library item. Every field is locked so the
/// server's own agents don't overwrite it.
pub fn metadata_fields(record: &RecordingRecord, source_path: &Path) -> Vec<(String, String)> {
    let original = record
        .file_path
        .as_deref()
        .unwrap_or(source_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sort_date = record
        .scheduled_start
        .map(|s| s.format("%Y%m%d%H%M%S").to_string())
        .unwrap_or_else(|| "Unknown Date".to_string());

    let mut fields = vec![
        ("type".to_string(), "1".to_string()),
        ("title.value".to_string(), record.title.clone()),
        ("title.locked".to_string(), "1".to_string()),
        ("titleSort.value".to_string(), format!("{}_{}", sort_date, record.title)),
        ("titleSort.locked".to_string(), "1".to_string()),
        ("originalTitle.value".to_string(), original),
        ("originalTitle.locked".to_string(), "1".to_string()),
        ("studio.value".to_string(), record.series_info.clone()),
        ("studio.locked".to_string(), "1".to_string()),
    ];
    if let Some(start) = record.scheduled_start {
        fields.push((
            "originallyAvailableAt.value".to_string(),
            start.format("%Y-%m-%d").to_string(),
        ));
        fields.push(("originallyAvailableAt.locked".to_string(), "1".to_string()));
    }
    fields
}

pub struct Notifier {
    server: Arc<dyn MediaServer>,
    library: String,
    local_root: PathBuf,
    remote_root: PathBuf,
    policy: RetryPolicy,
    section: Mutex<Option<String>>,
    dry_run: bool,
}

impl Notifier {
    pub fn new(
        server: Arc<dyn MediaServer>,
        library: impl Into<String>,
        local_root: impl Into<PathBuf>,
        remote_root: impl Into<PathBuf>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            server,
            library: library.into(),
            local_root: local_root.into(),
            remote_root: remote_root.into(),
            policy,
            section: Mutex::new(None),
            dry_run: false,
        }
    }

    /// Plex notifier for `cfg`, or `None` when the integration isn't configured
    pub fn from_config(cfg: &PlexConfig, destination_root: &Path) -> Result<Option<Self>, NotifyError> {
        if !cfg.is_enabled() {
            return Ok(None);
        }
        let client = PlexClient::new(&cfg.url, &cfg.token)?;
        Ok(Some(Self::new(
            Arc::new(client),
            cfg.library.clone(),
            destination_root,
            cfg.folder.clone(),
            RetryPolicy::from_config(cfg),
        )))
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Translate a local destination path into the server's view of it
    pub fn remote_path(&self, local: &Path) -> PathBuf {
        match local.strip_prefix(&self.local_root) {
            Ok(relative) => self.remote_root.join(relative),
            Err(_) => local.to_path_buf(),
        }
    }

    async fn section(&self) -> Result<String, NotifyError> {
        let mut cached = self.section.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }
        let id = self
            .server
            .section_id(&self.library)
            .await?
            .ok_or_else(|| NotifyError::LibraryNotFound(self.library.clone()))?;
        info!("Found media server library '{}' with ID {}", self.library, id);
        *cached = Some(id.clone());
        Ok(id)
    }

    /// Rescan, wait for the item and push its metadata, within the retry policy
    pub async fn notify(&self, final_path: &Path, record: &RecordingRecord, source_path: &Path) -> NotifyResult {
        if self.dry_run {
            info!("[DRY RUN] Would notify media server about {}", final_path.display());
            return NotifyResult::Confirmed;
        }

        let section = match self.section().await {
            Ok(id) => id,
            Err(e) => {
                warn!("Media server notification for {} failed: {}", final_path.display(), e);
                return NotifyResult::TimedOut(e.to_string());
            }
        };

        let remote_file = self.remote_path(final_path);
        let remote_folder = remote_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.remote_root.clone());
        let fields = metadata_fields(record, source_path);

        let mut refreshed = false;
        let mut last_problem = String::from("item never appeared");

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.interval).await;
            }

            match self
                .attempt(&section, &remote_folder, &remote_file, &fields, &mut refreshed)
                .await
            {
                Ok(true) => {
                    info!("Media server updated for {}", remote_file.display());
                    return NotifyResult::Confirmed;
                }
                Ok(false) => debug!(
                    "Waiting for media server to pick up {} (attempt {}/{})",
                    remote_file.display(),
                    attempt,
                    self.policy.max_attempts
                ),
                Err(e) => {
                    debug!("Media server poll {} failed: {}", attempt, e);
                    last_problem = e.to_string();
                }
            }
        }

        warn!(
            "Media server did not confirm {} after {} attempts: {}",
            remote_file.display(),
            self.policy.max_attempts,
            last_problem
        );
        NotifyResult::TimedOut(format!(
            "not confirmed after {} attempts: {}",
            self.policy.max_attempts, last_problem
        ))
    }

    /// One poll. `Ok(true)` once the metadata push went through.
    async fn attempt(
        &self,
        section: &str,
        remote_folder: &Path,
        remote_file: &Path,
        fields: &[(String, String)],
        refreshed: &mut bool,
    ) -> Result<bool, NotifyError> {
        if !*refreshed {
            self.server.refresh(section, remote_folder).await?;
            info!("Requested media server rescan of {}", remote_folder.display());
            *refreshed = true;
        }

        if self.server.is_scanning(section).await? {
            return Ok(false);
        }

        match self.server.find_item(section, remote_file).await? {
            Some(item) => {
                self.server.update_metadata(&item, fields).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
