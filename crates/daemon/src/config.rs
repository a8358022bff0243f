use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use log::warn;

/// Configuration for the remux daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemuxConfig {
    /// Folder the recorder writes raw `.ts` captures into
    pub watch_folder: PathBuf,
    /// Root of the destination tree for finished artifacts
    pub destination_folder: PathBuf,
    /// Processed-file ledger (JSON, rewritten on every commit)
    pub ledger_path: PathBuf,
    /// Recording registry database written by the recorder
    pub registry_path: PathBuf,
    /// Interval in seconds between watch folder scans
    pub scan_interval_secs: u64,
    /// Minimum requested/actual duration match, in percent
    pub threshold_percent: u32,
    /// Process cancelled (ad-hoc) recordings, bypassing duration matching
    pub include_cancelled: bool,
    /// Maximum concurrently running transcodes
    pub max_jobs: usize,
    /// Language tag applied to audio streams of the output
    pub audio_language: String,
    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Kill a transcode that runs longer than this many seconds
    pub transcode_timeout_secs: Option<u64>,
    /// Owner applied to relocated artifacts (unix only)
    pub puid: Option<u32>,
    pub pgid: Option<u32>,
    /// Media server integration
    pub plex: PlexConfig,
}

/// Media server connection and rescan settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlexConfig {
    pub url: String,
    pub token: String,
    /// Library (section) name to rescan
    pub library: String,
    /// The destination root as the media server sees it
    pub folder: PathBuf,
    /// Maximum scan-status polls before giving up
    pub scan_count: u32,
    /// Delay in seconds between scan-status polls
    pub scan_interval_secs: u64,
}

impl Default for RemuxConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Default for PlexConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            library: String::new(),
            folder: PathBuf::from("/media/videos/uhf-server"),
            scan_count: 30,
            scan_interval_secs: 2,
        }
    }
}

impl PlexConfig {
    /// All of url, token and library are needed before we talk to the server
    pub fn is_enabled(&self) -> bool {
        !self.url.is_empty() && !self.token.is_empty() && !self.library.is_empty()
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

impl RemuxConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            watch_folder: PathBuf::from("/recordings"),
            destination_folder: PathBuf::from("/remux"),
            ledger_path: PathBuf::from("/remux/remux.json"),
            registry_path: PathBuf::from("/data/db.json"),
            scan_interval_secs: 5 * 60,
            threshold_percent: 30,
            include_cancelled: true,
            max_jobs: 2,
            audio_language: "eng".to_string(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            transcode_timeout_secs: None,
            puid: None,
            pgid: None,
            plex: PlexConfig::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            } else {
                warn!("Config file {} not found, using defaults", config_path.display());
            }
        }

        Ok(config)
    }

    /// Apply environment overrides on top of the loaded values
    pub fn apply_env(mut self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_vars<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("WATCH_FOLDER") {
            self.watch_folder = PathBuf::from(v);
        }
        if let Some(v) = var("DESTINATION_FOLDER") {
            self.destination_folder = PathBuf::from(v);
        }
        if let Some(v) = var("LEDGER_PATH") {
            self.ledger_path = PathBuf::from(v);
        }
        if let Some(v) = var("REGISTRY_PATH") {
            self.registry_path = PathBuf::from(v);
        }
        if let Some(v) = var("INTERVAL") {
            let minutes: u64 = parse_var("INTERVAL", &v)?;
            self.scan_interval_secs = minutes
                .checked_mul(60)
                .with_context(|| format!("INTERVAL of {} minutes is out of range", minutes))?;
        }
        if let Some(v) = var("THRESHOLD") {
            self.threshold_percent = parse_var("THRESHOLD", &v)?;
        }
        if let Some(v) = var("INCLUDE_CANCELLED") {
            self.include_cancelled = str_to_bool(&v);
        }
        if let Some(v) = var("MAX_JOBS") {
            self.max_jobs = parse_var("MAX_JOBS", &v)?;
        }
        if let Some(v) = var("AUDIO_LANGUAGE") {
            self.audio_language = v;
        }
        if let Some(v) = var("FFMPEG_BIN") {
            self.ffmpeg_bin = PathBuf::from(v);
        }
        if let Some(v) = var("FFPROBE_BIN") {
            self.ffprobe_bin = PathBuf::from(v);
        }
        if let Some(v) = var("TRANSCODE_TIMEOUT") {
            self.transcode_timeout_secs = Some(parse_var("TRANSCODE_TIMEOUT", &v)?);
        }
        if let Some(v) = var("PUID") {
            self.puid = Some(parse_var("PUID", &v)?);
        }
        if let Some(v) = var("PGID") {
            self.pgid = Some(parse_var("PGID", &v)?);
        }
        if let Some(v) = var("PLEX_URL") {
            self.plex.url = v;
        }
        if let Some(v) = var("PLEX_TOKEN") {
            self.plex.token = v;
        }
        if let Some(v) = var("PLEX_LIBRARY") {
            self.plex.library = v;
        }
        if let Some(v) = var("PLEX_FOLDER") {
            self.plex.folder = PathBuf::from(v);
        }
        if let Some(v) = var("PLEX_SCAN_COUNT") {
            self.plex.scan_count = parse_var("PLEX_SCAN_COUNT", &v)?;
        }
        if let Some(v) = var("PLEX_SCAN_INTERVAL") {
            self.plex.scan_interval_secs = parse_var("PLEX_SCAN_INTERVAL", &v)?;
        }

        Ok(())
    }

    /// Reject values the daemon cannot run with, warn about the rest
    pub fn validate(&self) -> Result<()> {
        if self.max_jobs == 0 {
            bail!("max_jobs must be at least 1");
        }
        if self.threshold_percent > 100 {
            bail!("threshold_percent must be between 0 and 100, got {}", self.threshold_percent);
        }
        if self.scan_interval_secs == 0 {
            bail!("scan interval must be greater than zero");
        }

        if !self.watch_folder.exists() {
            warn!("Watch folder '{}' does not exist", self.watch_folder.display());
        }
        if !self.destination_folder.exists() {
            warn!("Destination folder '{}' does not exist", self.destination_folder.display());
        }

        let plex = &self.plex;
        if !plex.url.is_empty() && plex.token.is_empty() {
            warn!("PLEX_URL provided but PLEX_TOKEN is missing");
        }
        if !plex.token.is_empty() && plex.url.is_empty() {
            warn!("PLEX_TOKEN provided but PLEX_URL is missing");
        }
        if !plex.url.is_empty() && !plex.token.is_empty() && plex.library.is_empty() {
            warn!("Plex connection info provided but PLEX_LIBRARY is missing");
        }

        Ok(())
    }

    /// Directory inside the destination tree where transcodes are written before relocation
    pub fn staging_dir(&self) -> PathBuf {
        self.destination_folder.join(".staging")
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn transcode_timeout(&self) -> Option<Duration> {
        self.transcode_timeout_secs.map(Duration::from_secs)
    }
}

/// Environment booleans: true, 1, yes, y (any case)
pub fn str_to_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "y")
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("Invalid value for {}: {:?}", key, value))
}
