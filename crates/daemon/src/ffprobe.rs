use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use log::debug;

/// The slice of ffprobe's JSON output we care about
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    #[serde(default)]
    pub format_name: Option<String>,
    /// Seconds, as a decimal string
    #[serde(default)]
    pub duration: Option<String>,
}

impl FFProbeData {
    pub fn duration_secs(&self) -> Option<f64> {
        self.format
            .duration
            .as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0)
    }
}

/// Measures the playable duration of a media file
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn duration_secs(&self, path: &Path) -> Result<f64>;
}

/// Runs a local ffprobe binary
pub struct FFProbe {
    ffprobe_bin: PathBuf,
}

impl FFProbe {
    pub fn new(ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    /// Run ffprobe and parse the JSON output
    pub async fn probe_file(&self, file_path: &Path) -> Result<FFProbeData> {
        if !file_path.exists() {
            anyhow::bail!("File does not exist: {}", file_path.display());
        }

        debug!("ffprobe: probing {}", file_path.display());

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg(file_path)
            .output()
            .await
            .with_context(|| format!("Failed to execute ffprobe for: {}", file_path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "ffprobe failed for {} (exit code {:?}): {}",
                file_path.display(),
                output.status.code(),
                stderr.trim()
            ));
        }

        parse_probe_output(&output.stdout)
            .with_context(|| format!("Failed to parse ffprobe output for: {}", file_path.display()))
    }
}

pub fn parse_probe_output(stdout: &[u8]) -> Result<FFProbeData> {
    serde_json::from_slice(stdout).context("ffprobe output is not valid JSON")
}

#[async_trait]
impl DurationProbe for FFProbe {
    async fn duration_secs(&self, path: &Path) -> Result<f64> {
        let data = self.probe_file(path).await?;
        data.duration_secs()
            .ok_or_else(|| anyhow!("ffprobe reported no duration for {}", path.display()))
    }
}
