use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::TranscodeError;
use crate::naming::{clean_filename, metadata_tags, OutputName};
use crate::registry::RecordingRecord;

/// Suffix of in-progress outputs in the staging directory
pub const PARTIAL_SUFFIX: &str = ".partial.mkv";

/// Lines of ffmpeg stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// A finished (or, in dry-run, simulated) transcode
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeOutput {
    /// Fully written artifact inside the staging directory
    pub candidate: PathBuf,
    /// Where the relocator should put it, relative to the destination root
    pub name: OutputName,
    /// True when nothing was actually written
    pub simulated: bool,
}

/// Produces a remuxed copy of a raw capture
#[async_trait]
pub trait Transcode: Send + Sync {
    async fn run(
        &self,
        source: &Path,
        record: &RecordingRecord,
        language: &str,
    ) -> Result<TranscodeOutput, TranscodeError>;
}

/// Unique staging path for one attempt at `record`
pub fn candidate_path(staging_dir: &Path, record: &RecordingRecord) -> PathBuf {
    staging_dir.join(format!(
        "{}.{}{}",
        clean_filename(&record.id),
        uuid::Uuid::new_v4().simple(),
        PARTIAL_SUFFIX
    ))
}

/// Build ffmpeg arguments for a stream-copy remux into Matroska
pub fn build_remux_args(
    source: &Path,
    output: &Path,
    record: &RecordingRecord,
    language: &str,
) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        source.display().to_string(),
        "-map".to_string(),
        "0".to_string(),
        "-c".to_string(),
        "copy".to_string(),
    ];

    for (key, value) in metadata_tags(record) {
        args.push("-metadata".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push("-metadata:s:a".to_string());
    args.push(format!("language={}", language));

    args.push("-f".to_string());
    args.push("matroska".to_string());
    args.push(output.display().to_string());
    args
}

/// Remuxes with a local ffmpeg binary into the staging directory
pub struct FfmpegTranscoder {
    ffmpeg_bin: PathBuf,
    staging_dir: PathBuf,
    timeout: Option<Duration>,
    dry_run: bool,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            staging_dir: staging_dir.into(),
            timeout: None,
            dry_run: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Run ffmpeg to completion. The child is killed if the future is dropped
    /// (shutdown) or the timeout expires.
    async fn execute_ffmpeg(&self, args: &[String]) -> Result<(), TranscodeError> {
        debug!("Executing ffmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                bin: self.ffmpeg_bin.clone(),
                source,
            })?;

        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = std::collections::VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>().join("\n")
            })
        });

        let wait_err = |source| TranscodeError::Io {
            path: self.ffmpeg_bin.clone(),
            source,
        };

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status.map_err(wait_err)?,
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill timed out ffmpeg: {}", e);
                    }
                    return Err(TranscodeError::TimedOut(limit.as_secs()));
                }
            },
            None => child.wait().await.map_err(wait_err)?,
        };

        let stderr = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(TranscodeError::ExitStatus {
                code: status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transcode for FfmpegTranscoder {
    async fn run(
        &self,
        source: &Path,
        record: &RecordingRecord,
        language: &str,
    ) -> Result<TranscodeOutput, TranscodeError> {
        let name = OutputName::for_record(record);
        let candidate = candidate_path(&self.staging_dir, record);

        if self.dry_run {
            info!(
                "[DRY RUN] Would remux {} to {}",
                source.display(),
                name.relative_path().display()
            );
            return Ok(TranscodeOutput {
                candidate,
                name,
                simulated: true,
            });
        }

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|source| TranscodeError::Io {
                path: self.staging_dir.clone(),
                source,
            })?;

        info!(
            "Recording {}: remuxing {} -> {}",
            record.id,
            source.display(),
            name.relative_path().display()
        );

        let args = build_remux_args(source, &candidate, record, language);
        if let Err(e) = self.execute_ffmpeg(&args).await {
            discard_partial(&candidate).await;
            return Err(e);
        }

        let size = tokio::fs::metadata(&candidate).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            discard_partial(&candidate).await;
            return Err(TranscodeError::EmptyOutput(candidate));
        }

        Ok(TranscodeOutput {
            candidate,
            name,
            simulated: false,
        })
    }
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RecordingStatus;

    fn record() -> RecordingRecord {
        RecordingRecord {
            id: "rec-42".to_string(),
            title: "Evening News".to_string(),
            series_info: "Channel 5".to_string(),
            channel: Some("C5 HD".to_string()),
            scheduled_start: None,
            requested_duration_seconds: 1800,
            actual_duration_seconds: Some(1795),
            status: RecordingStatus::Completed,
            file_path: None,
        }
    }

    #[test]
    fn test_remux_args_copy_streams_and_tag_audio() {
        let args = build_remux_args(
            Path::new("/recordings/rec-42.ts"),
            Path::new("/remux/.staging/rec-42.x.partial.mkv"),
            &record(),
            "deu",
        );

        let joined = args.join(" ");
        assert!(joined.contains("-i /recordings/rec-42.ts"));
        assert!(joined.contains("-map 0 -c copy"));
        assert!(joined.contains("-metadata:s:a language=deu"));
        assert!(args.contains(&"title=Evening News".to_string()));
        assert!(args.contains(&"publisher=C5 HD".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/remux/.staging/rec-42.x.partial.mkv"));
        assert_eq!(args[args.len() - 3], "-f");
    }

    #[test]
    fn test_candidate_paths_are_unique_and_staged() {
        let staging = Path::new("/remux/.staging");
        let a = candidate_path(staging, &record());
        let b = candidate_path(staging, &record());
        assert_ne!(a, b);
        assert!(a.starts_with(staging));
        assert!(a.to_string_lossy().ends_with(PARTIAL_SUFFIX));
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join(".staging");
        let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg", &staging).dry_run(true);

        let out = transcoder
            .run(Path::new("/recordings/rec-42.ts"), &record(), "eng")
            .await
            .unwrap();
        assert!(out.simulated);
        assert_eq!(out.name.folder, "Channel 5");
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg", dir.path().join(".staging"));

        let err = transcoder
            .run(Path::new("/recordings/rec-42.ts"), &record(), "eng")
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Spawn { .. }));
        // no partial output left behind
        assert_eq!(std::fs::read_dir(dir.path().join(".staging")).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_a_transcode_error() {
        let dir = tempfile::tempdir().unwrap();
        // `false` ignores its arguments and exits 1
        let transcoder = FfmpegTranscoder::new("false", dir.path().join(".staging"));
        let err = transcoder
            .run(Path::new("/recordings/rec-42.ts"), &record(), "eng")
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::ExitStatus { code: 1, .. }), "got {}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_the_tool() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-ffmpeg");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let transcoder = FfmpegTranscoder::new(&script, dir.path().join(".staging"))
            .with_timeout(Some(Duration::from_millis(200)));
        let err = transcoder
            .run(Path::new("/recordings/rec-42.ts"), &record(), "eng")
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::TimedOut(_)));
    }
}
