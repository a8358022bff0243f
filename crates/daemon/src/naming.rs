//! Destination names and embedded metadata derived from registry data.
//! The raw capture's own file name is opaque and never used.

use std::path::PathBuf;
use chrono::Utc;

use crate::registry::RecordingRecord;

const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Make a string safe to use as a single path component
pub fn clean_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if INVALID_CHARS.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    let trimmed = replaced.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Destination of a recording relative to the destination root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputName {
    /// Series/channel folder
    pub folder: String,
    pub file_name: String,
}

impl OutputName {
    pub fn for_record(record: &RecordingRecord) -> Self {
        let folder = if record.series_info.trim().is_empty() {
            "Unknown".to_string()
        } else {
            clean_filename(&record.series_info)
        };
        let title = clean_filename(&record.title);

        let file_name = match (record.scheduled_start, record.scheduled_end()) {
            (Some(start), Some(end)) => format!(
                "{}_{}_{}-{}.mkv",
                title,
                start.format("%Y-%m-%d"),
                start.format("%H%M"),
                end.format("%H%M"),
            ),
            _ => format!("{}_{}.mkv", title, clean_filename(&record.id)),
        };

        Self { folder, file_name }
    }

    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.folder).join(&self.file_name)
    }
}

/// Container-level tags written into the output
pub fn metadata_tags(record: &RecordingRecord) -> Vec<(String, String)> {
    let start = record
        .scheduled_start
        .map(|s| s.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());
    let end = record
        .scheduled_end()
        .map(|e| e.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());

    let comment = [
        format!("Recording Id: {}", record.id),
        format!("Recording: {} - {}", start, end),
        format!("Duration: {} seconds", record.requested_duration_seconds),
        format!("Status: {}", record.status),
        format!("Channel: {}", record.channel_name()),
    ]
    .join(" | ")
    .replace('"', "'");

    vec![
        ("title".to_string(), record.title.clone()),
        ("publisher".to_string(), record.channel_name().to_string()),
        ("genre".to_string(), "TV-Show".to_string()),
        ("description".to_string(), format!("{}-{}", record.series_info, record.title)),
        ("creation_time".to_string(), start),
        ("encoded_date".to_string(), Utc::now().to_rfc3339()),
        ("comment".to_string(), comment),
    ]
}
