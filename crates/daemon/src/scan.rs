use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use walkdir::WalkDir;
use log::{debug, info, warn};

/// Raw capture extensions produced by the recorder
const CAPTURE_EXTENSIONS: &[&str] = &["ts"];

/// List raw captures directly inside the watch folder, sorted by path so
/// discovery order is stable between ticks
pub async fn scan_watch_folder(folder: &Path) -> Result<Vec<PathBuf>> {
    if !folder.exists() {
        warn!("Watch folder does not exist: {}", folder.display());
        return Ok(Vec::new());
    }

    let root = folder.to_path_buf();
    let mut captures = tokio::task::spawn_blocking(move || collect_captures(&root))
        .await
        .context("Watch folder scan task failed")?;
    captures.sort();

    info!("Scanned {}: {} capture(s) found", folder.display(), captures.len());
    Ok(captures)
}

fn collect_captures(root: &Path) -> Vec<PathBuf> {
    let mut captures = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).max_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let is_capture = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| CAPTURE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false);
        if !is_capture {
            continue;
        }

        debug!("Found capture: {}", path.display());
        captures.push(path.to_path_buf());
    }

    captures
}
