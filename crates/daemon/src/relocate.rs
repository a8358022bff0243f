//! Moves finished artifacts from the staging directory into the destination
//! tree. An artifact only ever appears at its final path fully written, and
//! an existing file at that path is never replaced.

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};

use crate::error::MoveError;
use crate::naming::OutputName;
use crate::transcoder::PARTIAL_SUFFIX;

pub struct Relocator {
    destination_root: PathBuf,
    owner: Option<(u32, u32)>,
    dry_run: bool,
}

impl Relocator {
    pub fn new(destination_root: impl Into<PathBuf>) -> Self {
        Self {
            destination_root: destination_root.into(),
            owner: None,
            dry_run: false,
        }
    }

    /// Hand relocated files and folders to `uid:gid`. Both must be set.
    pub fn with_owner(mut self, puid: Option<u32>, pgid: Option<u32>) -> Self {
        self.owner = puid.zip(pgid);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    /// Final path `name` resolves to under the destination root
    pub fn final_path(&self, name: &OutputName) -> PathBuf {
        self.destination_root.join(name.relative_path())
    }

    /// Move `candidate` to its final path and return that path.
    ///
    /// If the final path already holds the very same artifact (same inode or
    /// byte-identical content) the candidate is dropped and the move counts
    /// as done. Anything else there is a [`MoveError::Collision`].
    pub async fn relocate(&self, candidate: &Path, name: &OutputName) -> Result<PathBuf, MoveError> {
        let final_path = self.final_path(name);

        if self.dry_run {
            info!("[DRY RUN] Would move {} to {}", candidate.display(), final_path.display());
            return Ok(final_path);
        }

        let candidate_owned = candidate.to_path_buf();
        let target = final_path.clone();
        let size = tokio::task::spawn_blocking(move || place_no_clobber(&candidate_owned, &target))
            .await
            .map_err(|e| MoveError::Io {
                from: candidate.to_path_buf(),
                to: final_path.clone(),
                source: std::io::Error::new(ErrorKind::Other, e),
            })??;

        info!(
            "📦 Relocated {} -> {} ({})",
            candidate.display(),
            final_path.display(),
            format_size(size, DECIMAL)
        );

        if let Some((uid, gid)) = self.owner {
            self.apply_owner(&final_path, uid, gid);
        }

        Ok(final_path)
    }

    fn apply_owner(&self, final_path: &Path, uid: u32, gid: u32) {
        let folder = final_path.parent().filter(|p| *p != self.destination_root);
        for path in folder.into_iter().chain(std::iter::once(final_path)) {
            if let Err(e) = change_owner(path, uid, gid) {
                warn!("Failed to chown {} to {}:{}: {}", path.display(), uid, gid, e);
            }
        }
    }
}

#[cfg(unix)]
fn change_owner(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
}

#[cfg(not(unix))]
fn change_owner(_path: &Path, _uid: u32, _gid: u32) -> std::io::Result<()> {
    Ok(())
}

/// Blocking body of [`Relocator::relocate`]. Returns the artifact size.
fn place_no_clobber(candidate: &Path, final_path: &Path) -> Result<u64, MoveError> {
    let io_err = |source| MoveError::Io {
        from: candidate.to_path_buf(),
        to: final_path.to_path_buf(),
        source,
    };

    let size = std::fs::metadata(candidate).map_err(io_err)?.len();

    if let Some(folder) = final_path.parent() {
        std::fs::create_dir_all(folder).map_err(io_err)?;
    }

    // A hard link fails instead of replacing an existing file, which makes
    // "appear only if absent" a single step.
    match std::fs::hard_link(candidate, final_path) {
        Ok(()) => {
            std::fs::remove_file(candidate).map_err(io_err)?;
            return Ok(size);
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return settle_existing(candidate, final_path, size);
        }
        Err(e) => debug!(
            "Hard link into {} unavailable ({}), falling back to rename",
            final_path.display(),
            e
        ),
    }

    if final_path.exists() {
        return settle_existing(candidate, final_path, size);
    }
    std::fs::rename(candidate, final_path).map_err(io_err)?;
    Ok(size)
}

fn settle_existing(candidate: &Path, final_path: &Path, size: u64) -> Result<u64, MoveError> {
    let identical = same_artifact(candidate, final_path).map_err(|source| MoveError::Io {
        from: candidate.to_path_buf(),
        to: final_path.to_path_buf(),
        source,
    })?;

    if !identical {
        return Err(MoveError::Collision(final_path.to_path_buf()));
    }

    info!("{} already in place, dropping duplicate candidate", final_path.display());
    std::fs::remove_file(candidate).map_err(|source| MoveError::Io {
        from: candidate.to_path_buf(),
        to: final_path.to_path_buf(),
        source,
    })?;
    Ok(size)
}

fn same_artifact(a: &Path, b: &Path) -> std::io::Result<bool> {
    let meta_a = std::fs::metadata(a)?;
    let meta_b = std::fs::metadata(b)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if meta_a.dev() == meta_b.dev() && meta_a.ino() == meta_b.ino() {
            return Ok(true);
        }
    }

    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let mut file_a = std::io::BufReader::new(std::fs::File::open(a)?);
    let mut file_b = std::io::BufReader::new(std::fs::File::open(b)?);
    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    loop {
        let n = file_a.read(&mut buf_a)?;
        if n == 0 {
            return Ok(true);
        }
        file_b.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

/// Remove partial outputs a previous run left in the staging directory.
/// None of them has a ledger entry, so their sources get picked up again.
pub async fn recover_staging(staging_dir: &Path) -> Result<usize> {
    if !staging_dir.exists() {
        return Ok(0);
    }

    info!("🔍 Checking {} for orphaned partial outputs...", staging_dir.display());

    let partials = tokio::task::spawn_blocking({
        let staging_dir = staging_dir.to_path_buf();
        move || {
            walkdir::WalkDir::new(&staging_dir)
                .max_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .map(|n| n.ends_with(PARTIAL_SUFFIX))
                        .unwrap_or(false)
                })
                .map(|e| e.into_path())
                .collect::<Vec<_>>()
        }
    })
    .await
    .context("Failed to scan staging directory")?;

    let mut removed = 0;
    for partial in partials {
        match tokio::fs::remove_file(&partial).await {
            Ok(()) => {
                info!("🗑️  Deleted orphaned partial output: {}", partial.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to delete orphaned partial output {}: {}", partial.display(), e),
        }
    }
    Ok(removed)
}
