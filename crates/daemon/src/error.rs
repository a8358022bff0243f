use std::path::PathBuf;
use thiserror::Error;

/// Recording registry read failures
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Processed ledger failures. Any of these at startup stops the daemon.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to read ledger {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("ledger {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("failed to write ledger {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode ledger: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A transcode attempt failed. Fatal for that file only.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to spawn {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transcode exited with code {code}: {stderr}")]
    ExitStatus { code: i32, stderr: String },

    #[error("transcode timed out after {0} seconds")]
    TimedOut(u64),

    #[error("transcoded output {0} is missing or empty")]
    EmptyOutput(PathBuf),

    #[error("transcode I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Relocation of a finished artifact failed
#[derive(Debug, Error)]
pub enum MoveError {
    #[error("destination {0} already exists with different content")]
    Collision(PathBuf),

    #[error("failed to move {from} to {to}: {source}")]
    Io {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MoveError {
    /// Collisions need a human; plain I/O trouble may clear up by the next scan
    pub fn is_retryable(&self) -> bool {
        matches!(self, MoveError::Io { .. })
    }
}

/// Media server request failures
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("media server request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("media server returned HTTP {status} for {endpoint}")]
    Status { status: u16, endpoint: String },

    #[error("library '{0}' not found on media server")]
    LibraryNotFound(String),
}
