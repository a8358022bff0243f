pub mod config;
pub mod error;
pub mod registry;
pub mod threshold;
pub mod ledger;
pub mod scheduler;
pub mod ffprobe;
pub mod naming;
pub mod transcoder;
pub mod relocate;
pub mod notifier;
pub mod pipeline;
pub mod scan;

pub use config::{PlexConfig, RemuxConfig};
pub use error::{LedgerError, MoveError, NotifyError, RegistryError, TranscodeError};
pub use ledger::{JsonLedger, NotificationState, Outcome, ProcessedEntry, ProcessedLedger};
pub use pipeline::{Components, Disposition, JobState, Orchestrator};
pub use registry::{JsonRegistry, RecordingRecord, RecordingRegistry, RecordingStatus};
pub use threshold::Eligibility;
