//! Per-file processing pipeline.
//!
//! A discovered capture moves through
//! `Discovered -> Eligible | Rejected`, then
//! `Eligible -> Queued -> Transcoding -> Relocated -> Notified -> Committed`.
//! Any failure after eligibility goes to `Errored` and is committed as a
//! failed entry. Rejections are committed as skips without ever reaching the
//! scheduler. Lookups, threshold checks and ledger commits run on the caller;
//! only the transcode itself runs in the bounded scheduler.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio_util::task::TaskTracker;

use crate::config::RemuxConfig;
use crate::error::{MoveError, TranscodeError};
use crate::ffprobe::{DurationProbe, FFProbe};
use crate::ledger::{CommitResult, Committer, NotificationState, Outcome, ProcessedEntry, ProcessedLedger};
use crate::notifier::{NotifyResult, Notifier};
use crate::registry::{JsonRegistry, RecordingRecord, RecordingRegistry, RecordingStatus};
use crate::relocate::Relocator;
use crate::scheduler::{JobHandle, JobOutcome, JobScheduler};
use crate::threshold::{evaluate, Eligibility};
use crate::transcoder::{FfmpegTranscoder, Transcode, TranscodeOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Discovered,
    Eligible,
    Rejected,
    Queued,
    Transcoding,
    Relocated,
    Notified,
    Committed,
    Errored,
}

impl JobState {
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Discovered, Eligible)
                | (Discovered, Rejected)
                | (Rejected, Committed)
                | (Eligible, Queued)
                | (Queued, Transcoding)
                | (Transcoding, Relocated)
                | (Relocated, Notified)
                | (Relocated, Committed)
                | (Notified, Committed)
                | (Eligible, Errored)
                | (Queued, Errored)
                | (Transcoding, Errored)
                | (Relocated, Errored)
                | (Notified, Errored)
                | (Errored, Committed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == JobState::Committed
    }
}

/// One discovered capture on its way through the pipeline
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub source_path: PathBuf,
    pub record: RecordingRecord,
    state: JobState,
    history: Vec<JobState>,
}

impl PipelineJob {
    pub fn new(source_path: impl Into<PathBuf>, record: RecordingRecord) -> Self {
        Self {
            source_path: source_path.into(),
            record,
            state: JobState::Discovered,
            history: vec![JobState::Discovered],
        }
    }

    /// The ledger key for this job
    pub fn key(&self) -> &str {
        &self.record.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every state the job has been in, in order
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    fn advance(&mut self, next: JobState) {
        if !self.state.can_transition_to(next) {
            warn!("Recording {}: unexpected transition {:?} -> {:?}", self.record.id, self.state, next);
        }
        debug!("Recording {}: {:?} -> {:?}", self.record.id, self.state, next);
        self.state = next;
        self.history.push(next);
    }
}

/// How processing one discovered file ended
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// A settled ledger entry exists; nothing was done
    AlreadyProcessed,
    /// Another tick is still working on this recording
    InFlight,
    /// Not decidable yet (registry or probe trouble); retried next tick
    Deferred(String),
    /// Registry says the recording is not finished or failed upstream
    Ignored(RecordingStatus),
    /// A ledger entry with this outcome was written
    Committed(Outcome),
    /// Shutdown cancelled the transcode before it started
    NotRun,
    /// Dry run: the file would be remuxed to this path
    WouldTranscode(PathBuf),
    /// Dry run: the file would be committed with this skip outcome
    WouldReject(Outcome),
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::AlreadyProcessed => write!(f, "already processed"),
            Disposition::InFlight => write!(f, "in flight"),
            Disposition::Deferred(reason) => write!(f, "deferred: {}", reason),
            Disposition::Ignored(status) => write!(f, "ignored (status {})", status),
            Disposition::Committed(outcome) => write!(f, "committed as {:?}", outcome),
            Disposition::NotRun => write!(f, "not run"),
            Disposition::WouldTranscode(path) => write!(f, "would transcode to {}", path.display()),
            Disposition::WouldReject(outcome) => write!(f, "would commit {:?}", outcome),
        }
    }
}

/// What a scan tick did up front. Eligible files finish in the background.
#[derive(Debug, Default)]
pub struct TickReport {
    pub dispatched: usize,
    pub settled: Vec<(PathBuf, Disposition)>,
}

/// Marks a recording as being processed until dropped
struct InFlightClaim {
    set: Arc<StdMutex<HashSet<String>>>,
    key: String,
}

impl InFlightClaim {
    fn acquire(set: &Arc<StdMutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            key: key.to_string(),
        })
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.key);
    }
}

struct ReadyJob {
    job: PipelineJob,
    claim: InFlightClaim,
}

enum Prepared {
    Done(Disposition),
    Ready(ReadyJob),
}

enum Intent {
    /// `earlier` is where an interrupted previous run was placing its artifact
    Recorded { earlier: Option<PathBuf> },
    /// Another attempt settled the recording first
    Settled,
}

/// Everything the orchestrator talks to
pub struct Components {
    pub registry: Arc<dyn RecordingRegistry>,
    pub ledger: Arc<dyn ProcessedLedger>,
    pub probe: Arc<dyn DurationProbe>,
    pub transcoder: Arc<dyn Transcode>,
    pub relocator: Relocator,
    pub notifier: Option<Notifier>,
}

impl Components {
    /// Production wiring for `config` around an already opened ledger
    pub fn from_config(config: &RemuxConfig, ledger: Arc<dyn ProcessedLedger>, dry_run: bool) -> Result<Self> {
        let notifier = Notifier::from_config(&config.plex, &config.destination_folder)
            .context("Failed to set up media server client")?
            .map(|n| n.dry_run(dry_run));

        Ok(Self {
            registry: Arc::new(JsonRegistry::new(&config.registry_path)),
            ledger,
            probe: Arc::new(FFProbe::new(&config.ffprobe_bin)),
            transcoder: Arc::new(
                FfmpegTranscoder::new(&config.ffmpeg_bin, config.staging_dir())
                    .with_timeout(config.transcode_timeout())
                    .dry_run(dry_run),
            ),
            relocator: Relocator::new(&config.destination_folder)
                .with_owner(config.puid, config.pgid)
                .dry_run(dry_run),
            notifier,
        })
    }
}

pub struct Orchestrator {
    config: Arc<RemuxConfig>,
    registry: Arc<dyn RecordingRegistry>,
    committer: Committer,
    probe: Arc<dyn DurationProbe>,
    transcoder: Arc<dyn Transcode>,
    relocator: Relocator,
    notifier: Option<Notifier>,
    scheduler: JobScheduler,
    in_flight: Arc<StdMutex<HashSet<String>>>,
    tasks: TaskTracker,
    dry_run: bool,
}

impl Orchestrator {
    /// Must be called from within a tokio runtime (starts the scheduler)
    pub fn new(config: Arc<RemuxConfig>, components: Components, dry_run: bool) -> Self {
        let scheduler = JobScheduler::new(config.max_jobs);
        Self {
            registry: components.registry,
            committer: Committer::new(components.ledger),
            probe: components.probe,
            transcoder: components.transcoder,
            relocator: components.relocator,
            notifier: components.notifier,
            scheduler,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
            tasks: TaskTracker::new(),
            dry_run,
            config,
        }
    }

    pub fn config(&self) -> &RemuxConfig {
        &self.config
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Run one file through the whole pipeline and wait for the result
    pub async fn process_file(&self, path: &Path) -> Result<Disposition> {
        match self.prepare(path).await? {
            Prepared::Done(disposition) => Ok(disposition),
            Prepared::Ready(ready) => {
                let handle = self.submit(&ready);
                self.finish(ready, handle).await
            }
        }
    }

    /// Process a tick's worth of discovered files in discovery order.
    ///
    /// Skips and rejections are settled before this returns. Eligible files
    /// are queued on the scheduler in order and finish in the background;
    /// [`Orchestrator::drain`] waits for them.
    pub async fn run_tick(self: &Arc<Self>, paths: &[PathBuf]) -> TickReport {
        let mut report = TickReport::default();

        for path in paths {
            match self.prepare(path).await {
                Ok(Prepared::Done(disposition)) => {
                    debug!("{}: {}", path.display(), disposition);
                    report.settled.push((path.clone(), disposition));
                }
                Ok(Prepared::Ready(ready)) => {
                    let handle = self.submit(&ready);
                    let this = Arc::clone(self);
                    let path = path.clone();
                    self.tasks.spawn(async move {
                        match this.finish(ready, handle).await {
                            Ok(disposition) => info!("{}: {}", path.display(), disposition),
                            Err(e) => error!("{}: {:#}", path.display(), e),
                        }
                    });
                    report.dispatched += 1;
                }
                Err(e) => error!("{}: {:#}", path.display(), e),
            }
        }

        report
    }

    /// Wait for every file dispatched by earlier ticks to finish
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Stop taking work: running transcodes finish and are committed, queued
    /// ones are dropped without a ledger entry.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Retry media server notification for succeeded entries that never got
    /// a confirmation. Returns how many were confirmed.
    pub async fn reconcile_notifications(&self) -> Result<usize> {
        let Some(notifier) = self.notifier.as_ref() else {
            return Ok(0);
        };
        if self.dry_run {
            debug!("[DRY RUN] Skipping notification reconciliation");
            return Ok(0);
        }

        let pending: Vec<ProcessedEntry> = self
            .committer
            .ledger()
            .list_all()
            .await?
            .into_iter()
            .filter(|e| e.outcome == Outcome::Succeeded && e.notification == NotificationState::Incomplete)
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        info!("Reconciling media server notification for {} recording(s)", pending.len());

        let mut confirmed = 0;
        for entry in pending {
            let Some(final_path) = entry.destination_path.as_deref() else {
                continue;
            };
            let Some(_claim) = InFlightClaim::acquire(&self.in_flight, &entry.source_file_key) else {
                continue;
            };
            let record = match self.registry.get(&entry.source_file_key).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!("Recording {} no longer in registry, leaving notification pending", entry.source_file_key);
                    continue;
                }
                Err(e) => {
                    warn!("Registry unavailable during reconciliation: {}", e);
                    break;
                }
            };

            if notifier.notify(final_path, &record, &entry.source_path).await.is_confirmed()
                && self
                    .committer
                    .mark_notification(&entry.source_file_key, NotificationState::Confirmed)
                    .await?
            {
                confirmed += 1;
            }
        }
        Ok(confirmed)
    }

    /// Everything up to (not including) the transcode
    async fn prepare(&self, path: &Path) -> Result<Prepared> {
        let record = match self.registry.find_for_file(path).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("No registry entry for {}, will retry", path.display());
                return Ok(Prepared::Done(Disposition::Deferred("no registry entry".to_string())));
            }
            Err(e) => {
                warn!("Registry lookup for {} failed: {}", path.display(), e);
                return Ok(Prepared::Done(Disposition::Deferred(e.to_string())));
            }
        };

        let Some(claim) = InFlightClaim::acquire(&self.in_flight, &record.id) else {
            debug!("Recording {} is already being processed", record.id);
            return Ok(Prepared::Done(Disposition::InFlight));
        };

        if self.committer.settled(&record.id).await?.is_some() {
            debug!("Recording {} already processed, skipping {}", record.id, path.display());
            return Ok(Prepared::Done(Disposition::AlreadyProcessed));
        }

        if !record.status.is_processable() {
            debug!("Recording {} has status {}, not processing yet", record.id, record.status);
            return Ok(Prepared::Done(Disposition::Ignored(record.status)));
        }

        let mut job = PipelineJob::new(path, record);

        if self.needs_probe(&job.record) {
            match self.probe.duration_secs(path).await {
                Ok(secs) => {
                    debug!("Recording {}: probed duration {:.1}s", job.record.id, secs);
                    job.record.actual_duration_seconds = Some(secs.round() as u64);
                }
                Err(e) => {
                    warn!("Could not determine duration of {}: {:#}", path.display(), e);
                    return Ok(Prepared::Done(Disposition::Deferred(format!("probe failed: {}", e))));
                }
            }
        }

        let verdict = evaluate(&job.record, self.config.threshold_percent, self.config.include_cancelled);
        let skip = match verdict {
            Eligibility::Eligible => None,
            Eligibility::RejectedThreshold { ratio_percent } => {
                info!(
                    "Recording {} rejected: duration match {} below {}%",
                    job.record.id,
                    ratio_percent.map(|r| format!("{:.1}%", r)).unwrap_or_else(|| "unknown".to_string()),
                    self.config.threshold_percent
                );
                Some((Outcome::SkippedThreshold, "duration below threshold".to_string()))
            }
            Eligibility::RejectedCancelled => {
                info!("Recording {} rejected: cancelled recordings are excluded", job.record.id);
                Some((Outcome::SkippedCancelledPolicy, "cancelled recordings excluded".to_string()))
            }
        };

        if let Some((outcome, reason)) = skip {
            job.advance(JobState::Rejected);
            if self.dry_run {
                info!("[DRY RUN] Would commit {} as {:?}", job.record.id, outcome);
                return Ok(Prepared::Done(Disposition::WouldReject(outcome)));
            }
            let entry = ProcessedEntry::new(job.key(), &job.source_path, outcome).with_reason(reason);
            let disposition = self.commit(&mut job, entry).await?;
            return Ok(Prepared::Done(disposition));
        }

        job.advance(JobState::Eligible);
        Ok(Prepared::Ready(ReadyJob { job, claim }))
    }

    /// Only needed when the threshold actually compares durations
    fn needs_probe(&self, record: &RecordingRecord) -> bool {
        record.actual_duration_seconds.is_none()
            && record.status != RecordingStatus::Cancelled
            && self.config.threshold_percent > 0
    }

    fn submit(&self, ready: &ReadyJob) -> JobHandle<Result<TranscodeOutput, TranscodeError>> {
        let transcoder = Arc::clone(&self.transcoder);
        let source = ready.job.source_path.clone();
        let record = ready.job.record.clone();
        let language = self.config.audio_language.clone();

        self.scheduler.submit(ready.job.record.id.clone(), async move {
            debug!("Recording {}: transcoding", record.id);
            transcoder.run(&source, &record, &language).await
        })
    }

    /// Await the transcode, then relocate, notify and commit
    async fn finish(
        &self,
        ready: ReadyJob,
        handle: JobHandle<Result<TranscodeOutput, TranscodeError>>,
    ) -> Result<Disposition> {
        let ReadyJob { mut job, claim } = ready;
        job.advance(JobState::Queued);

        let output = match handle.wait().await {
            JobOutcome::NotRun => {
                info!("Recording {}: not run, will be picked up again", job.record.id);
                return Ok(Disposition::NotRun);
            }
            JobOutcome::Completed(result) => {
                job.advance(JobState::Transcoding);
                result
            }
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                error!("Recording {}: transcode failed: {}", job.record.id, e);
                job.advance(JobState::Errored);
                if self.dry_run {
                    return Ok(Disposition::Deferred(e.to_string()));
                }
                let entry = ProcessedEntry::new(job.key(), &job.source_path, Outcome::Failed)
                    .with_reason(format!("transcode: {}", e));
                return self.commit(&mut job, entry).await;
            }
        };

        // A relocation intent left by a run that died before committing
        let earlier = if self.dry_run {
            None
        } else {
            match self.record_intent(&job, &output).await {
                Ok(Intent::Recorded { earlier }) => earlier,
                Ok(Intent::Settled) => {
                    discard_candidate(&output).await;
                    return Ok(Disposition::AlreadyProcessed);
                }
                Err(e) => {
                    discard_candidate(&output).await;
                    return Err(e);
                }
            }
        };

        let final_path = match self.relocator.relocate(&output.candidate, &output.name).await {
            Ok(path) => path,
            Err(MoveError::Collision(path)) if earlier.as_deref() == Some(path.as_path()) => {
                info!(
                    "Recording {}: {} was placed by an interrupted earlier run, keeping it",
                    job.record.id,
                    path.display()
                );
                discard_candidate(&output).await;
                path
            }
            Err(e) => {
                error!("Recording {}: relocation failed: {}", job.record.id, e);
                discard_candidate(&output).await;
                job.advance(JobState::Errored);
                let entry = ProcessedEntry::new(job.key(), &job.source_path, Outcome::Failed)
                    .with_reason(format!("relocate: {}", e))
                    .retryable(e.is_retryable());
                return self.commit(&mut job, entry).await;
            }
        };
        job.advance(JobState::Relocated);

        let notification = match self.notifier.as_ref() {
            None => NotificationState::NotApplicable,
            Some(notifier) => match notifier.notify(&final_path, &job.record, &job.source_path).await {
                NotifyResult::Confirmed => {
                    job.advance(JobState::Notified);
                    NotificationState::Confirmed
                }
                NotifyResult::TimedOut(reason) => {
                    warn!("Recording {}: notification incomplete: {}", job.record.id, reason);
                    NotificationState::Incomplete
                }
            },
        };

        if self.dry_run {
            info!("[DRY RUN] Would commit {} as succeeded", job.record.id);
            return Ok(Disposition::WouldTranscode(final_path));
        }

        let entry = ProcessedEntry::new(job.key(), &job.source_path, Outcome::Succeeded)
            .with_destination(&final_path)
            .with_notification(notification);
        let disposition = self.commit(&mut job, entry).await?;
        drop(claim);
        Ok(disposition)
    }

    /// Note in the ledger where the artifact is about to go
    async fn record_intent(&self, job: &PipelineJob, output: &TranscodeOutput) -> Result<Intent> {
        let earlier = self
            .committer
            .ledger()
            .get(job.key())
            .await
            .with_context(|| format!("Failed to read ledger for recording {}", job.record.id))?
            .and_then(|e| e.interrupted_destination().map(Path::to_path_buf));

        let intent = ProcessedEntry::new(job.key(), &job.source_path, Outcome::Relocating)
            .with_destination(self.relocator.final_path(&output.name));
        match self
            .committer
            .commit(intent)
            .await
            .with_context(|| format!("Failed to record relocation of recording {}", job.record.id))?
        {
            CommitResult::Written => Ok(Intent::Recorded { earlier }),
            CommitResult::AlreadySettled(existing) => {
                warn!(
                    "Recording {} was settled concurrently as {:?}, dropping this remux",
                    job.record.id, existing.outcome
                );
                Ok(Intent::Settled)
            }
        }
    }

    async fn commit(&self, job: &mut PipelineJob, entry: ProcessedEntry) -> Result<Disposition> {
        let outcome = entry.outcome;
        match self
            .committer
            .commit(entry)
            .await
            .with_context(|| format!("Failed to commit recording {}", job.record.id))?
        {
            CommitResult::Written => {
                job.advance(JobState::Committed);
                info!("Recording {}: committed as {:?}", job.record.id, outcome);
                Ok(Disposition::Committed(outcome))
            }
            CommitResult::AlreadySettled(existing) => {
                warn!(
                    "Recording {} was settled concurrently as {:?}, keeping that entry",
                    job.record.id, existing.outcome
                );
                Ok(Disposition::AlreadyProcessed)
            }
        }
    }
}

async fn discard_candidate(output: &TranscodeOutput) {
    if output.simulated {
        return;
    }
    if let Err(e) = tokio::fs::remove_file(&output.candidate).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", output.candidate.display(), e);
        }
    }
}
