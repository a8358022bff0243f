//! Bounded-concurrency executor for transcode jobs.
//!
//! Jobs are queued in submission order and a single dispatcher hands them a
//! permit each as slots free up, so at most `max_jobs` run at once and the
//! first job discovered is the first to run. Shutdown lets running jobs
//! finish and drops everything still queued, which the submitter observes
//! as [`JobOutcome::NotRun`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct QueuedJob {
    label: String,
    run: BoxedJob,
}

/// What happened to a submitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome<T> {
    Completed(T),
    /// Cancelled by shutdown before it started (or lost to a panic)
    NotRun,
}

/// Receives the result of one submitted job
#[derive(Debug)]
pub struct JobHandle<T> {
    label: String,
    rx: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn wait(self) -> JobOutcome<T> {
        match self.rx.await {
            Ok(value) => JobOutcome::Completed(value),
            Err(_) => JobOutcome::NotRun,
        }
    }
}

/// Decrements the running count even if the job panics
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct JobScheduler {
    max_jobs: usize,
    queue_tx: mpsc::UnboundedSender<QueuedJob>,
    token: CancellationToken,
    tracker: TaskTracker,
    running: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

impl JobScheduler {
    /// Start a scheduler running at most `max_jobs` jobs at a time (minimum 1).
    /// Must be called from within a tokio runtime.
    pub fn new(max_jobs: usize) -> Self {
        let max_jobs = max_jobs.max(1);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let running = Arc::new(AtomicUsize::new(0));
        let queued = Arc::new(AtomicUsize::new(0));

        let dispatcher = Dispatcher {
            queue_rx,
            semaphore: Arc::new(Semaphore::new(max_jobs)),
            token: token.clone(),
            tracker: tracker.clone(),
            running: running.clone(),
            queued: queued.clone(),
        };
        tracker.spawn(dispatcher.run());

        info!("Job scheduler started with {} slot(s)", max_jobs);

        Self {
            max_jobs,
            queue_tx,
            token,
            tracker,
            running,
            queued,
        }
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    /// Jobs currently executing
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a slot
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Enqueue a job. Never waits for a slot; the result arrives through the handle.
    pub fn submit<F, T>(&self, label: impl Into<String>, job: F) -> JobHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = oneshot::channel();
        let handle = JobHandle {
            label: label.clone(),
            rx,
        };

        if self.token.is_cancelled() {
            debug!("Scheduler shutting down, not queueing {}", label);
            return handle;
        }

        let run: BoxedJob = Box::pin(async move {
            let value = job.await;
            let _ = tx.send(value);
        });

        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(QueuedJob { label, run }).is_err() {
            // dispatcher gone; the dropped job reports NotRun
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        handle
    }

    /// Stop dispatching, cancel queued jobs and wait for running ones to finish
    pub async fn shutdown(&self) {
        info!(
            "Scheduler shutting down: {} running, {} queued",
            self.running(),
            self.queued()
        );
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Scheduler stopped");
    }
}

struct Dispatcher {
    queue_rx: mpsc::UnboundedReceiver<QueuedJob>,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
    tracker: TaskTracker,
    running: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            let job = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                job = self.queue_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    self.cancel(job);
                    break;
                }
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.cancel(job);
                        break;
                    }
                },
            };

            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.running.fetch_add(1, Ordering::SeqCst);
            debug!("Starting job {}", job.label);

            let guard = RunningGuard(self.running.clone());
            self.tracker.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                job.run.await;
            });
        }

        self.queue_rx.close();
        while let Ok(job) = self.queue_rx.try_recv() {
            self.cancel(job);
        }
    }

    fn cancel(&self, job: QueuedJob) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        info!("Job {} cancelled before it started", job.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn test_never_exceeds_max_jobs() {
        let scheduler = JobScheduler::new(2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let current = current.clone();
                let peak = peak.clone();
                scheduler.submit(format!("job-{}", i), async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    i
                })
            })
            .collect();

        let mut finished = Vec::new();
        for handle in handles {
            match handle.wait().await {
                JobOutcome::Completed(i) => finished.push(i),
                JobOutcome::NotRun => panic!("job should have run"),
            }
        }

        assert_eq!(finished, (0..10).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak was {}", peak.load(Ordering::SeqCst));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.running(), 0);
        assert_eq!(scheduler.queued(), 0);
    }

    #[tokio::test]
    async fn test_jobs_start_in_submission_order() {
        let scheduler = JobScheduler::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let order = order.clone();
                scheduler.submit(format!("job-{}", i), async move {
                    order.lock().await.push(i);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.wait().await, JobOutcome::Completed(()));
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_shutdown_finishes_running_and_cancels_queued() {
        let scheduler = JobScheduler::new(1);
        let (started_tx, started_rx) = oneshot::channel();

        let first = scheduler.submit("long", async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_millis(50)).await;
            "done"
        });
        let queued: Vec<_> = (0..3)
            .map(|i| scheduler.submit(format!("queued-{}", i), async { "ran" }))
            .collect();

        started_rx.await.unwrap();
        assert_eq!(scheduler.running(), 1);

        scheduler.shutdown().await;

        assert_eq!(first.wait().await, JobOutcome::Completed("done"));
        for handle in queued {
            assert_eq!(handle.wait().await, JobOutcome::NotRun);
        }
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(scheduler.running(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_not_run() {
        let scheduler = JobScheduler::new(2);
        scheduler.shutdown().await;
        assert!(scheduler.is_shutting_down());

        let handle = scheduler.submit("late", async { 1 });
        assert_eq!(handle.label(), "late");
        assert_eq!(handle.wait().await, JobOutcome::NotRun);
    }

    #[tokio::test]
    async fn test_zero_max_jobs_still_runs() {
        let scheduler = JobScheduler::new(0);
        assert_eq!(scheduler.max_jobs(), 1);
        assert_eq!(scheduler.submit("only", async { 7 }).wait().await, JobOutcome::Completed(7));
    }
}
