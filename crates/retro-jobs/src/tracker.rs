use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use retro_types::{Result, RetroError};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::status::{JobPoll, JobSnapshot, JobStatus};

/// Work executed for each dequeued job.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Job: Send + 'static;
    type Output: Clone + Send + Sync + 'static;

    async fn handle(&self, job: Self::Job) -> Result<Self::Output>;
}

struct JobRecord<O> {
    snapshot: JobSnapshot,
    output: Option<O>,
}

type Records<O> = Arc<RwLock<HashMap<String, JobRecord<O>>>>;
type Queue<J> = Arc<Mutex<mpsc::UnboundedReceiver<(String, J)>>>;

/// Queue plus worker pool with per-job status records.
///
/// Cloning yields another handle to the same queue and records.
pub struct JobTracker<H: JobHandler> {
    records: Records<H::Output>,
    sender: mpsc::UnboundedSender<(String, H::Job)>,
}

impl<H: JobHandler> Clone for JobTracker<H> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<H: JobHandler> JobTracker<H> {
    /// Start `workers` workers (at least one) on the current runtime.
    pub fn start(handler: H, workers: usize) -> Self {
        let records: Records<H::Output> = Arc::default();
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: Queue<H::Job> = Arc::new(Mutex::new(receiver));
        let handler = Arc::new(handler);
        let workers = workers.max(1);
        for worker in 0..workers {
            tokio::spawn(work(worker, handler.clone(), queue.clone(), records.clone()));
        }
        tracing::info!(workers, "job tracker started");
        Self { records, sender }
    }

    /// Record and enqueue a job. Never waits for a worker.
    pub async fn submit(&self, job: H::Job) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let snapshot = JobSnapshot {
            id: id.clone(),
            status: JobStatus::Queued,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.records.write().await.insert(
            id.clone(),
            JobRecord {
                snapshot,
                output: None,
            },
        );
        if self.sender.send((id.clone(), job)).is_err() {
            self.records.write().await.remove(&id);
            return Err(RetroError::QueueClosed);
        }
        tracing::info!(job_id = %id, "job queued");
        Ok(id)
    }

    pub async fn poll(&self, id: &str) -> JobPoll {
        match self.records.read().await.get(id) {
            Some(record) => JobPoll::Found(record.snapshot.clone()),
            None => JobPoll::NotFound,
        }
    }

    /// The result of a finished job. Any other state is an error.
    pub async fn fetch(&self, id: &str) -> Result<H::Output> {
        let records = self.records.read().await;
        let record = records
            .get(id)
            .ok_or_else(|| RetroError::JobNotFound(id.to_string()))?;
        match record.snapshot.status {
            JobStatus::Finished => record
                .output
                .clone()
                .ok_or_else(|| RetroError::Other(format!("job '{id}' finished without output"))),
            JobStatus::Failed => Err(RetroError::JobFailed {
                id: id.to_string(),
                message: record.snapshot.error.clone().unwrap_or_default(),
            }),
            status => Err(RetroError::JobNotFinished {
                id: id.to_string(),
                status: status.to_string(),
            }),
        }
    }

    /// Poll every `interval` until the job is terminal.
    pub async fn wait(&self, id: &str, interval: Duration) -> Result<JobSnapshot> {
        loop {
            match self.poll(id).await {
                JobPoll::NotFound => return Err(RetroError::JobNotFound(id.to_string())),
                JobPoll::Found(snapshot) if snapshot.status.is_terminal() => return Ok(snapshot),
                JobPoll::Found(_) => tokio::time::sleep(interval).await,
            }
        }
    }

    /// Drop the record of a terminal job.
    pub async fn reap(&self, id: &str) -> Result<JobSnapshot> {
        let mut records = self.records.write().await;
        let status = records
            .get(id)
            .map(|r| r.snapshot.status)
            .ok_or_else(|| RetroError::JobNotFound(id.to_string()))?;
        if !status.is_terminal() {
            return Err(RetroError::JobNotFinished {
                id: id.to_string(),
                status: status.to_string(),
            });
        }
        let record = records
            .remove(id)
            .ok_or_else(|| RetroError::JobNotFound(id.to_string()))?;
        tracing::debug!(job_id = %id, "job reaped");
        Ok(record.snapshot)
    }

    /// Number of tracked jobs, terminal or not.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

async fn work<H: JobHandler>(
    worker: usize,
    handler: Arc<H>,
    queue: Queue<H::Job>,
    records: Records<H::Output>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some((id, job)) = next else {
            tracing::debug!(worker, "job queue closed, worker exiting");
            return;
        };
        if !advance(&records, &id, JobStatus::Running, None, None).await {
            continue;
        }
        tracing::info!(worker, job_id = %id, "job running");

        // Run on its own task so a panic fails the job instead of the worker.
        let task_handler = handler.clone();
        let joined = tokio::spawn(async move { task_handler.handle(job).await }).await;
        match joined {
            Ok(Ok(output)) => {
                advance(&records, &id, JobStatus::Finished, None, Some(output)).await;
                tracing::info!(worker, job_id = %id, "job finished");
            }
            Ok(Err(e)) => {
                tracing::error!(worker, job_id = %id, error = %e, "job failed");
                advance(&records, &id, JobStatus::Failed, Some(e.to_string()), None).await;
            }
            Err(e) => {
                tracing::error!(worker, job_id = %id, error = %e, "job panicked");
                let message = format!("job task aborted: {e}");
                advance(&records, &id, JobStatus::Failed, Some(message), None).await;
            }
        }
    }
}

/// Apply a forward transition. Unknown ids and backward moves are ignored.
async fn advance<O>(
    records: &Records<O>,
    id: &str,
    next: JobStatus,
    error: Option<String>,
    output: Option<O>,
) -> bool {
    let mut records = records.write().await;
    let Some(record) = records.get_mut(id) else {
        tracing::warn!(job_id = %id, "job record vanished before {next}");
        return false;
    };
    let current = record.snapshot.status;
    if !current.can_advance_to(next) {
        tracing::warn!(job_id = %id, %current, %next, "ignoring invalid job transition");
        return false;
    }
    let now = Utc::now();
    match next {
        JobStatus::Running => record.snapshot.started_at = Some(now),
        _ => record.snapshot.finished_at = Some(now),
    }
    record.snapshot.status = next;
    record.snapshot.error = error;
    record.output = output;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    /// Echoes its input, fails on negatives, and blocks on zero until released.
    struct Echo {
        gate: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl JobHandler for Echo {
        type Job = i64;
        type Output = i64;

        async fn handle(&self, job: i64) -> Result<i64> {
            match job {
                0 => {
                    self.gate.notified().await;
                    Ok(0)
                }
                n if n < 0 => Err(RetroError::Other(format!("negative input {n}"))),
                n => Ok(n * 2),
            }
        }
    }

    fn tracker(workers: usize) -> (JobTracker<Echo>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let tracker = JobTracker::start(Echo { gate: gate.clone() }, workers);
        (tracker, gate)
    }

    const TICK: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn finished_job_can_be_fetched() {
        let (tracker, _) = tracker(2);
        let id = tracker.submit(21).await.unwrap();
        let snapshot = tracker.wait(&id, TICK).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Finished);
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.finished_at >= snapshot.started_at);
        assert_eq!(tracker.fetch(&id).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn failed_job_exposes_its_error() {
        let (tracker, _) = tracker(1);
        let id = tracker.submit(-3).await.unwrap();
        let snapshot = tracker.wait(&id, TICK).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("negative input -3"));

        let err = tracker.fetch(&id).await.unwrap_err();
        assert!(matches!(err, RetroError::JobFailed { .. }));
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn unfinished_job_cannot_be_fetched_or_reaped() {
        let (tracker, gate) = tracker(1);
        let blocked = tracker.submit(0).await.unwrap();
        let waiting = tracker.submit(5).await.unwrap();

        // The single worker is busy, so the second job stays queued.
        while tracker.poll(&blocked).await.status() != Some(JobStatus::Running) {
            tokio::time::sleep(TICK).await;
        }
        assert_eq!(tracker.poll(&waiting).await.status(), Some(JobStatus::Queued));
        assert!(matches!(
            tracker.fetch(&blocked).await,
            Err(RetroError::JobNotFinished { .. })
        ));
        assert!(tracker.reap(&waiting).await.is_err());

        gate.notify_one();
        tracker.wait(&waiting, TICK).await.unwrap();
        assert_eq!(tracker.fetch(&blocked).await.unwrap(), 0);
        assert_eq!(tracker.fetch(&waiting).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn unknown_and_reaped_jobs_are_not_found() {
        let (tracker, _) = tracker(1);
        assert_eq!(tracker.poll("nope").await, JobPoll::NotFound);
        assert!(matches!(
            tracker.fetch("nope").await,
            Err(RetroError::JobNotFound(_))
        ));

        let id = tracker.submit(1).await.unwrap();
        tracker.wait(&id, TICK).await.unwrap();
        tracker.reap(&id).await.unwrap();
        assert_eq!(tracker.poll(&id).await, JobPoll::NotFound);
        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn terminal_jobs_do_not_move_backwards() {
        let (tracker, _) = tracker(1);
        let id = tracker.submit(2).await.unwrap();
        tracker.wait(&id, TICK).await.unwrap();
        assert!(!advance(&tracker.records, &id, JobStatus::Running, None, None).await);
        assert_eq!(tracker.poll(&id).await.status(), Some(JobStatus::Finished));
    }

    #[tokio::test]
    async fn workers_share_the_queue() {
        let (tracker, _) = tracker(3);
        let mut ids = Vec::new();
        for n in 1..=9 {
            ids.push(tracker.submit(n).await.unwrap());
        }
        for (n, id) in (1..=9).zip(&ids) {
            tracker.wait(id, TICK).await.unwrap();
            assert_eq!(tracker.fetch(id).await.unwrap(), n * 2);
        }
        assert_eq!(tracker.len().await, 9);
    }
}
