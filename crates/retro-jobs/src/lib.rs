//! Job tracking for pipeline runs.
//!
//! A [`JobTracker`] owns a shared queue and a fixed pool of workers. Submission
//! only records the job and enqueues it; workers move each job through
//! `queued -> running -> finished | failed` and keep the result for fetching.

mod status;
mod tracker;

pub use status::{JobPoll, JobSnapshot, JobStatus};
pub use tracker::{JobHandler, JobTracker};

use retro_pipeline::{PipelineCoordinator, PipelineJob};
use retro_types::{PipelineResult, Result};

/// Tracker type used by the service.
pub type PipelineTracker = JobTracker<PipelineCoordinator>;

#[async_trait::async_trait]
impl JobHandler for PipelineCoordinator {
    type Job = PipelineJob;
    type Output = PipelineResult;

    async fn handle(&self, job: PipelineJob) -> Result<PipelineResult> {
        self.run(&job).await
    }
}
