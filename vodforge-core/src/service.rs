use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::VodforgeConfig;
use crate::encoder::ResolutionRung;
use crate::queue::{
    EnqueueOptions, JobOutcome, JobPayload, JobQueue, JobState, QueueResult,
};

/// A submission request: where the upload landed and which video record
/// and uploader it belongs to. The ladder is optional; `None` means the
/// configured default.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub source_path: PathBuf,
    pub video_id: String,
    pub uploader_id: String,
    pub ladder: Option<Vec<ResolutionRung>>,
}

/// Point-in-time view of one job, shaped for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusSnapshot {
    pub job_id: String,
    pub state: JobState,
    pub progress: u8,
    pub data: JobStatusData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Submission fields echoed back to the status caller. The title is not
/// duplicated into the job payload; it lives on the video record, keyed by
/// `video_id`, and status consumers that need it join through the store.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusData {
    pub video_id: String,
    pub uploader_id: String,
    pub source_path: PathBuf,
}

/// The producer-side API: accepts transcode submissions and answers
/// status polls. Submission is enqueue-and-return; it never waits for,
/// or observes, the processing outcome.
#[derive(Debug, Clone)]
pub struct SubmissionService {
    queue: JobQueue,
    default_ladder: Vec<ResolutionRung>,
    max_attempts: u32,
}

impl SubmissionService {
    pub fn new(queue: JobQueue, config: &VodforgeConfig) -> Self {
        Self {
            queue,
            default_ladder: config.ladder.clone(),
            max_attempts: config.queue.max_attempts,
        }
    }

    /// Enqueues a transcode job and returns its queue-assigned id.
    ///
    /// Ids are generated per submission, so submitting the same video
    /// twice yields two independent jobs racing over one output directory;
    /// callers own that guard.
    pub fn submit(&self, request: NewJob) -> QueueResult<String> {
        let ladder = request
            .ladder
            .unwrap_or_else(|| self.default_ladder.clone());
        let payload = JobPayload {
            source_path: request.source_path,
            video_id: request.video_id,
            uploader_id: request.uploader_id,
            ladder,
        };
        let options = EnqueueOptions {
            max_attempts: self.max_attempts,
            ..EnqueueOptions::default()
        };
        let id = self.queue.enqueue(&payload, &options)?;
        info!(
            job_id = %id,
            video_id = %payload.video_id,
            rungs = payload.ladder.len(),
            "transcode job submitted"
        );
        Ok(id)
    }

    pub fn job_status(&self, job_id: &str) -> QueueResult<JobStatusSnapshot> {
        let job = self.queue.get_job(job_id)?;
        Ok(JobStatusSnapshot {
            job_id: job.id,
            state: job.state,
            progress: job.progress,
            data: JobStatusData {
                video_id: job.payload.video_id,
                uploader_id: job.payload.uploader_id,
                source_path: job.payload.source_path,
            },
            result: job.result,
            last_error: job.last_error,
            created_at: job.created_at,
        })
    }
}
