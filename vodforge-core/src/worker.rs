use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::VodforgeConfig;
use crate::encoder::{EncodeError, EncodeProgress, EncodeRunner};
use crate::events::{PipelineEvent, ProgressPublisher};
use crate::manifest::{self, ManifestError, MASTER_MANIFEST_NAME};
use crate::queue::{Job, JobOutcome, JobPayload, JobQueue, JobState, QueueError};
use crate::videos::{SqliteVideoStore, VideoStoreError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("video store error: {0}")]
    Videos(#[from] VideoStoreError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub media_root: PathBuf,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl WorkerConfig {
    pub fn from_config(config: &VodforgeConfig) -> Self {
        Self {
            concurrency: config.queue.worker_concurrency,
            poll_interval: config.queue.poll_interval(),
            media_root: config.media_root(),
            keep_completed: config.queue.keep_completed,
            keep_failed: config.queue.keep_failed,
        }
    }
}

/// Bounded set of concurrent job consumers. Each worker pulls the next
/// due job, runs the full per-job pipeline (all rung encodes, manifest
/// assembly, persistence) and reports the outcome back to the queue.
///
/// The pipeline is all-or-nothing per attempt: one failing rung fails the
/// whole job, and a retried attempt restarts every rung from scratch,
/// overwriting the previous attempt's files in the job's own directory.
#[derive(Clone)]
pub struct WorkerPool {
    queue: JobQueue,
    videos: SqliteVideoStore,
    publisher: ProgressPublisher,
    runner: Arc<dyn EncodeRunner>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        videos: SqliteVideoStore,
        publisher: ProgressPublisher,
        runner: Arc<dyn EncodeRunner>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            videos,
            publisher,
            runner,
            config,
        }
    }

    /// Runs `concurrency` worker loops until the shutdown flag flips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut handles = Vec::new();
        for worker_id in 0..self.config.concurrency.max(1) {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, shutdown).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Processes jobs until the queue holds nothing waiting or active,
    /// then returns the number of attempts executed. Used by tests and the
    /// CLI's one-shot mode; waits out backoff delays.
    pub async fn run_until_idle(&self) -> WorkerResult<usize> {
        let mut processed = 0;
        loop {
            if self.step().await? {
                processed += 1;
                continue;
            }
            let metrics = self.queue.metrics()?;
            let pending = metrics.counts.get(&JobState::Waiting).copied().unwrap_or(0)
                + metrics.counts.get(&JobState::Active).copied().unwrap_or(0);
            if pending == 0 {
                return Ok(processed);
            }
            sleep(self.config.poll_interval).await;
        }
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id, queue = self.queue.queue_name(), "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.step().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(error) => {
                    warn!(worker_id, %error, "worker iteration failed");
                    sleep(self.config.poll_interval).await;
                }
            }
        }
        info!(worker_id, "worker stopped");
    }

    /// Claims and processes at most one job. Returns whether a job ran.
    /// Jobs that the lease sweep failed terminally (a worker died on their
    /// last attempt) get the same failure bookkeeping as a local attempt.
    pub async fn step(&self) -> WorkerResult<bool> {
        let reclaimed = self.queue.reclaim_expired()?;
        for job in &reclaimed.failed {
            let message = job
                .last_error
                .clone()
                .unwrap_or_else(|| "worker lease expired".to_string());
            warn!(
                job_id = %job.id,
                video_id = %job.payload.video_id,
                "job failed terminally after lease expiry"
            );
            self.record_terminal_failure(&job.payload, &message);
        }
        match self.queue.claim()? {
            Some(job) => {
                self.process(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process(&self, job: Job) -> WorkerResult<()> {
        let payload = job.payload.clone();
        info!(
            job_id = %job.id,
            video_id = %payload.video_id,
            attempt = job.attempts,
            rungs = payload.ladder.len(),
            "processing transcode job"
        );

        // Validation failures are not transient; they skip the retry policy.
        if let Err(reason) = self.validate(&payload).await {
            warn!(job_id = %job.id, reason = %reason, "rejecting job before encode");
            let state = self.queue.nack(&job.id, &reason, false)?;
            if state == JobState::Failed {
                self.record_terminal_failure(&payload, &reason);
            }
            self.trim_history();
            return Ok(());
        }

        let out_dir = self
            .config
            .media_root
            .join("videos")
            .join(&payload.video_id);
        match self.run_attempt(&job, &out_dir).await {
            Ok(outcome) => {
                self.queue.ack(&job.id, &outcome)?;
                let resolutions = outcome
                    .variants
                    .iter()
                    .map(|variant| variant.label.clone())
                    .collect();
                self.publisher.publish(
                    &payload.uploader_id,
                    &PipelineEvent::VideoReady {
                        video_id: payload.video_id.clone(),
                        resolutions,
                    },
                );
                self.discard_source(&payload.source_path).await;
                info!(job_id = %job.id, video_id = %payload.video_id, "transcode job completed");
            }
            Err(error) => {
                let message = error.to_string();
                warn!(
                    job_id = %job.id,
                    video_id = %payload.video_id,
                    attempt = job.attempts,
                    error = %message,
                    "transcode attempt failed"
                );
                let state = self.queue.nack(&job.id, &message, true)?;
                if state == JobState::Failed {
                    self.record_terminal_failure(&payload, &message);
                }
            }
        }
        self.trim_history();
        Ok(())
    }

    /// One full attempt: concurrent rung encodes behind a join barrier,
    /// then manifest assembly and result persistence. Any error here fails
    /// the whole attempt; partial outputs stay behind to be overwritten by
    /// the next attempt.
    async fn run_attempt(&self, job: &Job, out_dir: &Path) -> WorkerResult<JobOutcome> {
        let payload = &job.payload;
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|source| WorkerError::Io {
                path: out_dir.to_path_buf(),
                source,
            })?;
        let duration = self.runner.probe_duration(&payload.source_path).await?;

        let total = payload.ladder.len();
        let percents = Arc::new(Mutex::new(vec![0u8; total]));
        let mut callbacks: Vec<Box<dyn Fn(EncodeProgress) + Send + Sync>> =
            Vec::with_capacity(total);
        for (index, rung) in payload.ladder.iter().enumerate() {
            let percents = Arc::clone(&percents);
            let queue = self.queue.clone();
            let publisher = self.publisher.clone();
            let job_id = job.id.clone();
            let video_id = payload.video_id.clone();
            let uploader_id = payload.uploader_id.clone();
            let label = rung.label.clone();
            callbacks.push(Box::new(move |progress: EncodeProgress| {
                let aggregate = {
                    let mut slots = percents.lock().unwrap();
                    slots[index] = progress.percent;
                    let sum: u32 = slots.iter().map(|p| *p as u32).sum();
                    (sum / slots.len() as u32) as u8
                };
                if let Err(error) = queue.set_progress(&job_id, aggregate) {
                    debug!(job_id = %job_id, %error, "failed to record job progress");
                }
                publisher.publish(
                    &uploader_id,
                    &PipelineEvent::ProcessingProgress {
                        video_id: video_id.clone(),
                        resolution: label.clone(),
                        percent: progress.percent,
                        eta_seconds: progress.eta_seconds,
                    },
                );
            }));
        }

        let tasks = payload
            .ladder
            .iter()
            .zip(callbacks.iter())
            .map(|(rung, on_progress)| {
                let runner = Arc::clone(&self.runner);
                let publisher = self.publisher.clone();
                let source = payload.source_path.clone();
                let out_dir = out_dir.to_path_buf();
                let video_id = payload.video_id.clone();
                let uploader_id = payload.uploader_id.clone();
                async move {
                    let variant = runner
                        .run(&source, &out_dir, rung, on_progress.as_ref())
                        .await?;
                    publisher.publish(
                        &uploader_id,
                        &PipelineEvent::ProcessingComplete {
                            video_id,
                            resolution: variant.label.clone(),
                            url: variant.playlist.to_string_lossy().to_string(),
                        },
                    );
                    Ok::<_, EncodeError>(variant)
                }
            });
        let variants = futures::future::try_join_all(tasks).await?;

        let manifest_path = manifest::build_master(out_dir, &variants).await?;
        if let Err(error) = manifest::write_checksums(out_dir, &variants).await {
            warn!(video_id = %payload.video_id, %error, "failed to write checksums artifact");
        }

        let manifest_url = format!("videos/{}/{MASTER_MANIFEST_NAME}", payload.video_id);
        self.videos
            .persist_success(&payload.video_id, &manifest_url, &variants, duration)?;

        Ok(JobOutcome {
            variants,
            manifest_path,
        })
    }

    async fn validate(&self, payload: &JobPayload) -> Result<(), String> {
        if payload.ladder.is_empty() {
            return Err("resolution ladder is empty".to_string());
        }
        if tokio::fs::metadata(&payload.source_path).await.is_err() {
            return Err(format!(
                "source file missing or unreadable: {}",
                payload.source_path.display()
            ));
        }
        Ok(())
    }

    /// Terminal-failure bookkeeping: the video record and the uploader
    /// both learn about it, the job already holds the error.
    fn record_terminal_failure(&self, payload: &JobPayload, message: &str) {
        if let Err(error) = self.videos.persist_failure(&payload.video_id) {
            warn!(video_id = %payload.video_id, %error, "failed to mark video record failed");
        }
        self.publisher.publish(
            &payload.uploader_id,
            &PipelineEvent::ProcessingFailed {
                video_id: payload.video_id.clone(),
                message: message.to_string(),
            },
        );
    }

    /// The upload is deleted only once the job is acknowledged; a failed
    /// deletion is never fatal.
    async fn discard_source(&self, source: &Path) {
        if let Err(error) = tokio::fs::remove_file(source).await {
            warn!(path = %source.display(), %error, "failed to remove source upload");
        }
    }

    fn trim_history(&self) {
        if let Err(error) = self
            .queue
            .trim_history(self.config.keep_completed, self.config.keep_failed)
        {
            debug!(%error, "history trim failed");
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queue", &self.queue.queue_name())
            .field("config", &self.config)
            .finish()
    }
}
