use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc::UnboundedReceiver;

use vodforge_core::encoder::ProgressFn;
use vodforge_core::{
    ChannelMessage, EncodeError, EncodeProgress, EncodeResult, EncodeRunner, EnqueueOptions,
    JobPayload, JobQueue, JobState, MpscEventSink, PipelineEvent, ProgressPublisher,
    ResolutionRung, SqliteVideoStore, VariantDescriptor, VideoStatus, WorkerConfig, WorkerPool,
};

/// Stand-in for the external encoder: writes the playlist artifact, emits
/// two progress samples and succeeds unless the rung label is scripted to
/// fail.
struct ScriptedRunner {
    duration: f64,
    fail_labels: Vec<String>,
}

impl ScriptedRunner {
    fn ok(duration: f64) -> Self {
        Self {
            duration,
            fail_labels: Vec::new(),
        }
    }

    fn failing(duration: f64, labels: &[&str]) -> Self {
        Self {
            duration,
            fail_labels: labels.iter().map(|label| label.to_string()).collect(),
        }
    }
}

#[async_trait]
impl EncodeRunner for ScriptedRunner {
    async fn run(
        &self,
        _source: &Path,
        out_dir: &Path,
        rung: &ResolutionRung,
        on_progress: &ProgressFn,
    ) -> EncodeResult<VariantDescriptor> {
        on_progress(EncodeProgress {
            percent: 50,
            eta_seconds: 1,
        });
        if self.fail_labels.contains(&rung.label) {
            return Err(EncodeError::Failed {
                label: rung.label.clone(),
                status: Some(1),
                stderr: "scripted encoder failure".to_string(),
            });
        }
        let playlist = out_dir.join(rung.playlist_name());
        tokio::fs::write(&playlist, "#EXTM3U\n#EXT-X-ENDLIST\n")
            .await
            .map_err(|source| EncodeError::Io {
                source,
                path: playlist.clone(),
            })?;
        on_progress(EncodeProgress {
            percent: 100,
            eta_seconds: 0,
        });
        Ok(VariantDescriptor {
            label: rung.label.clone(),
            width: rung.width,
            height: rung.height,
            bitrate_kbps: rung.bitrate_kbps,
            playlist,
        })
    }

    async fn probe_duration(&self, _source: &Path) -> EncodeResult<f64> {
        Ok(self.duration)
    }
}

fn ladder() -> Vec<ResolutionRung> {
    vec![
        ResolutionRung {
            label: "240p".to_string(),
            width: 426,
            height: 240,
            bitrate_kbps: 400,
        },
        ResolutionRung {
            label: "480p".to_string(),
            width: 854,
            height: 480,
            bitrate_kbps: 1200,
        },
        ResolutionRung {
            label: "720p".to_string(),
            width: 1280,
            height: 720,
            bitrate_kbps: 2500,
        },
    ]
}

struct Harness {
    dir: TempDir,
    queue: JobQueue,
    videos: SqliteVideoStore,
    pool: WorkerPool,
    events: UnboundedReceiver<ChannelMessage>,
}

impl Harness {
    fn new(runner: Arc<dyn EncodeRunner>) -> Self {
        Self::with_lease(runner, Duration::from_secs(600))
    }

    fn with_lease(runner: Arc<dyn EncodeRunner>, lease: Duration) -> Self {
        let dir = tempdir().unwrap();
        let queue = JobQueue::builder()
            .path(dir.path().join("jobs.sqlite"))
            .backoff_base(Duration::from_millis(5))
            .lease(lease)
            .build()
            .unwrap();
        queue.initialize().unwrap();
        let videos = SqliteVideoStore::new(dir.path().join("videos.sqlite")).unwrap();
        videos.initialize().unwrap();
        let (sink, events) = MpscEventSink::channel();
        let publisher = ProgressPublisher::new(Arc::new(sink), "progress");
        let pool = WorkerPool::new(
            queue.clone(),
            videos.clone(),
            publisher,
            runner,
            WorkerConfig {
                concurrency: 2,
                poll_interval: Duration::from_millis(10),
                media_root: dir.path().join("media"),
                keep_completed: 100,
                keep_failed: 500,
            },
        );
        Self {
            dir,
            queue,
            videos,
            pool,
            events,
        }
    }

    fn submit(&self, video_id: &str, with_source: bool, max_attempts: u32) -> (String, PathBuf) {
        let source = self.dir.path().join(format!("{video_id}-upload.mp4"));
        if with_source {
            std::fs::write(&source, b"fake mp4 bytes").unwrap();
        }
        self.videos
            .create_processing(video_id, "user-1", "Test upload")
            .unwrap();
        let job_id = self
            .queue
            .enqueue(
                &JobPayload {
                    source_path: source.clone(),
                    video_id: video_id.to_string(),
                    uploader_id: "user-1".to_string(),
                    ladder: ladder(),
                },
                &EnqueueOptions {
                    max_attempts,
                    delay: None,
                },
            )
            .unwrap();
        (job_id, source)
    }

    /// Enqueues a job whose video record was never created, so result
    /// persistence is guaranteed to fail after the encodes succeed.
    fn submit_unregistered(&self, video_id: &str, max_attempts: u32) -> (String, PathBuf) {
        let source = self.dir.path().join(format!("{video_id}-upload.mp4"));
        std::fs::write(&source, b"fake mp4 bytes").unwrap();
        let job_id = self
            .queue
            .enqueue(
                &JobPayload {
                    source_path: source.clone(),
                    video_id: video_id.to_string(),
                    uploader_id: "user-1".to_string(),
                    ladder: ladder(),
                },
                &EnqueueOptions {
                    max_attempts,
                    delay: None,
                },
            )
            .unwrap();
        (job_id, source)
    }

    fn drain_events(&mut self) -> Vec<ChannelMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.events.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn out_dir(&self, video_id: &str) -> PathBuf {
        self.dir.path().join("media/videos").join(video_id)
    }
}

#[tokio::test]
async fn successful_job_publishes_video() {
    let mut harness = Harness::new(Arc::new(ScriptedRunner::ok(120.0)));
    let (job_id, source) = harness.submit("vid-1", true, 3);

    assert_eq!(harness.pool.run_until_idle().await.unwrap(), 1);

    let job = harness.queue.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.progress, 100);
    let result = job.result.expect("completed job carries its outcome");
    assert_eq!(result.variants.len(), 3);

    // Every rendition playlist plus the master manifest and checksums.
    let out_dir = harness.out_dir("vid-1");
    for label in ["240p", "480p", "720p"] {
        assert!(out_dir.join(format!("{label}.m3u8")).exists());
    }
    let master = std::fs::read_to_string(out_dir.join("index.m3u8")).unwrap();
    assert_eq!(master.matches("#EXT-X-STREAM-INF").count(), 3);
    let first = master.find("240p.m3u8").unwrap();
    let last = master.find("720p.m3u8").unwrap();
    assert!(first < last, "variants must keep ladder order");
    assert!(out_dir.join("checksums.json").exists());

    let video = harness.videos.get("vid-1").unwrap();
    assert_eq!(video.status, VideoStatus::Published);
    assert_eq!(video.manifest_url.as_deref(), Some("videos/vid-1/index.m3u8"));
    assert_eq!(video.variants.len(), 3);
    assert_eq!(video.duration, Some(120.0));

    // The upload is discarded only after success.
    assert!(!source.exists());

    let events = harness.drain_events();
    assert!(events
        .iter()
        .all(|message| message.channel == "progress:user-1"));
    let ready = events
        .iter()
        .find(|message| matches!(message.event, PipelineEvent::VideoReady { .. }))
        .expect("video-ready event");
    match &ready.event {
        PipelineEvent::VideoReady {
            video_id,
            resolutions,
        } => {
            assert_eq!(video_id, "vid-1");
            assert_eq!(resolutions, &["240p", "480p", "720p"]);
        }
        _ => unreachable!(),
    }
    assert_eq!(
        events
            .iter()
            .filter(|message| matches!(
                message.event,
                PipelineEvent::ProcessingComplete { .. }
            ))
            .count(),
        3
    );
}

#[tokio::test]
async fn failing_rung_exhausts_retries_and_fails_video() {
    let mut harness = Harness::new(Arc::new(ScriptedRunner::failing(60.0, &["480p"])));
    let (job_id, source) = harness.submit("vid-1", true, 3);

    assert_eq!(harness.pool.run_until_idle().await.unwrap(), 3);

    let job = harness.queue.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
    assert!(job.last_error.unwrap().contains("480p"));

    let video = harness.videos.get("vid-1").unwrap();
    assert_eq!(video.status, VideoStatus::Failed);
    assert!(video.manifest_url.is_none());

    // Failed jobs keep the upload for inspection or resubmission.
    assert!(source.exists());
    assert!(!harness.out_dir("vid-1").join("index.m3u8").exists());

    let events = harness.drain_events();
    let failed = events
        .iter()
        .filter(|message| matches!(message.event, PipelineEvent::ProcessingFailed { .. }))
        .count();
    assert_eq!(failed, 1, "only the terminal attempt notifies the uploader");
}

#[tokio::test]
async fn missing_source_fails_without_retries() {
    let mut harness = Harness::new(Arc::new(ScriptedRunner::ok(60.0)));
    let (job_id, _source) = harness.submit("vid-1", false, 3);

    assert_eq!(harness.pool.run_until_idle().await.unwrap(), 1);

    let job = harness.queue.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("source file missing"));
    assert_eq!(
        harness.videos.get("vid-1").unwrap().status,
        VideoStatus::Failed
    );

    let events = harness.drain_events();
    assert!(events
        .iter()
        .any(|message| matches!(message.event, PipelineEvent::ProcessingFailed { .. })));
}

#[tokio::test]
async fn lease_expiry_on_last_attempt_fails_video_and_notifies() {
    let mut harness = Harness::with_lease(
        Arc::new(ScriptedRunner::ok(60.0)),
        Duration::from_millis(20),
    );
    let (job_id, _source) = harness.submit("vid-1", true, 1);

    // A worker claims the job's only attempt and dies before finishing it.
    harness.queue.claim().unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.pool.run_until_idle().await.unwrap(), 0);

    let job = harness.queue.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.unwrap().contains("lease expired"));
    assert_eq!(
        harness.videos.get("vid-1").unwrap().status,
        VideoStatus::Failed
    );

    let events = harness.drain_events();
    let failed = events
        .iter()
        .find(|message| matches!(message.event, PipelineEvent::ProcessingFailed { .. }))
        .expect("terminal reclaim must notify the uploader");
    assert_eq!(failed.channel, "progress:user-1");
    match &failed.event {
        PipelineEvent::ProcessingFailed { video_id, message } => {
            assert_eq!(video_id, "vid-1");
            assert!(message.contains("lease expired"));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn persistence_failure_retries_then_fails_terminally() {
    let mut harness = Harness::new(Arc::new(ScriptedRunner::ok(60.0)));
    let (job_id, source) = harness.submit_unregistered("vid-ghost", 2);

    assert_eq!(harness.pool.run_until_idle().await.unwrap(), 2);

    let job = harness.queue.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 2);
    assert!(job.last_error.unwrap().contains("video not found"));

    // The encodes and manifest themselves succeeded on every attempt; only
    // persistence failed, and the upload stays behind for resubmission.
    assert!(harness.out_dir("vid-ghost").join("index.m3u8").exists());
    assert!(source.exists());

    let events = harness.drain_events();
    assert!(events
        .iter()
        .any(|message| matches!(message.event, PipelineEvent::ProcessingFailed { .. })));
}

#[tokio::test]
async fn concurrent_jobs_keep_separate_output_directories() {
    let mut harness = Harness::new(Arc::new(ScriptedRunner::ok(30.0)));
    let (first, _) = harness.submit("vid-1", true, 3);
    let (second, _) = harness.submit("vid-2", true, 3);

    assert_eq!(harness.pool.run_until_idle().await.unwrap(), 2);

    for (job_id, video_id) in [(first, "vid-1"), (second, "vid-2")] {
        assert_eq!(
            harness.queue.get_job(&job_id).unwrap().state,
            JobState::Completed
        );
        assert!(harness.out_dir(video_id).join("index.m3u8").exists());
        assert_eq!(
            harness.videos.get(video_id).unwrap().status,
            VideoStatus::Published
        );
    }

    let events = harness.drain_events();
    assert_eq!(
        events
            .iter()
            .filter(|message| matches!(message.event, PipelineEvent::VideoReady { .. }))
            .count(),
        2
    );
}
