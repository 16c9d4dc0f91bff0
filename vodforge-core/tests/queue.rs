use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::tempdir;
use vodforge_core::{
    EnqueueOptions, JobFilter, JobOutcome, JobPayload, JobQueue, JobState, QueueError,
    ResolutionRung, VariantDescriptor,
};

fn payload(video_id: &str) -> JobPayload {
    JobPayload {
        source_path: PathBuf::from(format!("/uploads/{video_id}.mp4")),
        video_id: video_id.to_string(),
        uploader_id: "user-1".to_string(),
        ladder: vec![ResolutionRung {
            label: "240p".to_string(),
            width: 426,
            height: 240,
            bitrate_kbps: 400,
        }],
    }
}

fn outcome() -> JobOutcome {
    JobOutcome {
        variants: vec![VariantDescriptor {
            label: "240p".to_string(),
            width: 426,
            height: 240,
            bitrate_kbps: 400,
            playlist: PathBuf::from("/media/videos/vid-1/240p.m3u8"),
        }],
        manifest_path: PathBuf::from("/media/videos/vid-1/index.m3u8"),
    }
}

fn open_queue(path: &std::path::Path) -> JobQueue {
    let queue = JobQueue::builder()
        .path(path)
        .backoff_base(Duration::from_millis(50))
        .build()
        .unwrap();
    queue.initialize().unwrap();
    queue
}

#[test]
fn claim_ack_lifecycle() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir.path().join("jobs.sqlite"));

    assert!(queue.claim().unwrap().is_none());

    let id = queue
        .enqueue(&payload("vid-1"), &EnqueueOptions::default())
        .unwrap();
    let job = queue.claim().unwrap().expect("job should be due");
    assert_eq!(job.id, id);
    assert_eq!(job.state, JobState::Active);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.progress, 0);
    assert_eq!(job.payload.video_id, "vid-1");

    // Second claim sees nothing while the job is leased.
    assert!(queue.claim().unwrap().is_none());

    queue.set_progress(&id, 40).unwrap();
    assert_eq!(queue.get_job(&id).unwrap().progress, 40);

    queue.ack(&id, &outcome()).unwrap();
    let done = queue.get_job(&id).unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.finished_at.is_some());
    let result = done.result.expect("completed job carries its outcome");
    assert_eq!(result.variants.len(), 1);
    assert_eq!(result.variants[0].label, "240p");
}

#[test]
fn ack_requires_active_job() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir.path().join("jobs.sqlite"));
    let id = queue
        .enqueue(&payload("vid-1"), &EnqueueOptions::default())
        .unwrap();
    let err = queue.ack(&id, &outcome()).unwrap_err();
    assert!(matches!(err, QueueError::NotActive { .. }));
    assert!(matches!(
        queue.ack("missing", &outcome()).unwrap_err(),
        QueueError::NotFound(_)
    ));
}

#[test]
fn retry_backs_off_then_redelivers() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir.path().join("jobs.sqlite"));
    let id = queue
        .enqueue(&payload("vid-1"), &EnqueueOptions::default())
        .unwrap();

    queue.claim().unwrap().unwrap();
    let state = queue.nack(&id, "encoder exited with status 1", true).unwrap();
    assert_eq!(state, JobState::Waiting);

    // Not due again until the backoff delay elapses.
    assert!(queue.claim().unwrap().is_none());
    std::thread::sleep(Duration::from_millis(150));
    let retried = queue.claim().unwrap().expect("job should be redelivered");
    assert_eq!(retried.id, id);
    assert_eq!(retried.attempts, 2);
    assert_eq!(retried.last_error.as_deref(), Some("encoder exited with status 1"));
}

#[test]
fn attempts_exhaustion_fails_job() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir.path().join("jobs.sqlite"));
    let id = queue
        .enqueue(
            &payload("vid-1"),
            &EnqueueOptions {
                max_attempts: 2,
                delay: None,
            },
        )
        .unwrap();

    queue.claim().unwrap().unwrap();
    assert_eq!(queue.nack(&id, "boom", true).unwrap(), JobState::Waiting);
    std::thread::sleep(Duration::from_millis(150));
    queue.claim().unwrap().unwrap();
    assert_eq!(queue.nack(&id, "boom again", true).unwrap(), JobState::Failed);

    let job = queue.get_job(&id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.last_error.as_deref(), Some("boom again"));
}

#[test]
fn non_retryable_failure_skips_retries() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir.path().join("jobs.sqlite"));
    let id = queue
        .enqueue(&payload("vid-1"), &EnqueueOptions::default())
        .unwrap();
    queue.claim().unwrap().unwrap();
    let state = queue.nack(&id, "source file missing", false).unwrap();
    assert_eq!(state, JobState::Failed);
    assert_eq!(queue.get_job(&id).unwrap().attempts, 1);
}

#[test]
fn expired_lease_is_reclaimed() {
    let dir = tempdir().unwrap();
    let queue = JobQueue::builder()
        .path(dir.path().join("jobs.sqlite"))
        .lease(Duration::from_millis(20))
        .build()
        .unwrap();
    queue.initialize().unwrap();

    let id = queue
        .enqueue(&payload("vid-1"), &EnqueueOptions::default())
        .unwrap();
    queue.claim().unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let report = queue.reclaim_expired().unwrap();
    assert_eq!(report.requeued, 1);
    assert!(report.failed.is_empty());
    let job = queue.get_job(&id).unwrap();
    assert_eq!(job.state, JobState::Waiting);

    // With attempts already exhausted the reclaim fails the job instead.
    let doomed = queue
        .enqueue(
            &payload("vid-2"),
            &EnqueueOptions {
                max_attempts: 1,
                delay: None,
            },
        )
        .unwrap();
    // vid-1 is claimed first (older), then vid-2.
    queue.claim().unwrap().unwrap();
    queue.claim().unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    let report = queue.reclaim_expired().unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, doomed);
    assert_eq!(report.failed[0].state, JobState::Failed);
    assert_eq!(report.failed[0].payload.video_id, "vid-2");
    let job = queue.get_job(&doomed).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.unwrap().contains("lease expired"));
}

#[test]
fn history_retention_evicts_oldest() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir.path().join("jobs.sqlite"));

    for index in 0..5 {
        let id = queue
            .enqueue(&payload(&format!("vid-{index}")), &EnqueueOptions::default())
            .unwrap();
        queue.claim().unwrap().unwrap();
        queue.ack(&id, &outcome()).unwrap();
    }

    let removed = queue.trim_history(2, 500).unwrap();
    assert_eq!(removed, 3);
    let remaining = queue
        .list(&JobFilter {
            state: Some(JobState::Completed),
            limit: None,
        })
        .unwrap();
    assert_eq!(remaining.len(), 2);
}

#[test]
fn metrics_count_by_state() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir.path().join("jobs.sqlite"));

    queue
        .enqueue(&payload("vid-1"), &EnqueueOptions::default())
        .unwrap();
    let done = queue
        .enqueue(&payload("vid-2"), &EnqueueOptions::default())
        .unwrap();
    // vid-1 claimed first; ack vid-2 on its own claim.
    let first = queue.claim().unwrap().unwrap();
    queue.nack(&first.id, "boom", false).unwrap();
    queue.claim().unwrap().unwrap();
    queue.ack(&done, &outcome()).unwrap();

    let metrics = queue.metrics().unwrap();
    assert_eq!(metrics.counts.get(&JobState::Completed), Some(&1));
    assert_eq!(metrics.counts.get(&JobState::Failed), Some(&1));
    assert_eq!(metrics.completed_last_hour, 1);
    assert_eq!(metrics.failed_last_hour, 1);
}

#[test]
fn backup_dumps_jobs_table() {
    let dir = tempdir().unwrap();
    let queue = open_queue(&dir.path().join("jobs.sqlite"));
    queue
        .enqueue(&payload("vid-1"), &EnqueueOptions::default())
        .unwrap();

    let output = dir.path().join("backups/jobs.sql.gz");
    queue.export_backup(&output).unwrap();

    let file = std::fs::File::open(&output).unwrap();
    let mut dump = String::new();
    flate2::read::GzDecoder::new(file)
        .read_to_string(&mut dump)
        .unwrap();
    assert!(dump.contains("CREATE TABLE IF NOT EXISTS jobs"));
    assert!(dump.contains("INSERT INTO jobs"));
    assert!(dump.contains("vid-1"));
}
