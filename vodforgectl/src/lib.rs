use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use vodforge_core::{
    load_config, FfmpegRunner, JobFilter, JobQueue, JobState, JobStatusSnapshot, NewJob,
    ProgressPublisher, QueueError, SqliteVideoStore, SubmissionService, TracingEventSink,
    VideoRecord, VideoStoreError, VodforgeConfig, WorkerConfig, WorkerError, WorkerPool,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vodforge_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("video store error: {0}")]
    Videos(#[from] VideoStoreError),
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "vodforge command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main vodforge.toml
    #[arg(long, default_value = "configs/vodforge.toml")]
    pub config: PathBuf,
    /// Override directory for databases (replaces paths.data_dir)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Alternate path for jobs.sqlite
    #[arg(long)]
    pub jobs_db: Option<PathBuf>,
    /// Alternate path for videos.sqlite
    #[arg(long)]
    pub videos_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submits an uploaded file for transcoding
    Submit(SubmitArgs),
    /// Shows the status of one transcode job
    Status(StatusArgs),
    /// Shows one video record
    Video(VideoArgs),
    /// Worker pool operations
    #[command(subcommand)]
    Worker(WorkerCommands),
    /// Job queue operations
    #[command(subcommand)]
    Queue(QueueCommands),
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Path to the uploaded source file
    #[arg(long)]
    pub source: PathBuf,
    /// Video record id the job belongs to
    #[arg(long)]
    pub video_id: String,
    /// Uploader id, used for progress channel routing
    #[arg(long)]
    pub uploader_id: String,
    /// Title for the video record; defaults to the source file name
    #[arg(long)]
    pub title: Option<String>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    pub job_id: String,
}

#[derive(Args, Debug)]
pub struct VideoArgs {
    pub video_id: String,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommands {
    /// Runs the worker pool until interrupted (or until idle with --oneshot)
    Run(WorkerRunArgs),
}

#[derive(Args, Debug)]
pub struct WorkerRunArgs {
    /// Drain the queue and exit instead of polling forever
    #[arg(long, default_value_t = false)]
    pub oneshot: bool,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Lists jobs in the queue
    List(QueueListArgs),
    /// Shows queue counters
    Metrics,
    /// Evicts old completed/failed jobs beyond the retention caps
    Trim,
    /// Writes a gzip-compressed SQL dump of the jobs database
    Backup(QueueBackupArgs),
}

#[derive(Args, Debug)]
pub struct QueueListArgs {
    /// Filter by state (waiting, active, completed, failed)
    #[arg(long)]
    pub state: Option<JobState>,
    /// Maximum rows returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct QueueBackupArgs {
    /// Output path for the dump
    #[arg(long)]
    pub output: PathBuf,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Submit(args) => {
            let receipt = context.submit(args)?;
            render(&receipt, cli.format)?;
        }
        Commands::Status(args) => {
            let snapshot = context.job_status(&args.job_id)?;
            render(&snapshot, cli.format)?;
        }
        Commands::Video(args) => {
            let view = context.video(&args.video_id)?;
            render(&view, cli.format)?;
        }
        Commands::Worker(WorkerCommands::Run(args)) => {
            let report = context.worker_run(args)?;
            render(&report, cli.format)?;
        }
        Commands::Queue(QueueCommands::List(args)) => {
            let list = context.queue_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Queue(QueueCommands::Metrics) => {
            let report = context.queue_metrics()?;
            render(&report, cli.format)?;
        }
        Commands::Queue(QueueCommands::Trim) => {
            let report = context.queue_trim()?;
            render(&report, cli.format)?;
        }
        Commands::Queue(QueueCommands::Backup(args)) => {
            let report = context.queue_backup(args)?;
            render(&report, cli.format)?;
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
pub struct AppContext {
    config: VodforgeConfig,
    queue: JobQueue,
    videos: SqliteVideoStore,
}

impl AppContext {
    pub fn new(cli: &Cli) -> Result<Self> {
        let config = load_config(&cli.config)?;

        let data_dir = cli
            .data_dir
            .clone()
            .unwrap_or_else(|| config.resolve_path(&config.paths.data_dir));
        let jobs_db = cli
            .jobs_db
            .clone()
            .unwrap_or_else(|| data_dir.join("jobs.sqlite"));
        let videos_db = cli
            .videos_db
            .clone()
            .unwrap_or_else(|| data_dir.join("videos.sqlite"));
        std::fs::create_dir_all(&data_dir)?;

        let queue = JobQueue::builder()
            .path(&jobs_db)
            .queue_name(&config.queue.name)
            .lease(config.queue.lease())
            .backoff_base(config.queue.backoff_base())
            .build()?;
        queue.initialize()?;

        let videos = SqliteVideoStore::builder().path(&videos_db).build()?;
        videos.initialize()?;

        Ok(Self {
            config,
            queue,
            videos,
        })
    }

    fn submit(&self, args: &SubmitArgs) -> Result<SubmitReceipt> {
        let title = args.title.clone().unwrap_or_else(|| {
            args.source
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| args.video_id.clone())
        });
        self.register_video(&args.video_id, &args.uploader_id, &title)?;

        let service = SubmissionService::new(self.queue.clone(), &self.config);
        let job_id = service.submit(NewJob {
            source_path: args.source.clone(),
            video_id: args.video_id.clone(),
            uploader_id: args.uploader_id.clone(),
            ladder: None,
        })?;
        Ok(SubmitReceipt {
            job_id,
            video_id: args.video_id.clone(),
        })
    }

    /// A record that already exists means this is a resubmission; the job
    /// is still enqueued against it.
    fn register_video(&self, video_id: &str, owner_id: &str, title: &str) -> Result<()> {
        match self.videos.create_processing(video_id, owner_id, title) {
            Ok(()) => Ok(()),
            Err(VideoStoreError::Execute(rusqlite::Error::SqliteFailure(err, _)))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn job_status(&self, job_id: &str) -> Result<JobStatusSnapshot> {
        let service = SubmissionService::new(self.queue.clone(), &self.config);
        Ok(service.job_status(job_id)?)
    }

    fn video(&self, video_id: &str) -> Result<VideoView> {
        Ok(VideoView::from_record(self.videos.get(video_id)?))
    }

    fn worker_run(&self, args: &WorkerRunArgs) -> Result<WorkerReport> {
        let runner = Arc::new(FfmpegRunner::new(&self.config.encoder, &self.config.events));
        let publisher = ProgressPublisher::new(
            Arc::new(TracingEventSink),
            self.config.events.channel_prefix.clone(),
        );
        let pool = WorkerPool::new(
            self.queue.clone(),
            self.videos.clone(),
            publisher,
            runner,
            WorkerConfig::from_config(&self.config),
        );

        let runtime = tokio::runtime::Runtime::new()?;
        if args.oneshot {
            let processed = runtime.block_on(pool.run_until_idle())?;
            return Ok(WorkerReport { processed });
        }
        runtime.block_on(async move {
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = tx.send(true);
                }
            });
            pool.run(rx).await;
        });
        Ok(WorkerReport { processed: 0 })
    }

    fn queue_list(&self, args: &QueueListArgs) -> Result<JobList> {
        let jobs = self.queue.list(&JobFilter {
            state: args.state,
            limit: Some(args.limit),
        })?;
        let rows = jobs
            .into_iter()
            .map(|job| JobRow {
                id: job.id,
                state: job.state.to_string(),
                video_id: job.payload.video_id,
                attempts: job.attempts,
                progress: job.progress,
                created_at: job.created_at.map(|ts| ts.to_rfc3339()),
                last_error: job.last_error,
            })
            .collect();
        Ok(JobList { rows })
    }

    fn queue_metrics(&self) -> Result<MetricsReport> {
        let metrics = self.queue.metrics()?;
        let counts = metrics
            .counts
            .into_iter()
            .map(|(state, count)| (state.as_str().to_string(), count))
            .collect();
        Ok(MetricsReport {
            counts,
            completed_last_hour: metrics.completed_last_hour,
            failed_last_hour: metrics.failed_last_hour,
        })
    }

    fn queue_trim(&self) -> Result<TrimReport> {
        let removed = self
            .queue
            .trim_history(self.config.queue.keep_completed, self.config.queue.keep_failed)?;
        Ok(TrimReport { removed })
    }

    fn queue_backup(&self, args: &QueueBackupArgs) -> Result<BackupReport> {
        self.queue.export_backup(&args.output)?;
        Ok(BackupReport {
            output: args.output.clone(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub video_id: String,
}

impl DisplayFallback for SubmitReceipt {
    fn display(&self) -> String {
        format!("job {} submitted for video {}", self.job_id, self.video_id)
    }
}

impl DisplayFallback for JobStatusSnapshot {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Job: {}", self.job_id),
            format!("State: {} ({}%)", self.state, self.progress),
            format!("Video: {}", self.data.video_id),
        ];
        if let Some(error) = &self.last_error {
            lines.push(format!("Last error: {error}"));
        }
        if let Some(result) = &self.result {
            lines.push(format!("Manifest: {}", result.manifest_path.display()));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct VideoView {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,
    pub resolutions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl VideoView {
    fn from_record(record: VideoRecord) -> Self {
        let mut resolutions: Vec<String> = record.variants.keys().cloned().collect();
        resolutions.sort();
        Self {
            id: record.id,
            owner_id: record.owner_id,
            title: record.title,
            status: record.status.to_string(),
            manifest_url: record.manifest_url,
            resolutions,
            duration: record.duration,
        }
    }
}

impl DisplayFallback for VideoView {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Video: {} ({})", self.id, self.title),
            format!("Status: {}", self.status),
        ];
        if let Some(url) = &self.manifest_url {
            lines.push(format!("Manifest: {url}"));
        }
        if !self.resolutions.is_empty() {
            lines.push(format!("Resolutions: {}", self.resolutions.join(", ")));
        }
        if let Some(duration) = self.duration {
            lines.push(format!("Duration: {duration:.1} s"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct WorkerReport {
    pub processed: usize,
}

impl DisplayFallback for WorkerReport {
    fn display(&self) -> String {
        format!("processed {} job attempt(s)", self.processed)
    }
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub rows: Vec<JobRow>,
}

#[derive(Debug, Serialize)]
pub struct JobRow {
    pub id: String,
    pub state: String,
    pub video_id: String,
    pub attempts: u32,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DisplayFallback for JobList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no jobs found".to_string();
        }
        let mut lines = Vec::new();
        for row in &self.rows {
            let mut line = format!(
                "{}  {}  {}%  attempts {}  video {}",
                row.id, row.state, row.progress, row.attempts, row.video_id
            );
            if let Some(error) = &row.last_error {
                line.push_str(&format!("  ({error})"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsReport {
    pub counts: HashMap<String, i64>,
    pub completed_last_hour: i64,
    pub failed_last_hour: i64,
}

impl DisplayFallback for MetricsReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        let mut states: Vec<&String> = self.counts.keys().collect();
        states.sort();
        for state in states {
            lines.push(format!("{}: {}", state, self.counts[state]));
        }
        lines.push(format!("completed last hour: {}", self.completed_last_hour));
        lines.push(format!("failed last hour: {}", self.failed_last_hour));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct TrimReport {
    pub removed: usize,
}

impl DisplayFallback for TrimReport {
    fn display(&self) -> String {
        format!("removed {} job(s)", self.removed)
    }
}

#[derive(Debug, Serialize)]
pub struct BackupReport {
    pub output: PathBuf,
}

impl DisplayFallback for BackupReport {
    fn display(&self) -> String {
        format!("backup written to {}", self.output.display())
    }
}
