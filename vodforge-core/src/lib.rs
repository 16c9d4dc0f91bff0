pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod manifest;
pub mod queue;
pub mod service;
pub mod sqlite;
pub mod videos;
pub mod worker;

pub use config::{load_config, VodforgeConfig};
pub use encoder::{
    EncodeError, EncodeProgress, EncodeResult, EncodeRunner, FfmpegRunner, ProgressTracker,
    ResolutionRung, VariantDescriptor,
};
pub use error::{ConfigError, Result};
pub use events::{
    ChannelMessage, EventSink, MpscEventSink, PipelineEvent, ProgressPublisher, TracingEventSink,
};
pub use manifest::{ManifestError, ManifestResult};
pub use queue::{
    EnqueueOptions, Job, JobFilter, JobOutcome, JobPayload, JobQueue, JobQueueBuilder, JobState,
    QueueError, QueueMetrics, QueueResult, ReclaimReport,
};
pub use service::{JobStatusSnapshot, NewJob, SubmissionService};
pub use videos::{
    SqliteVideoStore, SqliteVideoStoreBuilder, VideoRecord, VideoStatus, VideoStoreError,
    VideoStoreResult,
};
pub use worker::{WorkerConfig, WorkerError, WorkerPool, WorkerResult};
