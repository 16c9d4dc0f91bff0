use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lifecycle events emitted while a job moves through the pipeline.
/// JSON-serializable payloads consumed by the real-time transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PipelineEvent {
    #[serde(rename_all = "camelCase")]
    ProcessingProgress {
        video_id: String,
        resolution: String,
        percent: u8,
        eta_seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    ProcessingComplete {
        video_id: String,
        resolution: String,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    VideoReady {
        video_id: String,
        resolutions: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ProcessingFailed { video_id: String, message: String },
}

/// One-way outlet for pipeline events. Implementations must never block;
/// delivery problems are theirs to log and swallow.
pub trait EventSink: Send + Sync {
    fn publish(&self, channel: &str, event: &PipelineEvent);
}

/// Logs events instead of delivering them; the fallback when no transport
/// is wired up.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, channel: &str, event: &PipelineEvent) {
        debug!(channel, event = ?event, "pipeline event");
    }
}

#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: String,
    pub event: PipelineEvent,
}

/// Hands events to an in-process consumer (the real-time transport
/// bridge) over an unbounded channel. A closed receiver is logged and
/// otherwise ignored.
#[derive(Debug, Clone)]
pub struct MpscEventSink {
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

impl MpscEventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for MpscEventSink {
    fn publish(&self, channel: &str, event: &PipelineEvent) {
        let message = ChannelMessage {
            channel: channel.to_string(),
            event: event.clone(),
        };
        if self.tx.send(message).is_err() {
            warn!(channel, "event transport closed, dropping pipeline event");
        }
    }
}

/// Fans pipeline events out to the per-uploader channel. Fire-and-forget:
/// a publish failure never fails or retries the owning pipeline step.
#[derive(Clone)]
pub struct ProgressPublisher {
    sink: Arc<dyn EventSink>,
    channel_prefix: String,
}

impl ProgressPublisher {
    pub fn new(sink: Arc<dyn EventSink>, channel_prefix: impl Into<String>) -> Self {
        Self {
            sink,
            channel_prefix: channel_prefix.into(),
        }
    }

    pub fn log_only() -> Self {
        Self::new(Arc::new(TracingEventSink), "progress")
    }

    pub fn channel_for(&self, uploader_id: &str) -> String {
        format!("{}:{}", self.channel_prefix, uploader_id)
    }

    pub fn publish(&self, uploader_id: &str, event: &PipelineEvent) {
        self.sink.publish(&self.channel_for(uploader_id), event);
    }
}

impl std::fmt::Debug for ProgressPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressPublisher")
            .field("channel_prefix", &self.channel_prefix)
            .finish()
    }
}
