use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::encoder::ResolutionRung;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VodforgeConfig {
    pub paths: PathsSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub encoder: EncoderSection,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default = "default_ladder")]
    pub ladder: Vec<ResolutionRung>,
}

impl VodforgeConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir).join("jobs.sqlite")
    }

    pub fn videos_db_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir).join("videos.sqlite")
    }

    pub fn media_root(&self) -> PathBuf {
        self.resolve_path(&self.paths.media_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub media_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_keep_completed")]
    pub keep_completed: usize,
    #[serde(default = "default_keep_failed")]
    pub keep_failed: usize,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl QueueSection {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            worker_concurrency: default_concurrency(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
            lease_seconds: default_lease_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderSection {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: String,
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_audio_sample_rate")]
    pub audio_sample_rate: u32,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg(),
            ffprobe_path: default_ffprobe(),
            segment_seconds: default_segment_seconds(),
            audio_codec: default_audio_codec(),
            audio_sample_rate: default_audio_sample_rate(),
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsSection {
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,
}

impl EventsSection {
    pub fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            channel_prefix: default_channel_prefix(),
            progress_throttle_ms: default_progress_throttle_ms(),
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<VodforgeConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

fn default_queue_name() -> String {
    "video-processing".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    5000
}

fn default_concurrency() -> usize {
    1
}

fn default_keep_completed() -> usize {
    100
}

fn default_keep_failed() -> usize {
    500
}

fn default_lease_seconds() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_segment_seconds() -> u32 {
    6
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_sample_rate() -> u32 {
    48_000
}

fn default_audio_bitrate() -> String {
    "128k".to_string()
}

fn default_channel_prefix() -> String {
    "progress".to_string()
}

fn default_progress_throttle_ms() -> u64 {
    300
}

fn default_ladder() -> Vec<ResolutionRung> {
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
