mod error;
mod types;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::config::{EncoderSection, EventsSection};

pub use error::{EncodeError, EncodeResult};
pub use types::{EncodeProgress, ProgressTracker, ResolutionRung, VariantDescriptor};

/// Callback invoked with throttled progress updates for one rendition.
pub type ProgressFn = dyn Fn(EncodeProgress) + Send + Sync;

/// Seam between the pipeline and the external encoder binary. The worker
/// pool only talks to this trait; tests substitute a scripted runner.
#[async_trait::async_trait]
pub trait EncodeRunner: Send + Sync {
    /// Produces one rendition of `source` into `out_dir`, reporting
    /// fractional progress. The output is a self-contained VOD playlist
    /// plus media segments named after the rung label.
    async fn run(
        &self,
        source: &Path,
        out_dir: &Path,
        rung: &ResolutionRung,
        on_progress: &ProgressFn,
    ) -> EncodeResult<VariantDescriptor>;

    /// Reports the duration of the source in seconds.
    async fn probe_duration(&self, source: &Path) -> EncodeResult<f64>;
}

#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub codec: String,
    pub sample_rate: u32,
    pub bitrate: String,
}

/// Drives one ffmpeg process per rendition and one ffprobe call per source.
#[derive(Debug, Clone)]
pub struct FfmpegRunner {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    segment_seconds: u32,
    audio: AudioSettings,
    throttle: Duration,
}

impl FfmpegRunner {
    pub fn new(encoder: &EncoderSection, events: &EventsSection) -> Self {
        Self {
            ffmpeg: PathBuf::from(&encoder.ffmpeg_path),
            ffprobe: PathBuf::from(&encoder.ffprobe_path),
            segment_seconds: encoder.segment_seconds,
            audio: AudioSettings {
                codec: encoder.audio_codec.clone(),
                sample_rate: encoder.audio_sample_rate,
                bitrate: encoder.audio_bitrate.clone(),
            },
            throttle: events.progress_throttle(),
        }
    }
}

#[async_trait::async_trait]
impl EncodeRunner for FfmpegRunner {
    async fn run(
        &self,
        source: &Path,
        out_dir: &Path,
        rung: &ResolutionRung,
        on_progress: &ProgressFn,
    ) -> EncodeResult<VariantDescriptor> {
        let duration = self.probe_duration(source).await?;
        let args = hls_args(source, out_dir, rung, self.segment_seconds, &self.audio);

        let mut command = Command::new(&self.ffmpeg);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|source| EncodeError::Spawn {
            program: self.ffmpeg.display().to_string(),
            source,
        })?;

        let stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_string(&mut buffer).await;
            }
            buffer
        });

        let mut tracker = ProgressTracker::new(self.throttle, Instant::now());
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(micros) = parse_out_time_us(&line) else {
                    continue;
                };
                if duration <= 0.0 {
                    continue;
                }
                let percent = (micros as f64 / 1_000_000.0) / duration * 100.0;
                if let Some(event) = tracker.observe(percent, Instant::now()) {
                    on_progress(event);
                }
            }
        }

        let status = child.wait().await.map_err(|source| EncodeError::Spawn {
            program: self.ffmpeg.display().to_string(),
            source,
        })?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(EncodeError::Failed {
                label: rung.label.clone(),
                status: status.code(),
                stderr: tail(&stderr, 2000),
            });
        }

        if let Some(event) = tracker.observe(100.0, Instant::now()) {
            on_progress(event);
        }
        Ok(VariantDescriptor {
            label: rung.label.clone(),
            width: rung.width,
            height: rung.height,
            bitrate_kbps: rung.bitrate_kbps,
            playlist: out_dir.join(rung.playlist_name()),
        })
    }

    async fn probe_duration(&self, source: &Path) -> EncodeResult<f64> {
        if tokio::fs::metadata(source).await.is_err() {
            return Err(EncodeError::InvalidSource(source.to_path_buf()));
        }
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(source)
            .output()
            .await
            .map_err(|source| EncodeError::Spawn {
                program: self.ffprobe.display().to_string(),
                source,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(EncodeError::Probe(tail(&stderr, 500)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<f64>()
            .map_err(|_| EncodeError::Probe(format!("unparseable duration: {}", stdout.trim())))
    }
}

/// Builds the argument vector for one HLS rendition: scale to the rung's
/// geometry, target video bitrate, fixed audio settings, VOD playlist with
/// fixed segment duration, machine-readable progress on stdout.
pub fn hls_args(
    source: &Path,
    out_dir: &Path,
    rung: &ResolutionRung,
    segment_seconds: u32,
    audio: &AudioSettings,
) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        source.to_string_lossy().to_string(),
        "-vf".to_string(),
        format!("scale={}:{}", rung.width, rung.height),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-b:v".to_string(),
        format!("{}k", rung.bitrate_kbps),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-c:a".to_string(),
        audio.codec.clone(),
        "-ar".to_string(),
        audio.sample_rate.to_string(),
        "-b:a".to_string(),
        audio.bitrate.clone(),
        "-ac".to_string(),
        "2".to_string(),
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        segment_seconds.to_string(),
        "-hls_playlist_type".to_string(),
        "vod".to_string(),
        "-hls_segment_filename".to_string(),
        out_dir.join(rung.segment_pattern()).to_string_lossy().to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-nostats".to_string(),
        out_dir.join(rung.playlist_name()).to_string_lossy().to_string(),
    ]
}

/// Extracts the transcoded position in microseconds from one line of
/// ffmpeg's `-progress` stream. ffmpeg emits `out_time_ms` in microseconds
/// (a long-standing quirk); newer builds also emit `out_time_us`.
fn parse_out_time_us(line: &str) -> Option<u64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.parse().ok(),
        _ => None,
    }
}

fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.trim_end().to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].trim_end().to_string()
}
