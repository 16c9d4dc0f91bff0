use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// One entry of a resolution ladder: the target the encoder must produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRung {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
}

impl ResolutionRung {
    pub fn playlist_name(&self) -> String {
        format!("{}.m3u8", self.label)
    }

    pub fn segment_pattern(&self) -> String {
        format!("{}_%03d.ts", self.label)
    }
}

/// One finished rendition. Immutable once the encode that produced it
/// succeeded; owned by the job result after the whole job completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub playlist: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeProgress {
    pub percent: u8,
    pub eta_seconds: u64,
}

/// Throttles progress emission and derives an ETA from the recent
/// percent-per-second rate. Percent is monotone within one attempt; a retry
/// constructs a fresh tracker and restarts from zero.
#[derive(Debug)]
pub struct ProgressTracker {
    throttle: Duration,
    started: Instant,
    last_emit: Option<Instant>,
    last_percent: u8,
    last_sample: Option<(Instant, f64)>,
}

impl ProgressTracker {
    pub fn new(throttle: Duration, now: Instant) -> Self {
        Self {
            throttle,
            started: now,
            last_emit: None,
            last_percent: 0,
            last_sample: None,
        }
    }

    /// Feeds a raw percent observation; returns an event only when percent
    /// advanced and the throttle window elapsed.
    pub fn observe(&mut self, percent: f64, now: Instant) -> Option<EncodeProgress> {
        let percent = percent.clamp(0.0, 100.0);
        let rounded = percent.floor() as u8;
        if rounded <= self.last_percent && self.last_emit.is_some() {
            return None;
        }
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.throttle && rounded < 100 {
                return None;
            }
        }

        let rate = match self.last_sample {
            Some((at, seen)) => {
                let dt = now.duration_since(at).as_secs_f64();
                if dt > 0.0 {
                    (percent - seen) / dt
                } else {
                    0.0
                }
            }
            None => {
                let dt = now.duration_since(self.started).as_secs_f64();
                if dt > 0.0 {
                    percent / dt
                } else {
                    0.0
                }
            }
        };
        let eta_seconds = eta_from_rate(percent, rate);

        self.last_emit = Some(now);
        self.last_percent = rounded;
        self.last_sample = Some((now, percent));
        Some(EncodeProgress {
            percent: rounded,
            eta_seconds,
        })
    }
}

/// Moving-window estimate, not exact: remaining percent over the recent
/// rate, clamped to non-negative whole seconds.
fn eta_from_rate(percent: f64, rate: f64) -> u64 {
    const EPSILON: f64 = 1e-6;
    let remaining = (100.0 - percent).max(0.0);
    (remaining / rate.max(EPSILON)).round().min(u64::MAX as f64) as u64
}
