//! Signal-loss tracking, coordinated drop flags, and pipeline metrics

use anyhow::{Result, bail};
use log::{info, warn};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::types::Frame;

/// Domain whose pacing state a stall must reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropDomain {
    VideoEncoder,
    AudioEncoder,
    Mux,
}

/// Ingress domain reporting frame arrivals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalDomain {
    Video,
    Audio,
}

/// Outcome of an arrival report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalVerdict {
    /// Frame arrived within tolerance
    Ok,
    /// Gap exceeded the stall threshold; drop flags were raised
    Stalled { gap: Duration },
    /// Gap exceeded the configured hard loss limit; pipeline must terminate
    FatalLoss { gap: Duration },
}

#[derive(Default)]
struct DropFlags {
    video: bool,
    audio: bool,
    mux: bool,
}

/// Central point for loss-of-signal detection and coordinated resets.
///
/// A stalled source is detected when the next frame finally arrives and the
/// gap since the previous one exceeds the threshold. The three drop flags
/// are raised together, not just for the domain that stalled: downstream
/// stages are coupled through the shared audio clock, so a video stall must
/// also reset audio-dependent pacing state. Each owning stage then calls
/// [`SignalHealthController::take_and_clear`] once, at the top of its next
/// frame, so exactly one reset occurs per stall episode.
pub struct SignalHealthController {
    flags: Mutex<DropFlags>,
    signal_lost: AtomicBool,
    last_video_arrival: AtomicI64,
    last_audio_arrival: AtomicI64,
    stall_threshold_us: i64,
    /// 0 disables the hard limit
    hard_loss_limit_us: i64,
    pub metrics: PipelineMetrics,
}

impl SignalHealthController {
    pub fn new(stall_threshold: Duration, hard_loss_limit: Option<Duration>) -> Self {
        Self {
            flags: Mutex::new(DropFlags::default()),
            signal_lost: AtomicBool::new(false),
            last_video_arrival: AtomicI64::new(0),
            last_audio_arrival: AtomicI64::new(0),
            stall_threshold_us: stall_threshold.as_micros() as i64,
            hard_loss_limit_us: hard_loss_limit.map(|d| d.as_micros() as i64).unwrap_or(0),
            metrics: PipelineMetrics::new(),
        }
    }

    /// Called by ingress for every arriving frame, with the wall clock in
    /// unix microseconds. Raises the drop flags when the gap since the
    /// previous arrival in `domain` exceeds the stall threshold.
    pub fn report_frame_arrival(&self, domain: ArrivalDomain, now_micros: i64) -> ArrivalVerdict {
        let slot = match domain {
            ArrivalDomain::Video => &self.last_video_arrival,
            ArrivalDomain::Audio => &self.last_audio_arrival,
        };
        let previous = slot.swap(now_micros, Ordering::AcqRel);
        if previous == 0 {
            return ArrivalVerdict::Ok;
        }

        let gap_us = now_micros - previous;
        if gap_us < self.stall_threshold_us {
            self.signal_lost.store(false, Ordering::Release);
            return ArrivalVerdict::Ok;
        }

        let gap = Duration::from_micros(gap_us.max(0) as u64);
        warn!(
            "{:?} ingress: no frame received for {} ms",
            domain,
            gap_us / 1000
        );

        self.signal_lost.store(true, Ordering::Release);
        {
            let mut flags = self.flags.lock().unwrap();
            flags.video = true;
            flags.audio = true;
            flags.mux = true;
        }

        if self.hard_loss_limit_us > 0 && gap_us >= self.hard_loss_limit_us {
            return ArrivalVerdict::FatalLoss { gap };
        }
        ArrivalVerdict::Stalled { gap }
    }

    /// Atomically read and clear one domain's drop flag. Returns true
    /// exactly once per stall episode per domain.
    pub fn take_and_clear(&self, domain: DropDomain) -> bool {
        let mut flags = self.flags.lock().unwrap();
        let slot = match domain {
            DropDomain::VideoEncoder => &mut flags.video,
            DropDomain::AudioEncoder => &mut flags.audio,
            DropDomain::Mux => &mut flags.mux,
        };
        std::mem::take(slot)
    }

    pub fn signal_lost(&self) -> bool {
        self.signal_lost.load(Ordering::Acquire)
    }

    /// Probe used by the periodic monitor: true when neither ingress domain
    /// has reported within `threshold`.
    pub fn is_stalled(&self, threshold: Duration, now_micros: i64) -> bool {
        let last = self
            .last_video_arrival
            .load(Ordering::Acquire)
            .max(self.last_audio_arrival.load(Ordering::Acquire));
        last > 0 && now_micros - last > threshold.as_micros() as i64
    }
}

/// Re-submits a cached copy of the last good video frame while the capture
/// hardware reports no input, so downstream consumers see a continuous (if
/// frozen) signal instead of a gap.
pub struct FrameInjector {
    cached: Mutex<Option<Frame>>,
    injected: AtomicU32,
    max_injected: u32,
}

impl FrameInjector {
    pub fn new(max_injected: u32) -> Self {
        Self {
            cached: Mutex::new(None),
            injected: AtomicU32::new(0),
            max_injected,
        }
    }

    /// Cache a copy of a known-good raw video frame, replacing any previous
    /// cache.
    pub fn cache(&self, frame: &Frame) {
        *self.cached.lock().unwrap() = Some(frame.clone());
    }

    pub fn has_cache(&self) -> bool {
        self.cached.lock().unwrap().is_some()
    }

    /// Produce an injected copy of the cached frame stamped at
    /// `stream_time`. During signal loss only the video clock keeps
    /// reporting sane intervals, so the injected record uses the video
    /// stream time for both clocks; everything downstream slaves to
    /// `audio_pts` and must keep advancing.
    ///
    /// Errors once more than the configured maximum has been injected;
    /// continued loss is then fatal to the pipeline.
    pub fn inject(&self, stream_time: i64) -> Result<Option<Frame>> {
        let cached = self.cached.lock().unwrap();
        let Some(frame) = cached.as_ref() else {
            return Ok(None);
        };

        let count = self.injected.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.max_injected {
            bail!(
                "more than {} frames injected during signal loss, aborting",
                self.max_injected
            );
        }

        let mut copy = frame.clone();
        copy.clock.video_pts = stream_time;
        copy.clock.audio_pts = stream_time;
        copy.clock.hw_received = super::clock::wall_clock_micros();
        Ok(Some(copy))
    }

    /// Called when a real frame arrives after a loss episode; logs and
    /// resets the injection counter.
    pub fn on_signal_restored(&self) {
        let injected = self.injected.swap(0, Ordering::AcqRel);
        if injected > 0 {
            info!("injected {} cached video frame(s) during signal loss", injected);
        }
    }

    pub fn injected_count(&self) -> u32 {
        self.injected.load(Ordering::Acquire)
    }
}

/// Pipeline throughput counters.
///
/// All fields use atomic operations for thread-safe access.
pub struct PipelineMetrics {
    pub frames_processed: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_injected: AtomicU64,
    pub bytes_coded: AtomicU64,
    pub keyframes: AtomicU64,
    /// Unix microseconds of the last successfully processed frame
    pub last_frame_time: AtomicI64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_injected: AtomicU64::new(0),
            bytes_coded: AtomicU64::new(0),
            keyframes: AtomicU64::new(0),
            last_frame_time: AtomicI64::new(0),
        }
    }

    pub fn record_frame(&self, coded_size: usize, is_keyframe: bool) {
        self.last_frame_time
            .store(super::clock::wall_clock_micros(), Ordering::Relaxed);
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_coded.fetch_add(coded_size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_injected(&self) {
        self.frames_injected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_injected: self.frames_injected.load(Ordering::Relaxed),
            bytes_coded: self.bytes_coded.load(Ordering::Relaxed),
            keyframes: self.keyframes.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of pipeline metrics.
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub frames_injected: u64,
    pub bytes_coded: u64,
    pub keyframes: u64,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} frames ({} dropped, {} injected), {} bytes coded, {} keyframes",
            self.frames_processed,
            self.frames_dropped,
            self.frames_injected,
            self.bytes_coded,
            self.keyframes
        )
    }
}
