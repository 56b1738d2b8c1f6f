//! Dual-clock timing metadata and the shared input clock

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Ticks per second of the pipeline reference clock (MPEG 27 MHz).
pub const TICKS_PER_SECOND: i64 = 27_000_000;

/// Ticks per millisecond of the reference clock.
pub const TICKS_PER_MS: i64 = TICKS_PER_SECOND / 1000;

/// Convert a frame rate to the nominal duration of one frame in ticks.
pub fn frame_duration_ticks(fps_num: u32, fps_den: u32) -> i64 {
    TICKS_PER_SECOND * fps_den as i64 / fps_num as i64
}

/// Current wall clock as unix microseconds.
pub fn wall_clock_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Capture-health flag: card is running full-duplex.
pub const HW_STATUS_FULL_DUPLEX: u8 = 1 << 0;
/// Capture-health flag: source is degraded (format mismatch, partial lock).
pub const HW_STATUS_DEGRADED: u8 = 1 << 1;

/// Per-frame dual-clock timing metadata.
///
/// Stamped at ingress and consulted by every downstream stage. The video and
/// audio clocks are sampled independently from the capture hardware: during
/// signal loss the video clock keeps reporting proper intervals while the
/// audio clock runs wild (and vice versa on some firmware), so both are
/// carried and downstream timing slaves to `audio_pts` (see the encoder
/// stage for the reconciliation).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockRecord {
    /// Video clock sample, 27 MHz ticks
    pub video_pts: i64,
    /// Audio clock sample, 27 MHz ticks. The authoritative pipeline clock.
    pub audio_pts: i64,
    /// Wall-clock arrival at the capture callback, unix microseconds
    pub hw_received: i64,
    /// Nominal duration of one video frame, 27 MHz ticks
    pub video_interval: i64,
    /// Capture-health bit flags (`HW_STATUS_*`)
    pub health_mask: u8,
}

impl ClockRecord {
    /// Stamp a record at ingress with both hardware clock samples.
    pub fn at_ingress(video_pts: i64, audio_pts: i64, video_interval: i64) -> Self {
        Self {
            video_pts,
            audio_pts,
            hw_received: wall_clock_micros(),
            video_interval,
            health_mask: 0,
        }
    }

    pub fn with_health(mut self, mask: u8) -> Self {
        self.health_mask = mask;
        self
    }
}

/// Process-wide 27 MHz clock slaved to the capture hardware.
///
/// The ingress thread calls [`InputClock::tick`] with each hardware stream
/// time; [`InputClock::now_ticks`] extrapolates between ticks from a
/// monotonic base so pacing code can ask "what time is it in tick units"
/// without waiting for the next capture callback.
#[derive(Clone)]
pub struct InputClock {
    inner: Arc<Mutex<ClockAnchor>>,
}

struct ClockAnchor {
    ticks: i64,
    at: Instant,
}

impl InputClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockAnchor {
                ticks: 0,
                at: Instant::now(),
            })),
        }
    }

    /// Re-anchor the clock to a hardware stream time. Called once per
    /// captured frame by the ingress thread.
    pub fn tick(&self, stream_time_ticks: i64) {
        let mut anchor = self.inner.lock().unwrap();
        anchor.ticks = stream_time_ticks;
        anchor.at = Instant::now();
    }

    /// Current pipeline time in ticks, extrapolated from the last anchor.
    pub fn now_ticks(&self) -> i64 {
        let anchor = self.inner.lock().unwrap();
        anchor.ticks + (anchor.at.elapsed().as_micros() as i64 * TICKS_PER_SECOND / 1_000_000)
    }
}

impl Default for InputClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_frame_duration() {
        // 25 fps -> 40ms -> 1_080_000 ticks
        assert_eq!(frame_duration_ticks(25, 1), 1_080_000);
        // 29.97 fps
        assert_eq!(frame_duration_ticks(30000, 1001), 900_900);
    }

    #[test]
    fn test_input_clock_advances() {
        let clock = InputClock::new();
        clock.tick(1_000_000);

        let t0 = clock.now_ticks();
        assert!(t0 >= 1_000_000);

        thread::sleep(Duration::from_millis(10));
        let t1 = clock.now_ticks();
        // At least ~10ms of ticks must have elapsed
        assert!(t1 - t0 >= 9 * TICKS_PER_MS, "advanced {} ticks", t1 - t0);
    }

    #[test]
    fn test_input_clock_reanchors() {
        let clock = InputClock::new();
        clock.tick(5_000_000);
        assert!(clock.now_ticks() >= 5_000_000);

        // Anchoring backwards is allowed; the source clock is authoritative
        clock.tick(2_000_000);
        let now = clock.now_ticks();
        assert!(now >= 2_000_000 && now < 5_000_000);
    }

    #[test]
    fn test_ingress_record_populated() {
        let rec = ClockRecord::at_ingress(90_000, 90_500, 1_080_000)
            .with_health(HW_STATUS_FULL_DUPLEX);
        assert_eq!(rec.video_pts, 90_000);
        assert_eq!(rec.audio_pts, 90_500);
        assert_eq!(rec.video_interval, 1_080_000);
        assert!(rec.hw_received > 0);
        assert_eq!(rec.health_mask & HW_STATUS_FULL_DUPLEX, HW_STATUS_FULL_DUPLEX);
    }
}
