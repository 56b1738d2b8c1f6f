//! Video encoder stage
//!
//! Drains one stream's frame queue, drives exactly one compressor instance,
//! and produces correctly-timestamped coded frames. The compressor itself
//! is a black box behind the [`Compressor`] trait; everything
//! codec-specific stays on the other side of it.

use anyhow::{Context, Result};
use bytes::Bytes;
use log::{info, warn};
use std::sync::Arc;

use crate::config::{DiagnosticsConfig, LatencyMode, VideoStreamConfig};
use crate::pipeline::clock::{ClockRecord, frame_duration_ticks, wall_clock_micros};
use crate::pipeline::health::{DropDomain, SignalHealthController};
use crate::pipeline::queue::FrameQueue;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::state::StageState;
use crate::pipeline::types::{
    AncillaryData, CodedPayload, Frame, FramePayload, Plane, StreamId,
};

use super::smoothing::SmoothingBuffer;

/// Constant delay folded into every reconciled DTS in the generic latency
/// profile (~900 ms at 27 MHz), covering the smoothing window. Low-latency
/// profiles run with no added delay.
pub const GENERIC_LATENCY_OFFSET: i64 = 24_299_700;

/// Codec parameters handed to the compressor at open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParams {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub threads: u32,
    pub keyint_max: u32,
    pub lookahead: u32,
    pub bitrate_kbps: u32,
    pub vbv_max_bitrate_kbps: u32,
    pub buffer_frames: u32,
    pub sar: (u32, u32),
}

impl CodecParams {
    pub fn from_config(config: &VideoStreamConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            fps_num: config.fps_num,
            fps_den: config.fps_den,
            threads: config.threads,
            keyint_max: config.keyint_max,
            lookahead: config.lookahead,
            bitrate_kbps: config.bitrate_kbps,
            vbv_max_bitrate_kbps: config.vbv_max_bitrate_kbps,
            buffer_frames: config.buffer_frames,
            sar: (1, 1),
        }
    }

    pub fn frame_duration(&self) -> i64 {
        frame_duration_ticks(self.fps_num, self.fps_den)
    }

    fn above_p30(&self) -> bool {
        // Handles both rational rates (30000/1001) and plain integers
        self.fps_num > 30_000 || (self.fps_num < 1000 && self.fps_num > 30)
    }

    /// Validate against system-level real-time constraints, raising
    /// parameters to safe minimums instead of failing. For 1080p above 30
    /// fps the encode cannot sustain real time without enough worker
    /// threads; the generic profile additionally bounds the keyframe
    /// interval and lookahead.
    pub fn apply_realtime_constraints(&mut self, mode: LatencyMode) {
        if self.width != 1920 || self.height != 1080 || !self.above_p30() {
            return;
        }

        if self.threads < 8 {
            info!(
                "configuration threads defined as {}, need a minimum of 8. Adjusting to 8",
                self.threads
            );
            self.threads = 8;
        }

        if mode == LatencyMode::Generic {
            if self.keyint_max > 4 {
                info!(
                    "configuration keyint defined as {}, need a maximum of 4. Adjusting to 4",
                    self.keyint_max
                );
                self.keyint_max = 4;
            }
            if self.lookahead != self.keyint_max {
                info!(
                    "configuration lookahead defined as {}, need a maximum of {}. Adjusting to {}",
                    self.lookahead, self.keyint_max, self.keyint_max
                );
                self.lookahead = self.keyint_max;
            }
        }
    }
}

/// One picture in the compressor's native input form.
pub struct Picture {
    pub width: u32,
    pub height: u32,
    pub sar: (u32, u32),
    pub planes: Vec<Plane>,
    /// Sequence number within this stream
    pub sequence: i64,
    /// Clock record of the source frame; travels with the picture through
    /// the compressor's reorder buffer and comes back on its coded units
    pub clock: ClockRecord,
    /// Ancillary payloads accepted for in-band carriage
    pub side_data: Vec<AncillaryData>,
}

/// One compressed access unit with compressor-native timing fields. The
/// dts/pts/arrival values here live in the compressor's own clock domain
/// and are reconciled by the encoder stage before anything downstream sees
/// them.
pub struct CodedUnit {
    pub data: Bytes,
    pub keyframe: bool,
    pub priority: bool,
    pub dts: i64,
    pub pts: i64,
    pub initial_arrival: i64,
    pub final_arrival: i64,
    pub clock: ClockRecord,
}

/// Black-box compressor driven by an [`EncoderStage`].
pub trait Compressor: Send {
    /// Open with validated parameters. May further adjust them. A failure
    /// here is fatal to the owning stage.
    fn open(&mut self, params: &mut CodecParams) -> Result<()>;

    /// Submit one picture; returns zero or more coded units (the
    /// compressor may buffer).
    fn encode(&mut self, picture: Picture) -> Result<Vec<CodedUnit>>;

    /// Flush buffered output at end of stream.
    fn flush(&mut self) -> Result<Vec<CodedUnit>>;

    /// Adaptive rate/latency feedback from the smoothing buffer; fill is
    /// the fraction of the nominal buffer window currently covered.
    fn pace(&mut self, _buffer_fill: f32) {}

    /// Reset internal pacing/rate-control state after an upstream drop.
    fn reset_pacing(&mut self) {}

    fn close(&mut self) {}
}

/// Per-stream DTS drift accumulator.
///
/// Successive reconciled DTS values should advance by exactly one frame
/// duration; the running discrepancy is folded into the buffer-model
/// arrival times so pacing metadata stays self-consistent even though the
/// raw compressor clock and the audio clock drift independently. Owned by
/// the stage, so concurrent streams never share an accumulator.
#[derive(Debug, Default)]
struct DtsDriftTracker {
    last_dts: i64,
    accum: i64,
}

impl DtsDriftTracker {
    /// Reconcile one unit's timing into the audio clock domain, updating
    /// the drift accumulator. Returns the rewritten
    /// (dts, pts, initial_arrival, final_arrival).
    fn reconcile(
        &mut self,
        unit: &CodedUnit,
        offset: i64,
        frame_duration: i64,
    ) -> (i64, i64, i64, i64) {
        // The audio and video hardware clocks jump with different intervals
        // when the cable is disconnected; the audio clock is the one that
        // stays sane, so all timing slaves to it.
        let new_dts =
            unit.clock.audio_pts + offset - (unit.dts - unit.pts).abs() + 2 * frame_duration;

        // How much this temporal frame varies from its decode time
        let pts_diff = unit.dts - unit.pts;
        let new_pts = new_dts - pts_diff;

        if self.last_dts > 0 {
            self.accum += new_dts - self.last_dts - frame_duration;
        }
        self.last_dts = new_dts;

        let transfer = (unit.final_arrival - unit.initial_arrival).abs();
        let initial_arrival = unit.initial_arrival + self.accum;
        let final_arrival = initial_arrival + transfer;

        (new_dts, new_pts, initial_arrival, final_arrival)
    }
}

/// Warns when the coded output of one wall-clock second exceeds the
/// configured VBV maximum.
struct BitrateMonitor {
    vbv_max_bps: u64,
    current_second: i64,
    bits: u64,
}

impl BitrateMonitor {
    fn new(vbv_max_kbps: u32) -> Self {
        Self {
            vbv_max_bps: vbv_max_kbps as u64 * 1000,
            current_second: 0,
            bits: 0,
        }
    }

    fn record(&mut self, bytes: usize) {
        let second = wall_clock_micros() / 1_000_000;
        if second != self.current_second {
            if self.current_second != 0 && self.vbv_max_bps > 0 && self.bits > self.vbv_max_bps {
                warn!(
                    "codec output {} bps exceeds vbv max bitrate {}",
                    self.bits, self.vbv_max_bps
                );
            }
            self.current_second = second;
            self.bits = 0;
        }
        self.bits += bytes as u64 * 8;
    }
}

/// One encoder stage instance per output stream.
pub struct EncoderStage {
    stream_id: StreamId,
    params: CodecParams,
    mode: LatencyMode,
    input: Arc<FrameQueue>,
    smoothing: Option<Arc<SmoothingBuffer>>,
    mux_queue: Arc<FrameQueue>,
    health: Arc<SignalHealthController>,
    compressor: Box<dyn Compressor>,
    diagnostics: DiagnosticsConfig,
    state: StageState,
    drift: DtsDriftTracker,
    bitrate: BitrateMonitor,
    sequence: i64,
}

impl EncoderStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &VideoStreamConfig,
        mode: LatencyMode,
        input: Arc<FrameQueue>,
        smoothing: Option<Arc<SmoothingBuffer>>,
        mux_queue: Arc<FrameQueue>,
        health: Arc<SignalHealthController>,
        compressor: Box<dyn Compressor>,
        diagnostics: DiagnosticsConfig,
    ) -> Self {
        let params = CodecParams::from_config(config);
        let bitrate = BitrateMonitor::new(params.vbv_max_bitrate_kbps);
        Self {
            stream_id: config.stream_id,
            params,
            mode,
            input,
            smoothing,
            mux_queue,
            health,
            compressor,
            diagnostics,
            state: StageState::Starting,
            drift: DtsDriftTracker::default(),
            bitrate,
            sequence: 0,
        }
    }

    fn transition(&mut self, target: StageState) {
        debug_assert!(self.state.can_transition_to(target));
        self.state = target;
    }

    fn dts_offset(&self) -> i64 {
        match self.mode {
            LatencyMode::Generic => GENERIC_LATENCY_OFFSET,
            LatencyMode::LowLatency | LatencyMode::LowestLatency => 0,
        }
    }

    /// Convert a raw frame into the compressor's picture form, consuming
    /// it. Side data the compressor cannot carry is discarded with a
    /// warning; a SAR change updates the codec params for the next
    /// keyframe.
    fn build_picture(&mut self, frame: Frame) -> Option<Picture> {
        let FramePayload::Raw(raw) = frame.payload else {
            warn!("encoder {}: coded frame on raw input queue", self.stream_id);
            return None;
        };
        let Some(video) = raw.video else {
            warn!("encoder {}: frame without video planes", self.stream_id);
            return None;
        };

        if video.sar != self.params.sar {
            info!(
                "encoder {}: sample aspect ratio changed to {}:{}",
                self.stream_id, video.sar.0, video.sar.1
            );
            self.params.sar = video.sar;
        }

        let mut side_data = Vec::with_capacity(raw.ancillary.len());
        for item in raw.ancillary {
            if item.kind.encoder_accepted() {
                side_data.push(item);
            } else {
                warn!(
                    "encoder {}: invalid user data presented to encoder - type {:?}",
                    self.stream_id, item.kind
                );
            }
        }

        let sequence = self.sequence;
        self.sequence += 1;

        Some(Picture {
            width: video.width,
            height: video.height,
            sar: self.params.sar,
            planes: video.planes,
            sequence,
            clock: frame.clock,
            side_data,
        })
    }

    /// Reconcile and forward one coded unit.
    fn emit(&mut self, unit: CodedUnit) {
        let frame_duration = self.params.frame_duration();
        let (dts, pts, initial_arrival, final_arrival) =
            self.drift.reconcile(&unit, self.dts_offset(), frame_duration);

        self.bitrate.record(unit.data.len());
        self.health.metrics.record_frame(unit.data.len(), unit.keyframe);

        let mut payload = CodedPayload::new(unit.data);
        payload.random_access = unit.keyframe;
        payload.priority = unit.priority;
        payload.pts = pts;
        payload.dts = dts;
        payload.initial_arrival = initial_arrival;
        payload.final_arrival = final_arrival;

        let mut frame = Frame::coded(self.stream_id, unit.clock, payload);
        if let Some(ledger) = &self.diagnostics.frame_ledger {
            frame = frame.track(ledger);
        }

        match &self.smoothing {
            Some(buffer) => buffer.push(frame),
            None => self.mux_queue.enqueue(frame),
        }
    }

    fn run_loop(&mut self) -> Result<()> {
        while let Some(frame) = self.input.dequeue_blocking() {
            // A source drop leaves the rate control locked to an underflow
            // state unless it is told to resynchronize.
            if self.health.take_and_clear(DropDomain::VideoEncoder) {
                if let Some(buffer) = &self.smoothing {
                    buffer.mark_incomplete();
                }
                info!("encoder {}: rate control reset", self.stream_id);
                self.compressor.reset_pacing();
            }

            let Some(picture) = self.build_picture(frame) else {
                self.health.metrics.record_drop();
                continue;
            };

            if let Some(buffer) = &self.smoothing {
                if let Some(fill) = buffer.pacing_feedback() {
                    self.compressor.pace(fill);
                }
            }

            let units = self
                .compressor
                .encode(picture)
                .context("compressor encode failed")?;
            for unit in units {
                self.emit(unit);
            }
        }
        Ok(())
    }
}

impl PipelineStage for EncoderStage {
    fn run(&mut self) -> Result<()> {
        self.params.apply_realtime_constraints(self.mode);
        if let Err(e) = self.compressor.open(&mut self.params) {
            self.transition(StageState::Stopped);
            return Err(e.context("encoder configuration failed"));
        }
        info!(
            "encoder {}: {}x{} @ {}/{} ready",
            self.stream_id,
            self.params.width,
            self.params.height,
            self.params.fps_num,
            self.params.fps_den
        );
        self.transition(StageState::Running);

        let result = self.run_loop();

        self.transition(StageState::Draining);
        match self.compressor.flush() {
            Ok(units) => {
                for unit in units {
                    self.emit(unit);
                }
            }
            Err(e) => warn!("encoder {}: flush failed: {:#}", self.stream_id, e),
        }
        self.compressor.close();
        self.transition(StageState::Stopped);

        result
    }

    fn name(&self) -> &'static str {
        "video-encoder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::ClockRecord;
    use crate::pipeline::types::{AncillaryKind, RawPayload, VideoPlanes};
    use std::sync::Mutex;
    use std::time::Duration;

    const FRAME_DURATION: i64 = 1_080_000; // 25 fps

    fn video_config() -> VideoStreamConfig {
        VideoStreamConfig {
            stream_id: 0,
            width: 1280,
            height: 720,
            fps_num: 25,
            fps_den: 1,
            threads: 4,
            keyint_max: 50,
            lookahead: 50,
            bitrate_kbps: 8000,
            vbv_max_bitrate_kbps: 9000,
            buffer_frames: 25,
        }
    }

    fn raw_video_frame(audio_pts: i64) -> Frame {
        let clock = ClockRecord {
            video_pts: audio_pts,
            audio_pts,
            video_interval: FRAME_DURATION,
            ..Default::default()
        };
        Frame::raw(
            0,
            clock,
            RawPayload::video(VideoPlanes {
                width: 1280,
                height: 720,
                sar: (1, 1),
                planes: vec![Plane { stride: 1280, data: vec![0; 1280] }],
            }),
        )
    }

    /// Compressor double: one unit per picture, compressor-native timing
    /// derived from the sequence number, instrumented for assertions.
    #[derive(Default)]
    struct MockState {
        opened: bool,
        resets: usize,
        paced: Vec<f32>,
        side_data_counts: Vec<usize>,
    }

    struct MockCompressor {
        state: Arc<Mutex<MockState>>,
        /// Compressor-native dts lags pts by this many ticks (B-frame delay)
        reorder_lag: i64,
        fail_open: bool,
        buffered: usize,
    }

    impl MockCompressor {
        fn new(state: Arc<Mutex<MockState>>) -> Self {
            Self {
                state,
                reorder_lag: 0,
                fail_open: false,
                buffered: 0,
            }
        }
    }

    impl Compressor for MockCompressor {
        fn open(&mut self, _params: &mut CodecParams) -> Result<()> {
            if self.fail_open {
                anyhow::bail!("no such encoder");
            }
            self.state.lock().unwrap().opened = true;
            Ok(())
        }

        fn encode(&mut self, picture: Picture) -> Result<Vec<CodedUnit>> {
            let mut state = self.state.lock().unwrap();
            state.side_data_counts.push(picture.side_data.len());

            let native_pts = picture.sequence * FRAME_DURATION;
            Ok(vec![CodedUnit {
                data: Bytes::from(vec![0u8; 100]),
                keyframe: picture.sequence % 4 == 0,
                priority: picture.sequence % 4 == 0,
                dts: native_pts - self.reorder_lag,
                pts: native_pts,
                initial_arrival: native_pts,
                final_arrival: native_pts + FRAME_DURATION / 2,
                clock: picture.clock,
            }])
        }

        fn flush(&mut self) -> Result<Vec<CodedUnit>> {
            let mut units = Vec::new();
            for i in 0..self.buffered {
                units.push(CodedUnit {
                    data: Bytes::from(vec![0u8; 10]),
                    keyframe: false,
                    priority: false,
                    dts: i as i64,
                    pts: i as i64,
                    initial_arrival: 0,
                    final_arrival: 0,
                    clock: ClockRecord::default(),
                });
            }
            self.buffered = 0;
            Ok(units)
        }

        fn pace(&mut self, buffer_fill: f32) {
            self.state.lock().unwrap().paced.push(buffer_fill);
        }

        fn reset_pacing(&mut self) {
            self.state.lock().unwrap().resets += 1;
        }
    }

    fn stage_with(
        compressor: MockCompressor,
        mode: LatencyMode,
        smoothing: Option<Arc<SmoothingBuffer>>,
    ) -> (EncoderStage, Arc<FrameQueue>, Arc<FrameQueue>) {
        let input = Arc::new(FrameQueue::new("encode-in", 64));
        let mux = Arc::new(FrameQueue::new("mux", 64));
        let health = Arc::new(SignalHealthController::new(
            Duration::from_millis(100),
            None,
        ));
        let stage = EncoderStage::new(
            &video_config(),
            mode,
            Arc::clone(&input),
            smoothing,
            Arc::clone(&mux),
            health,
            Box::new(compressor),
            DiagnosticsConfig::default(),
        );
        (stage, input, mux)
    }

    #[test]
    fn test_realtime_constraints_raise_1080p60_params() {
        let mut params = CodecParams::from_config(&VideoStreamConfig {
            width: 1920,
            height: 1080,
            fps_num: 60000,
            fps_den: 1001,
            threads: 4,
            keyint_max: 50,
            lookahead: 40,
            ..video_config()
        });
        params.apply_realtime_constraints(LatencyMode::Generic);
        assert_eq!(params.threads, 8);
        assert_eq!(params.keyint_max, 4);
        assert_eq!(params.lookahead, 4);
    }

    #[test]
    fn test_realtime_constraints_low_latency_only_raises_threads() {
        let mut params = CodecParams::from_config(&VideoStreamConfig {
            width: 1920,
            height: 1080,
            fps_num: 60,
            fps_den: 1,
            threads: 2,
            keyint_max: 50,
            lookahead: 40,
            ..video_config()
        });
        params.apply_realtime_constraints(LatencyMode::LowestLatency);
        assert_eq!(params.threads, 8);
        assert_eq!(params.keyint_max, 50);
        assert_eq!(params.lookahead, 40);
    }

    #[test]
    fn test_realtime_constraints_leave_sustainable_rates_alone() {
        let mut params = CodecParams::from_config(&VideoStreamConfig {
            width: 1920,
            height: 1080,
            fps_num: 25,
            fps_den: 1,
            threads: 4,
            ..video_config()
        });
        params.apply_realtime_constraints(LatencyMode::Generic);
        assert_eq!(params.threads, 4);
    }

    #[test]
    fn test_reconciled_timestamps_monotonic() {
        // Clean synthetic feed: audio clock advancing one frame per frame
        let mut drift = DtsDriftTracker::default();
        let mut last_dts = None;
        let mut last_pts = None;

        for n in 0..50i64 {
            let clock = ClockRecord {
                audio_pts: 1_000_000 + n * FRAME_DURATION,
                ..Default::default()
            };
            let unit = CodedUnit {
                data: Bytes::new(),
                keyframe: n == 0,
                priority: n == 0,
                dts: n * FRAME_DURATION,
                pts: n * FRAME_DURATION,
                initial_arrival: n * FRAME_DURATION,
                final_arrival: n * FRAME_DURATION + 1000,
                clock,
            };
            let (dts, pts, _, _) = drift.reconcile(&unit, GENERIC_LATENCY_OFFSET, FRAME_DURATION);

            if let (Some(ld), Some(lp)) = (last_dts, last_pts) {
                assert_eq!(dts - ld, FRAME_DURATION);
                assert_eq!(pts - lp, FRAME_DURATION);
            }
            assert!(pts >= dts);
            last_dts = Some(dts);
            last_pts = Some(pts);
        }
    }

    #[test]
    fn test_reconcile_derives_pts_from_reorder_offset() {
        let mut drift = DtsDriftTracker::default();
        let clock = ClockRecord { audio_pts: 5_000_000, ..Default::default() };
        // Compressor reports dts two frames behind pts (B-frame reorder)
        let unit = CodedUnit {
            data: Bytes::new(),
            keyframe: true,
            priority: true,
            dts: 0,
            pts: 2 * FRAME_DURATION,
            initial_arrival: 0,
            final_arrival: 500,
            clock,
        };
        let (dts, pts, _, _) = drift.reconcile(&unit, 0, FRAME_DURATION);

        let expected_dts = 5_000_000 - 2 * FRAME_DURATION + 2 * FRAME_DURATION;
        assert_eq!(dts, expected_dts);
        // pts - dts preserves the compressor's reorder distance
        assert_eq!(pts - dts, 2 * FRAME_DURATION);
    }

    #[test]
    fn test_drift_accumulator_folds_into_arrival_times() {
        let mut drift = DtsDriftTracker::default();

        let unit_at = |audio_pts: i64, native: i64| CodedUnit {
            data: Bytes::new(),
            keyframe: false,
            priority: false,
            dts: native,
            pts: native,
            initial_arrival: native,
            final_arrival: native + 1000,
            clock: ClockRecord { audio_pts, ..Default::default() },
        };

        let (_, _, ia0, fa0) = drift.reconcile(&unit_at(1_000_000, 0), 0, FRAME_DURATION);
        assert_eq!(ia0, 0);
        assert_eq!(fa0, 1000);

        // Second frame arrives half a frame late on the audio clock
        let late = FRAME_DURATION + FRAME_DURATION / 2;
        let (_, _, ia1, fa1) =
            drift.reconcile(&unit_at(1_000_000 + late, FRAME_DURATION), 0, FRAME_DURATION);
        // The half-frame discrepancy folds into the arrival time
        assert_eq!(ia1, FRAME_DURATION + FRAME_DURATION / 2);
        assert_eq!(fa1 - ia1, 1000);
    }

    #[test]
    fn test_stage_forwards_to_mux_in_low_latency() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let (mut stage, input, mux) = stage_with(
            MockCompressor::new(Arc::clone(&state)),
            LatencyMode::LowestLatency,
            None,
        );

        for n in 0..4i64 {
            input.enqueue(raw_video_frame(1_000_000 + n * FRAME_DURATION));
        }
        cancel_after_drain(&input, &mux, 4);

        stage.run().unwrap();
        assert!(state.lock().unwrap().opened);
        assert_eq!(mux.len(), 4);

        // Reconciled DTS advances one frame duration per frame
        let mut last = None;
        while let Some(frame) = mux.try_dequeue() {
            let dts = frame.coded_payload().unwrap().dts;
            if let Some(prev) = last {
                assert_eq!(dts - prev, FRAME_DURATION);
            }
            last = Some(dts);
        }
    }

    #[test]
    fn test_stage_fails_fatal_on_open_error() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let mut compressor = MockCompressor::new(state);
        compressor.fail_open = true;
        let (mut stage, _input, _mux) = stage_with(compressor, LatencyMode::LowestLatency, None);

        assert!(stage.run().is_err());
        assert_eq!(stage.state, StageState::Stopped);
    }

    #[test]
    fn test_drop_flag_resets_pacing_once() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let (mut stage, input, mux) = stage_with(
            MockCompressor::new(Arc::clone(&state)),
            LatencyMode::LowestLatency,
            None,
        );

        // Simulate a stall episode: raise the flags directly
        stage
            .health
            .report_frame_arrival(crate::pipeline::health::ArrivalDomain::Video, 1_000_000);
        stage
            .health
            .report_frame_arrival(crate::pipeline::health::ArrivalDomain::Video, 2_000_000);

        for n in 0..3i64 {
            input.enqueue(raw_video_frame(1_000_000 + n * FRAME_DURATION));
        }
        cancel_after_drain(&input, &mux, 3);

        stage.run().unwrap();
        // One stall episode, exactly one reset despite three frames
        assert_eq!(state.lock().unwrap().resets, 1);
    }

    #[test]
    fn test_ancillary_filtering() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let (mut stage, input, mux) = stage_with(
            MockCompressor::new(Arc::clone(&state)),
            LatencyMode::LowestLatency,
            None,
        );

        let mut frame = raw_video_frame(1_000_000);
        if let FramePayload::Raw(raw) = &mut frame.payload {
            raw.ancillary = vec![
                AncillaryData {
                    kind: AncillaryKind::ItuT35Registered,
                    data: Bytes::from_static(b"cc"),
                },
                AncillaryData {
                    kind: AncillaryKind::Other(42),
                    data: Bytes::from_static(b"junk"),
                },
                AncillaryData {
                    kind: AncillaryKind::ItuT35Unregistered,
                    data: Bytes::from_static(b"ts"),
                },
            ];
        }
        input.enqueue(frame);
        cancel_after_drain(&input, &mux, 1);

        stage.run().unwrap();
        // Two of three items survived the acceptance filter
        assert_eq!(state.lock().unwrap().side_data_counts, vec![2]);
    }

    #[test]
    fn test_flush_forwards_buffered_units() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let mut compressor = MockCompressor::new(state);
        compressor.buffered = 3;
        let (mut stage, input, mux) = stage_with(compressor, LatencyMode::LowestLatency, None);

        input.cancel();
        stage.run().unwrap();

        // Nothing encoded, but the drain flushed three buffered units
        assert_eq!(mux.len(), 3);
        assert_eq!(stage.state, StageState::Stopped);
    }

    #[test]
    fn test_generic_mode_paces_through_smoothing() {
        use crate::encoders::smoothing::SmoothingStage;
        use crate::pipeline::clock::InputClock;
        use crate::pipeline::types::FrameLedger;

        let state = Arc::new(Mutex::new(MockState::default()));
        // Anchor the input clock far enough ahead that every frame is
        // already due for release.
        let clock = InputClock::new();
        clock.tick(1_000_000 + 20 * FRAME_DURATION);

        let buffer = Arc::new(SmoothingBuffer::new(
            FRAME_DURATION,
            2,
            GENERIC_LATENCY_OFFSET,
            clock,
        ));
        let input = Arc::new(FrameQueue::new("encode-in", 64));
        let mux = Arc::new(FrameQueue::new("mux", 64));
        let health = Arc::new(SignalHealthController::new(
            Duration::from_millis(100),
            None,
        ));
        let ledger = Arc::new(FrameLedger::default());
        let diagnostics = DiagnosticsConfig {
            frame_ledger: Some(Arc::clone(&ledger)),
            ..Default::default()
        };

        let mut encoder = EncoderStage::new(
            &video_config(),
            LatencyMode::Generic,
            Arc::clone(&input),
            Some(Arc::clone(&buffer)),
            Arc::clone(&mux),
            health,
            Box::new(MockCompressor::new(Arc::clone(&state))),
            diagnostics,
        );
        let mut smoother = SmoothingStage::new(Arc::clone(&buffer), Arc::clone(&mux));

        let encoder_thread = std::thread::spawn(move || encoder.run());
        let smoother_thread = std::thread::spawn(move || smoother.run());

        for n in 0..6i64 {
            input.enqueue(raw_video_frame(1_000_000 + n * FRAME_DURATION).track(&ledger));
        }

        // Every coded frame must come out the mux end, in DTS order.
        let mut last = -1i64;
        let mut seen = 0;
        while seen < 6 {
            if let Some(frame) = mux.try_dequeue() {
                let dts = frame.coded_payload().unwrap().dts;
                assert!(dts > last);
                last = dts;
                seen += 1;
            } else {
                std::thread::yield_now();
            }
        }

        input.cancel();
        buffer.queue().cancel();
        encoder_thread.join().unwrap().unwrap();
        smoother_thread.join().unwrap().unwrap();

        // The pacing feedback loop ran once the buffer primed
        assert!(!state.lock().unwrap().paced.is_empty());
        // Every envelope and payload created was released exactly once
        assert!(ledger.balanced());
    }

    /// Cancel the input queue once the expected number of coded frames
    /// reached the mux, from a watcher thread.
    fn cancel_after_drain(input: &Arc<FrameQueue>, mux: &Arc<FrameQueue>, expected: usize) {
        let input = Arc::clone(input);
        let mux = Arc::clone(mux);
        std::thread::spawn(move || {
            while mux.len() < expected {
                std::thread::yield_now();
            }
            input.cancel();
        });
    }
}
