//! Encoder-output smoothing buffer
//!
//! Converts the bursty, variable-latency output of an encoder stage into a
//! steady release cadence matching real time, so the muxer is never starved
//! nor flooded. Only used in the generic latency profile; the low-latency
//! profiles hand coded frames straight to the mux queue.

use anyhow::Result;
use log::debug;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::pipeline::clock::{InputClock, TICKS_PER_SECOND};
use crate::pipeline::queue::FrameQueue;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::types::Frame;

/// Granularity of the pacing sleep, so cancellation is never stalled behind
/// a long wait.
const PACING_SLICE: Duration = Duration::from_millis(50);

struct PacingState {
    /// Input-clock ticks when the last frame left the buffer
    last_exit_ticks: Option<i64>,
    /// True once the buffered span first reached the nominal duration
    complete: bool,
}

/// Pacing buffer between one encoder stage and the mux queue.
///
/// The encoder pushes coded frames as they fall out of the compressor; the
/// companion [`SmoothingStage`] releases them when their reconciled DTS
/// (minus the constant output delay) reaches the present on the input
/// clock. `buffer_fill` closes the loop: it is recomputed before every
/// encode and fed back into the compressor's adaptive rate control so the
/// compressor itself speeds up or slows down to avoid underflow/overflow.
pub struct SmoothingBuffer {
    queue: Arc<FrameQueue>,
    pacing: Mutex<PacingState>,
    out_cv: Condvar,
    /// Nominal buffered duration in ticks (the compressor's buffer window)
    nominal_ticks: i64,
    frame_duration: i64,
    output_delay: i64,
    clock: InputClock,
}

impl SmoothingBuffer {
    pub fn new(
        frame_duration: i64,
        buffer_frames: u32,
        output_delay: i64,
        clock: InputClock,
    ) -> Self {
        Self {
            queue: Arc::new(FrameQueue::new("smoothing", 256)),
            pacing: Mutex::new(PacingState {
                last_exit_ticks: None,
                complete: false,
            }),
            out_cv: Condvar::new(),
            // A zero-frame window would make every fill computation divide
            // by zero; one frame is the floor.
            nominal_ticks: (buffer_frames.max(1) as i64) * frame_duration,
            frame_duration,
            output_delay,
            clock,
        }
    }

    /// The inner queue, for shutdown registration with the coordinator.
    pub fn queue(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.queue)
    }

    /// Accept one coded frame from the encoder. Never blocks.
    pub fn push(&self, frame: Frame) {
        self.queue.enqueue(frame);

        if !self.is_complete() {
            let span = self.buffered_span();
            if span >= self.nominal_ticks {
                self.pacing.lock().unwrap().complete = true;
                debug!("smoothing buffer primed ({} ticks buffered)", span);
            }
        }
    }

    /// Duration covered by the buffered frames, in ticks.
    fn buffered_span(&self) -> i64 {
        self.queue
            .peek_span(|first, last| {
                let first_dts = first.coded_payload().map(|p| p.dts).unwrap_or(0);
                let last_dts = last.coded_payload().map(|p| p.dts).unwrap_or(0);
                last_dts - first_dts + self.frame_duration
            })
            .unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        self.pacing.lock().unwrap().complete
    }

    /// Reset pacing state after an upstream frame drop and release any
    /// thread waiting for an exit time, so the buffer never latches into an
    /// underflowed state.
    pub fn mark_incomplete(&self) {
        let mut pacing = self.pacing.lock().unwrap();
        pacing.complete = false;
        pacing.last_exit_ticks = None;
        drop(pacing);
        self.out_cv.notify_all();
    }

    /// Compute the compressor rate-control feedback value. Recomputed on
    /// every call, never cached: a fill above 1.0 means the buffer holds
    /// more than its nominal window, negative means it has run dry.
    ///
    /// Returns `None` until the buffer is primed, and blocks until at least
    /// one frame has been sent out (there is no meaningful fill before the
    /// release cadence exists). `None` is also returned on shutdown.
    pub fn pacing_feedback(&self) -> Option<f32> {
        let mut pacing = self.pacing.lock().unwrap();
        if !pacing.complete {
            return None;
        }
        // Wait until a frame is sent out.
        let last_exit = loop {
            if self.queue.is_cancelled() || !pacing.complete {
                return None;
            }
            if let Some(ticks) = pacing.last_exit_ticks {
                break ticks;
            }
            let (next, _timeout) = self
                .out_cv
                .wait_timeout(pacing, PACING_SLICE)
                .unwrap();
            pacing = next;
        };
        drop(pacing);

        // Time elapsed since the last frame was removed
        let last_frame_delta = self.clock.now_ticks() - last_exit;

        let fill = if self.queue.is_empty() {
            (-last_frame_delta) as f32 / self.nominal_ticks as f32
        } else {
            (self.buffered_span() - last_frame_delta) as f32 / self.nominal_ticks as f32
        };
        Some(fill)
    }

    fn dequeue_blocking(&self) -> Option<Frame> {
        self.queue.dequeue_blocking()
    }

    /// Sleep until `frame` is due on the input clock, in cancellation-aware
    /// slices.
    fn pace_release(&self, frame: &Frame) {
        let Some(coded) = frame.coded_payload() else {
            return;
        };
        let due = coded.dts - self.output_delay;
        loop {
            if self.queue.is_cancelled() {
                return;
            }
            let remaining = due - self.clock.now_ticks();
            if remaining <= 0 {
                return;
            }
            let remaining =
                Duration::from_micros((remaining * 1_000_000 / TICKS_PER_SECOND) as u64);
            std::thread::sleep(remaining.min(PACING_SLICE));
        }
    }

    fn record_exit(&self) {
        let mut pacing = self.pacing.lock().unwrap();
        pacing.last_exit_ticks = Some(self.clock.now_ticks());
        drop(pacing);
        self.out_cv.notify_all();
    }
}

/// Consumer thread of a [`SmoothingBuffer`]: releases coded frames to the
/// mux queue at real-time cadence.
pub struct SmoothingStage {
    buffer: Arc<SmoothingBuffer>,
    mux_queue: Arc<FrameQueue>,
}

impl SmoothingStage {
    pub fn new(buffer: Arc<SmoothingBuffer>, mux_queue: Arc<FrameQueue>) -> Self {
        Self { buffer, mux_queue }
    }
}

impl PipelineStage for SmoothingStage {
    fn run(&mut self) -> Result<()> {
        while let Some(frame) = self.buffer.dequeue_blocking() {
            self.buffer.pace_release(&frame);
            self.mux_queue.enqueue(frame);
            self.buffer.record_exit();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "smoothing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::ClockRecord;
    use crate::pipeline::types::CodedPayload;
    use bytes::Bytes;

    const FRAME_DURATION: i64 = 1_080_000; // 25 fps

    fn coded_frame(dts: i64) -> Frame {
        let mut payload = CodedPayload::new(Bytes::from_static(b"unit"));
        payload.dts = dts;
        payload.pts = dts;
        Frame::coded(0, ClockRecord::default(), payload)
    }

    fn buffer(frames: u32) -> SmoothingBuffer {
        let clock = InputClock::new();
        clock.tick(0);
        SmoothingBuffer::new(FRAME_DURATION, frames, 0, clock)
    }

    #[test]
    fn test_not_primed_until_nominal_span() {
        let buf = buffer(4);
        buf.push(coded_frame(0));
        buf.push(coded_frame(FRAME_DURATION));
        assert!(!buf.is_complete());
        assert!(buf.pacing_feedback().is_none());

        buf.push(coded_frame(2 * FRAME_DURATION));
        buf.push(coded_frame(3 * FRAME_DURATION));
        // Span now covers 4 frame durations
        assert!(buf.is_complete());
    }

    #[test]
    fn test_feedback_reflects_buffered_span() {
        let buf = buffer(4);
        for i in 0..4 {
            buf.push(coded_frame(i * FRAME_DURATION));
        }
        buf.record_exit();

        let fill = buf.pacing_feedback().unwrap();
        // Four frames buffered against a four-frame window, minimal time
        // since exit: fill close to 1.0
        assert!(fill > 0.9 && fill <= 1.1, "fill = {}", fill);
    }

    #[test]
    fn test_feedback_negative_when_empty() {
        let buf = buffer(4);
        for i in 0..4 {
            buf.push(coded_frame(i * FRAME_DURATION));
        }
        while buf.queue.try_dequeue().is_some() {}
        // Exit recorded, then time passes with an empty buffer
        buf.record_exit();
        std::thread::sleep(Duration::from_millis(20));

        let fill = buf.pacing_feedback().unwrap();
        assert!(fill < 0.0, "fill = {}", fill);
    }

    #[test]
    fn test_mark_incomplete_resets() {
        let buf = buffer(2);
        buf.push(coded_frame(0));
        buf.push(coded_frame(FRAME_DURATION));
        buf.record_exit();
        assert!(buf.is_complete());
        assert!(buf.pacing_feedback().is_some());

        buf.mark_incomplete();
        assert!(!buf.is_complete());
        assert!(buf.pacing_feedback().is_none());
    }

    #[test]
    fn test_zero_frame_window_clamped() {
        // A zero-sized window must not divide by zero
        let buf = buffer(0);
        buf.push(coded_frame(0));
        buf.record_exit();
        let fill = buf.pacing_feedback();
        assert!(fill.is_some());
        assert!(fill.unwrap().is_finite());
    }

    #[test]
    fn test_feedback_returns_none_on_shutdown() {
        let buf = buffer(4);
        for i in 0..4 {
            buf.push(coded_frame(i * FRAME_DURATION));
        }
        // Primed but no exit recorded; cancellation must unblock the waiter
        buf.queue().cancel();
        assert!(buf.pacing_feedback().is_none());
    }

    #[test]
    fn test_stage_releases_due_frames_to_mux() {
        let clock = InputClock::new();
        clock.tick(10 * FRAME_DURATION);
        let buf = Arc::new(SmoothingBuffer::new(FRAME_DURATION, 2, 0, clock));
        let mux = Arc::new(FrameQueue::new("mux", 16));

        // All frames already due
        for i in 0..3 {
            buf.push(coded_frame(i * FRAME_DURATION));
        }

        let mut stage = SmoothingStage::new(Arc::clone(&buf), Arc::clone(&mux));
        let handle = std::thread::spawn(move || stage.run());

        while mux.len() < 3 {
            std::thread::yield_now();
        }

        // FIFO order preserved through the buffer
        let mut last = -1;
        while let Some(frame) = mux.try_dequeue() {
            let dts = frame.coded_payload().unwrap().dts;
            assert!(dts > last);
            last = dts;
        }

        buf.queue().cancel();
        handle.join().unwrap().unwrap();
    }
}
