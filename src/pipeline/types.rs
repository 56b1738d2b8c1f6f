//! Core frame types for the pipeline system

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::clock::ClockRecord;

/// Identifier of a logical input or output stream.
pub type StreamId = u32;

/// Audio sample coding carried inside the PCM channel slots.
///
/// Capture hardware delivers either plain PCM or a pre-compressed bitstream
/// (e.g. AC-3 riding in a channel pair). Bitstream frames are routed, never
/// resampled or re-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleCoding {
    /// Planar 32-bit signed PCM
    Pcm,
    /// Pre-compressed bitstream riding in PCM slots
    Bitstream,
}

/// One video plane with its stride and owned pixel data.
#[derive(Debug, Clone)]
pub struct Plane {
    pub stride: usize,
    pub data: Vec<u8>,
}

/// Uncompressed video picture data owned by a frame.
#[derive(Debug, Clone)]
pub struct VideoPlanes {
    pub width: u32,
    pub height: u32,
    /// Sample aspect ratio as (num, den); a change mid-stream is forwarded
    /// to the compressor at the next keyframe.
    pub sar: (u32, u32),
    pub planes: Vec<Plane>,
}

/// Uncompressed audio data owned by a frame.
///
/// Samples are planar 32-bit signed integers (S32P), the fixed capture
/// format: channel `c` occupies `data[c * samples .. (c + 1) * samples]`.
#[derive(Debug, Clone)]
pub struct AudioPlanes {
    pub coding: SampleCoding,
    /// 1-based channel pair this audio was captured from (pair 1 = channels
    /// 1+2, pair 2 = channels 3+4, ...). Used to route bitstream frames.
    pub source_pair: u8,
    pub channels: usize,
    /// Samples per channel
    pub samples: usize,
    pub data: Vec<i32>,
}

impl AudioPlanes {
    /// Allocate a zeroed planar buffer for `channels` x `samples`.
    pub fn zeroed(channels: usize, samples: usize) -> Self {
        Self {
            coding: SampleCoding::Pcm,
            source_pair: 1,
            channels,
            samples,
            data: vec![0i32; channels * samples],
        }
    }

    /// Immutable view of one channel plane. 0-based index.
    pub fn plane(&self, channel: usize) -> &[i32] {
        &self.data[channel * self.samples..(channel + 1) * self.samples]
    }

    /// Mutable view of one channel plane. 0-based index.
    pub fn plane_mut(&mut self, channel: usize) -> &mut [i32] {
        &mut self.data[channel * self.samples..(channel + 1) * self.samples]
    }
}

/// Type tag of an ancillary user-data item attached by the VANC parsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AncillaryKind {
    /// ITU-T T.35 registered payload (e.g. captions), accepted by encoders
    ItuT35Registered,
    /// ITU-T T.35 unregistered payload, accepted by encoders
    ItuT35Unregistered,
    /// Anything else; encoders warn and discard
    Other(u8),
}

impl AncillaryKind {
    /// Whether a video compressor accepts this payload type verbatim.
    pub fn encoder_accepted(&self) -> bool {
        matches!(
            self,
            AncillaryKind::ItuT35Registered | AncillaryKind::ItuT35Unregistered
        )
    }
}

/// Side-channel data item whose ownership passes to the frame.
#[derive(Debug, Clone)]
pub struct AncillaryData {
    pub kind: AncillaryKind,
    pub data: Bytes,
}

/// Payload of an uncompressed frame: image planes and/or audio planes plus
/// any ancillary items the parsers attached before it was queued.
#[derive(Debug, Clone, Default)]
pub struct RawPayload {
    pub video: Option<VideoPlanes>,
    pub audio: Option<AudioPlanes>,
    pub ancillary: Vec<AncillaryData>,
    guard: PayloadGuard,
}

impl RawPayload {
    pub fn video(planes: VideoPlanes) -> Self {
        Self {
            video: Some(planes),
            ..Default::default()
        }
    }

    pub fn audio(planes: AudioPlanes) -> Self {
        Self {
            audio: Some(planes),
            ..Default::default()
        }
    }
}

/// Payload of a compressed access unit produced by an encoder stage.
#[derive(Debug, Clone)]
pub struct CodedPayload {
    pub data: Bytes,
    pub len: usize,
    /// Keyframe / random access point
    pub random_access: bool,
    /// High-priority unit (e.g. an I frame)
    pub priority: bool,
    /// Reconciled presentation timestamp, 27 MHz ticks
    pub pts: i64,
    /// Reconciled decode timestamp, 27 MHz ticks
    pub dts: i64,
    /// Buffer-model initial arrival time used downstream for pacing
    pub initial_arrival: i64,
    /// Buffer-model final arrival time used downstream for pacing
    pub final_arrival: i64,
    guard: PayloadGuard,
}

impl CodedPayload {
    pub fn new(data: Bytes) -> Self {
        let len = data.len();
        Self {
            data,
            len,
            random_access: false,
            priority: false,
            pts: 0,
            dts: 0,
            initial_arrival: 0,
            final_arrival: 0,
            guard: PayloadGuard::default(),
        }
    }
}

/// Variant data moved through the pipeline.
#[derive(Debug, Clone)]
pub enum FramePayload {
    Raw(RawPayload),
    Coded(CodedPayload),
}

/// The unit moved between stages.
///
/// A frame is exclusively owned by one stage at a time; ownership transfers
/// by moving it through a [`super::queue::FrameQueue`]. There is no shared
/// access to payload memory: a stage that holds a `Frame` by value is its
/// sole owner, and dropping it releases payload storage and envelope in one
/// step.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub clock: ClockRecord,
    pub payload: FramePayload,
    guard: EnvelopeGuard,
}

impl Frame {
    pub fn raw(stream_id: StreamId, clock: ClockRecord, payload: RawPayload) -> Self {
        Self {
            stream_id,
            clock,
            payload: FramePayload::Raw(payload),
            guard: EnvelopeGuard::default(),
        }
    }

    pub fn coded(stream_id: StreamId, clock: ClockRecord, payload: CodedPayload) -> Self {
        Self {
            stream_id,
            clock,
            payload: FramePayload::Coded(payload),
            guard: EnvelopeGuard::default(),
        }
    }

    /// Register this frame with a lifecycle ledger. Creation is counted now,
    /// release when the frame (or any clone of it) is dropped.
    pub fn track(mut self, ledger: &Arc<FrameLedger>) -> Self {
        ledger.envelopes_created.fetch_add(1, Ordering::Relaxed);
        ledger.payloads_created.fetch_add(1, Ordering::Relaxed);
        self.guard = EnvelopeGuard(Some(Arc::clone(ledger)));
        let payload_guard = PayloadGuard(Some(Arc::clone(ledger)));
        match &mut self.payload {
            FramePayload::Raw(p) => p.guard = payload_guard,
            FramePayload::Coded(p) => p.guard = payload_guard,
        }
        self
    }

    pub fn raw_payload(&self) -> Option<&RawPayload> {
        match &self.payload {
            FramePayload::Raw(p) => Some(p),
            FramePayload::Coded(_) => None,
        }
    }

    pub fn coded_payload(&self) -> Option<&CodedPayload> {
        match &self.payload {
            FramePayload::Raw(_) => None,
            FramePayload::Coded(p) => Some(p),
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.coded_payload().map(|p| p.random_access).unwrap_or(false)
    }

    pub fn size(&self) -> usize {
        match &self.payload {
            FramePayload::Raw(p) => {
                let video = p
                    .video
                    .as_ref()
                    .map(|v| v.planes.iter().map(|pl| pl.data.len()).sum())
                    .unwrap_or(0usize);
                let audio = p.audio.as_ref().map(|a| a.data.len() * 4).unwrap_or(0);
                video + audio
            }
            FramePayload::Coded(p) => p.len,
        }
    }
}

/// Frame lifecycle counters for the diagnostic test harness.
///
/// Counts envelope and payload constructions and drops so the at-most-once
/// ownership property stays observable: after a pipeline quiesces, created
/// must equal released on every path (forwarded, filtered out, superseded).
#[derive(Debug, Default)]
pub struct FrameLedger {
    pub envelopes_created: AtomicU64,
    pub envelopes_released: AtomicU64,
    pub payloads_created: AtomicU64,
    pub payloads_released: AtomicU64,
}

impl FrameLedger {
    pub fn balanced(&self) -> bool {
        self.envelopes_created.load(Ordering::Relaxed)
            == self.envelopes_released.load(Ordering::Relaxed)
            && self.payloads_created.load(Ordering::Relaxed)
                == self.payloads_released.load(Ordering::Relaxed)
    }

    pub fn outstanding(&self) -> u64 {
        self.envelopes_created
            .load(Ordering::Relaxed)
            .saturating_sub(self.envelopes_released.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
struct EnvelopeGuard(Option<Arc<FrameLedger>>);

impl Clone for EnvelopeGuard {
    fn clone(&self) -> Self {
        if let Some(ledger) = &self.0 {
            ledger.envelopes_created.fetch_add(1, Ordering::Relaxed);
        }
        Self(self.0.clone())
    }
}

impl Drop for EnvelopeGuard {
    fn drop(&mut self) {
        if let Some(ledger) = &self.0 {
            ledger.envelopes_released.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Default)]
struct PayloadGuard(Option<Arc<FrameLedger>>);

impl Clone for PayloadGuard {
    fn clone(&self) -> Self {
        if let Some(ledger) = &self.0 {
            ledger.payloads_created.fetch_add(1, Ordering::Relaxed);
        }
        Self(self.0.clone())
    }
}

impl Drop for PayloadGuard {
    fn drop(&mut self) {
        if let Some(ledger) = &self.0 {
            ledger.payloads_released.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::ClockRecord;

    #[test]
    fn test_audio_plane_layout() {
        let mut planes = AudioPlanes::zeroed(2, 4);
        planes.plane_mut(0).copy_from_slice(&[1, 2, 3, 4]);
        planes.plane_mut(1).copy_from_slice(&[5, 6, 7, 8]);

        assert_eq!(planes.plane(0), &[1, 2, 3, 4]);
        assert_eq!(planes.plane(1), &[5, 6, 7, 8]);
        assert_eq!(planes.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_ledger_counts_drop() {
        let ledger = Arc::new(FrameLedger::default());
        let frame = Frame::raw(
            0,
            ClockRecord::default(),
            RawPayload::audio(AudioPlanes::zeroed(2, 16)),
        )
        .track(&ledger);

        assert_eq!(ledger.envelopes_created.load(Ordering::Relaxed), 1);
        assert_eq!(ledger.envelopes_released.load(Ordering::Relaxed), 0);
        assert!(!ledger.balanced());

        drop(frame);
        assert!(ledger.balanced());
    }

    #[test]
    fn test_ledger_counts_clone() {
        let ledger = Arc::new(FrameLedger::default());
        let frame = Frame::raw(
            0,
            ClockRecord::default(),
            RawPayload::audio(AudioPlanes::zeroed(2, 16)),
        )
        .track(&ledger);

        let copy = frame.clone();
        assert_eq!(ledger.envelopes_created.load(Ordering::Relaxed), 2);

        drop(frame);
        drop(copy);
        assert!(ledger.balanced());
    }

    #[test]
    fn test_ancillary_acceptance() {
        assert!(AncillaryKind::ItuT35Registered.encoder_accepted());
        assert!(AncillaryKind::ItuT35Unregistered.encoder_accepted());
        assert!(!AncillaryKind::Other(9).encoder_accepted());
    }
}
