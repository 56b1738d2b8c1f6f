//! Audio channel fan-out filter
//!
//! Takes in the full set of embedded capture channels (typically all 16
//! channels of SDI audio) and creates one tailored frame per downstream
//! audio encoder, with the correct channels present. Pre-compressed
//! bitstream audio riding in the PCM slots is routed to at most one
//! matching encoder without re-encoding.

use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;

use crate::config::{
    AudioOutputConfig, AudioOutputKind, DiagnosticsConfig, MuteRule, RemapRule, audio_effect,
    parse_gain_db, parse_mute_rules, parse_remap_rules,
};
use crate::pipeline::clock::TICKS_PER_MS;
use crate::pipeline::health::PipelineMetrics;
use crate::pipeline::queue::FrameQueue;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::types::{AudioPlanes, Frame, RawPayload, SampleCoding, StreamId};

/// Upper bound on samples per channel per frame. Some equipment sends very
/// short or corrupt audio frames just prior to signal loss; anything outside
/// (0, MAX] is dropped before fan-out.
pub const MAX_AUDIO_SAMPLES: usize = 8192;

enum OutputKind {
    Pcm {
        channels: usize,
        /// Linear gain factor; only 2- and 6-channel outputs support gain
        gain: Option<f64>,
    },
    Bitstream {
        /// Presentation-time adjustment in 27 MHz ticks
        offset_ticks: i64,
    },
}

/// One compiled output-stream target of the fan-out.
struct AudioOutput {
    stream_id: StreamId,
    kind: OutputKind,
    source_pair: u8,
    mono_channel: u8,
    remap: Vec<RemapRule>,
    mute: Vec<MuteRule>,
    queue: Arc<FrameQueue>,
}

impl AudioOutput {
    /// Compile one output's configuration. Malformed remap/mute rules were
    /// already rejected per-rule by the parsers; a gain request on an
    /// unsupported channel count is ignored here with a log line.
    fn compile(config: &AudioOutputConfig, queue: Arc<FrameQueue>) -> Self {
        let remap = parse_remap_rules(&config.remap);
        let mute = parse_mute_rules(&config.mute);

        let kind = match config.kind {
            AudioOutputKind::Pcm { channels } => {
                let mut gain = None;
                if !config.gain_db.is_empty() {
                    if channels == 2 || channels == 6 {
                        match parse_gain_db(&config.gain_db) {
                            Ok(linear) => {
                                info!(
                                    "stream {}: applying audio gain of {:.4}",
                                    config.stream_id, linear
                                );
                                gain = Some(linear);
                            }
                            Err(e) => warn!("stream {}: {:#}", config.stream_id, e),
                        }
                    } else {
                        warn!(
                            "stream {}: {} channels, ignoring gain request",
                            config.stream_id, channels
                        );
                    }
                }
                OutputKind::Pcm {
                    channels: channels as usize,
                    gain,
                }
            }
            AudioOutputKind::Bitstream => OutputKind::Bitstream {
                offset_ticks: config.offset_ms * TICKS_PER_MS,
            },
        };

        for rule in &remap {
            info!(
                "stream {}: active remap rule {:2} to {:2}",
                config.stream_id, rule.src, rule.dst
            );
        }

        Self {
            stream_id: config.stream_id,
            kind,
            source_pair: config.source_pair,
            mono_channel: config.mono_channel,
            remap,
            mute,
            queue,
        }
    }
}

/// The fan-out stage: one ingress queue in, N per-output queues out.
pub struct AudioFanoutFilter {
    input: Arc<FrameQueue>,
    outputs: Vec<AudioOutput>,
    diagnostics: DiagnosticsConfig,
    metrics: Arc<PipelineMetrics>,
}

impl AudioFanoutFilter {
    pub fn new(
        input: Arc<FrameQueue>,
        outputs: &[(AudioOutputConfig, Arc<FrameQueue>)],
        diagnostics: DiagnosticsConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let outputs = outputs
            .iter()
            .map(|(config, queue)| AudioOutput::compile(config, Arc::clone(queue)))
            .collect();
        Self {
            input,
            outputs,
            diagnostics,
            metrics,
        }
    }

    /// Fan one ingress frame out to every claiming output. Consumes the
    /// frame: it is either moved to a bitstream output or dropped here once
    /// all PCM copies are made.
    pub fn process(&self, frame: Frame) {
        let Some(raw) = frame.raw_payload() else {
            warn!("audio filter: coded frame on ingress queue, dropping");
            self.metrics.record_drop();
            return;
        };
        let Some(audio) = raw.audio.as_ref() else {
            warn!("audio filter: frame without audio planes, dropping");
            self.metrics.record_drop();
            return;
        };

        if audio.samples == 0 || audio.samples > MAX_AUDIO_SAMPLES {
            warn!(
                "audio filter: illegal sample count {}, dropping frame",
                audio.samples
            );
            self.metrics.record_drop();
            return;
        }

        let coding = audio.coding;
        let source_pair = audio.source_pair;
        match coding {
            SampleCoding::Pcm => self.fan_out_pcm(&frame),
            SampleCoding::Bitstream => self.route_bitstream(frame, source_pair),
        }
    }

    fn fan_out_pcm(&self, frame: &Frame) {
        let Some(audio) = frame.raw_payload().and_then(|raw| raw.audio.as_ref()) else {
            return;
        };

        let mut claimed = false;
        for output in &self.outputs {
            let OutputKind::Pcm { channels, gain } = &output.kind else {
                continue;
            };

            let mut split = self.split_channels(output, *channels, audio);
            apply_effects(&mut split, self.diagnostics.audio_effects);
            if let Some(gain) = gain {
                apply_gain(&mut split, *gain);
            }
            apply_mutes(&mut split, &output.mute);

            let mut out_frame = Frame::raw(
                output.stream_id,
                frame.clock,
                RawPayload::audio(split),
            );
            if let Some(ledger) = &self.diagnostics.frame_ledger {
                out_frame = out_frame.track(ledger);
            }
            output.queue.enqueue(out_frame);
            claimed = true;
        }

        if !claimed {
            // No PCM output wanted it and bitstream outputs ignore PCM:
            // released unconsumed.
            self.metrics.record_drop();
        }
        // The source frame drops here; every output owns its own copy.
    }

    /// A bitstream buffer carries one coherent stream from a single SDI
    /// group, so it can only end up at one downstream encoder. The first
    /// output whose configured pair matches claims the original frame.
    fn route_bitstream(&self, mut frame: Frame, source_pair: u8) {
        for output in &self.outputs {
            let OutputKind::Bitstream { offset_ticks } = &output.kind else {
                continue;
            };
            if output.source_pair != source_pair {
                continue;
            }

            frame.clock.audio_pts += offset_ticks;
            frame.stream_id = output.stream_id;
            output.queue.enqueue(frame);
            return;
        }

        // No claim: released unconsumed, never forwarded.
        self.metrics.record_drop();
    }

    /// Copy the configured channel set out of the source frame, applying
    /// remap rules first when present (on a scratch copy, so independent
    /// outputs never observe each other's remaps).
    fn split_channels(
        &self,
        output: &AudioOutput,
        channels: usize,
        audio: &AudioPlanes,
    ) -> AudioPlanes {
        let mut split = AudioPlanes::zeroed(channels, audio.samples);
        split.source_pair = audio.source_pair;

        let scratch;
        let source = if output.remap.is_empty() {
            audio
        } else {
            scratch = remap_channels(audio, &output.remap);
            &scratch
        };

        let base = (output.source_pair as usize - 1) * 2 + output.mono_channel as usize;
        for c in 0..channels {
            let src = base + c;
            if src < source.channels {
                split.plane_mut(c).copy_from_slice(source.plane(src));
            }
            // Channels past the source stay silent rather than aborting the
            // whole frame.
        }
        split
    }
}

/// Duplicate the source planes and run the remap table over the copy.
/// Rules apply in order: a later rule writing the same destination wins.
fn remap_channels(audio: &AudioPlanes, rules: &[RemapRule]) -> AudioPlanes {
    let mut remapped = audio.clone();
    for rule in rules {
        let src = rule.src as usize - 1;
        let dst = rule.dst as usize - 1;
        if src >= audio.channels || dst >= audio.channels {
            // Validated against the channel maximum at configuration time,
            // but this frame may carry fewer channels.
            continue;
        }
        let plane = audio.plane(src).to_vec();
        remapped.plane_mut(dst).copy_from_slice(&plane);
    }
    remapped
}

/// Gain multiply in floating point, truncated back to integer.
fn apply_gain(planes: &mut AudioPlanes, scaler: f64) {
    for sample in planes.data.iter_mut() {
        *sample = (*sample as f64 * scaler) as i32;
    }
}

/// Mute rules are evaluated top to bottom and stop at the first disabled
/// entry.
fn apply_mutes(planes: &mut AudioPlanes, rules: &[MuteRule]) {
    for rule in rules {
        if !rule.enabled {
            return;
        }
        let channel = rule.channel as usize;
        if channel >= 1 && channel <= planes.channels {
            planes.plane_mut(channel - 1).fill(0);
        }
    }
}

/// Synthetic PCM effects on the first stereo pair, for fault injection
/// during testing. Plane 0 is left, plane 1 is right.
fn apply_effects(planes: &mut AudioPlanes, mask: u16) {
    if mask == 0 || planes.channels < 2 {
        return;
    }
    let samples = planes.samples;

    if mask & (audio_effect::MUTE_LEFT | audio_effect::MUTE_RIGHT) != 0 {
        if mask & audio_effect::MUTE_LEFT != 0 {
            planes.plane_mut(0).fill(0);
        }
        if mask & audio_effect::MUTE_RIGHT != 0 {
            planes.plane_mut(1).fill(0);
        }
    }
    if mask & (audio_effect::STATIC_LEFT | audio_effect::STATIC_RIGHT) != 0 {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        if mask & audio_effect::STATIC_LEFT != 0 {
            for sample in planes.plane_mut(0) {
                *sample = rng.r#gen();
            }
        }
        if mask & audio_effect::STATIC_RIGHT != 0 {
            for sample in planes.plane_mut(1) {
                *sample = rng.r#gen();
            }
        }
    }
    if mask & (audio_effect::BUZZ_LEFT | audio_effect::BUZZ_RIGHT) != 0 {
        // Four hot samples at the top of every 16-sample block
        for (bit, channel) in [(audio_effect::BUZZ_LEFT, 0), (audio_effect::BUZZ_RIGHT, 1)] {
            if mask & bit == 0 {
                continue;
            }
            let plane = planes.plane_mut(channel);
            for block in 0..samples / 16 {
                for s in 0..4 {
                    plane[block * 16 + s] = -200_000_000;
                }
            }
        }
    }
    if mask & (audio_effect::ATTENUATE_LEFT | audio_effect::ATTENUATE_RIGHT) != 0 {
        for (bit, channel) in [
            (audio_effect::ATTENUATE_LEFT, 0),
            (audio_effect::ATTENUATE_RIGHT, 1),
        ] {
            if mask & bit == 0 {
                continue;
            }
            for sample in planes.plane_mut(channel) {
                *sample /= 4;
            }
        }
    }
    if mask & (audio_effect::CLIP_LEFT | audio_effect::CLIP_RIGHT) != 0 {
        for (bit, channel) in [(audio_effect::CLIP_LEFT, 0), (audio_effect::CLIP_RIGHT, 1)] {
            if mask & bit == 0 {
                continue;
            }
            for sample in planes.plane_mut(channel) {
                *sample = sample.saturating_mul(8);
            }
        }
    }
}

impl PipelineStage for AudioFanoutFilter {
    fn run(&mut self) -> Result<()> {
        while let Some(frame) = self.input.dequeue_blocking() {
            self.process(frame);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "audio-filter"
    }
}
