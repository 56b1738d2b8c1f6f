//! Static process-lifetime configuration
//!
//! All configuration is supplied before pipeline start and never mutated
//! mid-flight, except the diagnostic toggles which exist for fault
//! injection during testing and are carried in an explicit
//! [`DiagnosticsConfig`] rather than ambient globals.

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::pipeline::types::FrameLedger;

/// Highest channel number addressable by a remap rule (16 channels of
/// embedded SDI audio).
pub const MAX_SOURCE_CHANNELS: u8 = 16;

/// Highest channel number addressable by a mute rule (up to 5.1 outputs).
pub const MAX_OUTPUT_CHANNELS: u8 = 6;

/// End-to-end latency profile of the pipeline.
///
/// The generic profile runs the encoder-output smoothing buffer and a
/// fixed output delay; the low-latency profiles bypass smoothing and hand
/// coded frames straight to the mux queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LatencyMode {
    #[default]
    Generic,
    LowLatency,
    LowestLatency,
}

impl LatencyMode {
    pub fn uses_smoothing(&self) -> bool {
        matches!(self, LatencyMode::Generic)
    }
}

/// One channel remap directive: copy the `src` plane over the `dst` plane.
/// Rules apply in order, so a later rule writing the same destination wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapRule {
    pub src: u8,
    pub dst: u8,
}

/// Parse a remap rule string of the form `"1_2-3_4"`: rules separated by
/// `-`, source and destination channels separated by `_`, channels 1-based.
///
/// Malformed rules (unparseable tokens, out-of-range channels, a channel
/// mapped to itself, exact duplicates) are rejected per-rule with a log
/// line; the valid remainder is kept. Partial configuration failure is not
/// fatal.
pub fn parse_remap_rules(spec: &str) -> Vec<RemapRule> {
    let mut rules: Vec<RemapRule> = Vec::new();

    for rule in spec.split('-').filter(|r| !r.is_empty()) {
        let mut fields = rule.split('_');
        let src = fields.next().and_then(|s| s.parse::<u8>().ok());
        let dst = fields.next().and_then(|s| s.parse::<u8>().ok());

        let (Some(src), Some(dst)) = (src, dst) else {
            warn!("remap rule: {} -- illegal - ignoring", rule);
            continue;
        };
        if src < 1 || src > MAX_SOURCE_CHANNELS || dst < 1 || dst > MAX_SOURCE_CHANNELS {
            warn!("remap rule: {} to {} -- out of range - ignoring", src, dst);
            continue;
        }
        if src == dst {
            warn!("remap rule: {} to {} -- maps channel to itself - ignoring", src, dst);
            continue;
        }
        if rules.iter().any(|r| r.src == src && r.dst == dst) {
            warn!("remap rule: {} to {} -- duplicate - ignoring", src, dst);
            continue;
        }
        rules.push(RemapRule { src, dst });
    }

    rules
}

/// One mute directive for an output channel (1-based).
///
/// Mute rules form a prefix-active list: they are evaluated top to bottom
/// and evaluation stops at the first disabled rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteRule {
    pub channel: u8,
    pub enabled: bool,
}

/// Parse a mute rule string of the form `"1_2"`: output channel numbers
/// separated by `_`. Out-of-range channels are rejected per-rule.
pub fn parse_mute_rules(spec: &str) -> Vec<MuteRule> {
    let mut rules = Vec::new();

    for token in spec.split('_').filter(|t| !t.is_empty()) {
        let Ok(channel) = token.parse::<u8>() else {
            warn!("mute rule: {} -- illegal - ignoring", token);
            continue;
        };
        if channel < 1 || channel > MAX_OUTPUT_CHANNELS {
            warn!("mute rule: {} -- out of range - ignoring", channel);
            continue;
        }
        rules.push(MuteRule { channel, enabled: true });
    }

    rules
}

/// Convert a gain expression like `"6dB"` or `"-3.5"` into a linear scale
/// factor, applied once at configuration time.
pub fn parse_gain_db(spec: &str) -> Result<f64> {
    let trimmed = spec.trim();
    let numeric = trimmed
        .strip_suffix("dB")
        .or_else(|| trimmed.strip_suffix("db"))
        .unwrap_or(trimmed)
        .trim();
    let db: f64 = numeric
        .parse()
        .with_context(|| format!("error evaluating volume expression '{}'", spec))?;
    Ok(10f64.powf(db / 20.0))
}

/// Synthetic PCM effect bits, right/left independently selectable.
///
/// Diagnostic-only: applied by the audio filter when set in
/// [`DiagnosticsConfig`], never in normal operation.
pub mod audio_effect {
    pub const MUTE_RIGHT: u16 = 1 << 0;
    pub const MUTE_LEFT: u16 = 1 << 1;
    pub const STATIC_RIGHT: u16 = 1 << 2;
    pub const STATIC_LEFT: u16 = 1 << 3;
    pub const BUZZ_RIGHT: u16 = 1 << 4;
    pub const BUZZ_LEFT: u16 = 1 << 5;
    pub const ATTENUATE_RIGHT: u16 = 1 << 6;
    pub const ATTENUATE_LEFT: u16 = 1 << 7;
    pub const CLIP_RIGHT: u16 = 1 << 8;
    pub const CLIP_LEFT: u16 = 1 << 9;
}

/// What an audio output stream expects from the fan-out filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AudioOutputKind {
    /// PCM encoder input with this many channels
    Pcm { channels: u8 },
    /// Pre-compressed bitstream passthrough (no re-encode)
    Bitstream,
}

/// Per-output-stream audio configuration as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioOutputConfig {
    pub stream_id: u32,
    #[serde(flatten)]
    pub kind: AudioOutputKind,
    /// 1-based source channel pair this output consumes
    pub source_pair: u8,
    /// Channel offset within the pair (0 = left/first)
    #[serde(default)]
    pub mono_channel: u8,
    /// Remap rule string, e.g. `"3_1-4_2"`
    #[serde(default)]
    pub remap: String,
    /// Mute rule string, e.g. `"1"`
    #[serde(default)]
    pub mute: String,
    /// Gain expression, e.g. `"6dB"`; empty disables gain
    #[serde(default)]
    pub gain_db: String,
    /// Presentation-time adjustment for bitstream passthrough, milliseconds
    #[serde(default)]
    pub offset_ms: i64,
}

/// Video encoder parameters as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoStreamConfig {
    pub stream_id: u32,
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub threads: u32,
    pub keyint_max: u32,
    pub lookahead: u32,
    pub bitrate_kbps: u32,
    pub vbv_max_bitrate_kbps: u32,
    /// Smoothing buffer size in frames (the compressor's buffering window)
    pub buffer_frames: u32,
}

/// Pipeline-wide timing and recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub latency: LatencyMode,
    /// Stall threshold before drop flags are raised, milliseconds
    pub stall_threshold_ms: u64,
    /// Hard loss-of-signal limit; exceeding it terminates the process.
    /// Absent disables the hard limit.
    #[serde(default)]
    pub los_exit_ms: Option<u64>,
    /// Re-submit the last good picture while the source reports no input
    #[serde(default)]
    pub frame_injection: bool,
    /// Injected frames allowed before continued loss becomes fatal
    #[serde(default = "default_max_injected")]
    pub max_injected_frames: u32,
    /// Advisory per-queue capacity before high-water warnings
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_injected() -> u32 {
    600
}

fn default_queue_capacity() -> usize {
    64
}

/// Top-level static configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pipeline: PipelineSettings,
    pub video: Vec<VideoStreamConfig>,
    #[serde(default)]
    pub audio_outputs: Vec<AudioOutputConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Explicit fault-injection and observability switches, passed into stage
/// constructors. Never ambient global state.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsConfig {
    /// Synthetic PCM effect bitmask (`audio_effect::*`); 0 disables
    pub audio_effects: u16,
    /// Frame lifecycle ledger used by test harnesses
    pub frame_ledger: Option<Arc<FrameLedger>>,
}
