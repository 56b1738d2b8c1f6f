//! Encoder stages and their pacing companion

pub mod null;
pub mod smoothing;
pub mod video;

pub use null::NullCompressor;
pub use smoothing::{SmoothingBuffer, SmoothingStage};
pub use video::{CodecParams, CodedUnit, Compressor, EncoderStage, Picture};
