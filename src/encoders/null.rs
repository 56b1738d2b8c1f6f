//! Null compressor
//!
//! Wraps each picture verbatim into one coded unit with synthetic
//! buffer-model timing. Lets the pipeline run end to end without codec
//! hardware: timing reconciliation, smoothing and mux handoff all behave as
//! they would with a real encoder, only the payload is uncompressed.

use anyhow::Result;
use bytes::Bytes;
use log::debug;

use crate::pipeline::clock::frame_duration_ticks;

use super::video::{CodecParams, CodedUnit, Compressor, Picture};

#[derive(Default)]
pub struct NullCompressor {
    frame_duration: i64,
    keyint: i64,
}

impl Compressor for NullCompressor {
    fn open(&mut self, params: &mut CodecParams) -> Result<()> {
        self.frame_duration = frame_duration_ticks(params.fps_num, params.fps_den);
        self.keyint = params.keyint_max.max(1) as i64;
        Ok(())
    }

    fn encode(&mut self, picture: Picture) -> Result<Vec<CodedUnit>> {
        let data: Vec<u8> = picture
            .planes
            .iter()
            .flat_map(|p| p.data.iter().copied())
            .collect();

        // No reorder buffer: native dts == pts, transfer takes half a frame
        let native = picture.sequence * self.frame_duration;
        Ok(vec![CodedUnit {
            data: Bytes::from(data),
            keyframe: picture.sequence % self.keyint == 0,
            priority: picture.sequence % self.keyint == 0,
            dts: native,
            pts: native,
            initial_arrival: native,
            final_arrival: native + self.frame_duration / 2,
            clock: picture.clock,
        }])
    }

    fn flush(&mut self) -> Result<Vec<CodedUnit>> {
        Ok(Vec::new())
    }

    fn pace(&mut self, buffer_fill: f32) {
        debug!("null compressor: buffer fill {:.3}", buffer_fill);
    }
}
