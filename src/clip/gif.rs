//! Animated GIF clips (feature: encode-gif).
//!
//! Frames are expected to carry RGB8 payloads. Each frame is shown until the
//! next frame's timestamp; the last one until the clip end.

use std::sync::Arc;

use image::codecs::gif::{GifEncoder as ImageGifEncoder, Repeat};
use image::{Delay, Frame as ImageFrame, RgbaImage};

use super::ClipEncoder;
use crate::error::ClipError;
use crate::frame::Frame;

/// Minimum per-frame delay most GIF decoders honour.
const MIN_DELAY_MS: u32 = 20;

#[derive(Debug, Clone, Copy, Default)]
pub struct GifEncoder;

impl ClipEncoder for GifEncoder {
    fn format(&self) -> &'static str {
        "gif"
    }

    fn encode(&self, frames: &[Arc<Frame>], end: f64) -> Result<Vec<u8>, ClipError> {
        let mut out = Vec::new();
        {
            let mut encoder = ImageGifEncoder::new(&mut out);
            encoder
                .set_repeat(Repeat::Infinite)
                .map_err(|e| ClipError::Encode(e.to_string()))?;
            for (i, frame) in frames.iter().enumerate() {
                let next = frames.get(i + 1).map(|f| f.timestamp).unwrap_or(end);
                let delay_ms = (((next - frame.timestamp) * 1000.0).round() as u32).max(MIN_DELAY_MS);
                let image = rgb_to_rgba(frame)?;
                encoder
                    .encode_frame(ImageFrame::from_parts(
                        image,
                        0,
                        0,
                        Delay::from_numer_denom_ms(delay_ms, 1),
                    ))
                    .map_err(|e| ClipError::Encode(e.to_string()))?;
            }
        }
        Ok(out)
    }
}

fn rgb_to_rgba(frame: &Frame) -> Result<RgbaImage, ClipError> {
    let expected = frame.width as usize * frame.height as usize * 3;
    let rgb = frame.payload();
    if rgb.len() != expected {
        return Err(ClipError::Encode(format!(
            "frame {} payload is {} bytes, expected {} for {}x{} RGB",
            frame.sequence,
            rgb.len(),
            expected,
            frame.width,
            frame.height
        )));
    }
    let mut rgba = Vec::with_capacity(expected / 3 * 4);
    for px in rgb.chunks_exact(3) {
        rgba.extend_from_slice(&[px[0], px[1], px[2], 255]);
    }
    RgbaImage::from_raw(frame.width, frame.height, rgba)
        .ok_or_else(|| ClipError::Encode("frame dimensions do not match payload".to_string()))
}
