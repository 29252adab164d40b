//! Clip assembly.
//!
//! `ClipAssembler` turns a frame sequence plus the requested window into an
//! encoded clip with metadata. The encoding itself is delegated to a
//! `ClipEncoder`:
//! - `FrameStackEncoder`: length-prefixed frame container (always available)
//! - `GifEncoder`: animated GIF (feature: encode-gif)

#[cfg(feature = "encode-gif")]
pub mod gif;
pub mod stack;

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::error::ClipError;
use crate::frame::Frame;

#[cfg(feature = "encode-gif")]
pub use gif::GifEncoder;
pub use stack::{decode_frame_stack, FrameStackEncoder};

/// Turns a frame sequence into a transportable blob.
pub trait ClipEncoder: Send + Sync {
    /// Short name of the produced format (e.g. "stack", "gif").
    fn format(&self) -> &'static str;

    /// Encode `frames` (non-empty, ascending). `end` closes the last frame's span.
    fn encode(&self, frames: &[Arc<Frame>], end: f64) -> Result<Vec<u8>, ClipError>;
}

/// Build the encoder named in configuration.
pub fn encoder_by_name(name: &str) -> Result<Box<dyn ClipEncoder>> {
    match name {
        "stack" => Ok(Box::new(FrameStackEncoder)),
        #[cfg(feature = "encode-gif")]
        "gif" => Ok(Box::new(GifEncoder)),
        #[cfg(not(feature = "encode-gif"))]
        "gif" => Err(anyhow!("gif clips require the encode-gif feature")),
        other => Err(anyhow!("unknown clip encoder '{}'", other)),
    }
}

/// An encoded clip and its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedClip {
    pub blob: Vec<u8>,
    pub format: &'static str,
    pub frame_count: usize,
    /// Requested window length (`end - start`), not derived from frames.
    pub duration_secs: f64,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
}

impl EncodedClip {
    /// Observed capture rate; compare against the expected cadence to spot gaps.
    pub fn effective_fps(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.frame_count as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

pub struct ClipAssembler {
    encoder: Box<dyn ClipEncoder>,
}

impl ClipAssembler {
    pub fn new(encoder: Box<dyn ClipEncoder>) -> Self {
        Self { encoder }
    }

    pub fn format(&self) -> &'static str {
        self.encoder.format()
    }

    /// Encode `frames` as the clip `[start, end)`.
    ///
    /// Fails with `EmptyRange` when there is nothing to encode; the caller
    /// decides whether that is worth a retry.
    pub fn assemble(
        &self,
        frames: &[Arc<Frame>],
        start: f64,
        end: f64,
    ) -> Result<EncodedClip, ClipError> {
        if frames.is_empty() {
            return Err(ClipError::EmptyRange);
        }
        let blob = self.encoder.encode(frames, end)?;
        Ok(EncodedClip {
            blob,
            format: self.encoder.format(),
            frame_count: frames.len(),
            duration_secs: end - start,
            start_timestamp: start,
            end_timestamp: end,
        })
    }
}

impl Default for ClipAssembler {
    fn default() -> Self {
        Self::new(Box::new(FrameStackEncoder))
    }
}
