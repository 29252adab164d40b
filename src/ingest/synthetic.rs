//! Synthetic frame source (`stub://`).
//!
//! Produces RGB frames with a slowly drifting pattern plus a "scene change"
//! every 50 frames, so clips built from it visibly move.

use anyhow::{anyhow, Result};
use rand::Rng;

use super::{FrameSource, SourceConfig, SourceStats};
use crate::frame::Frame;
use crate::Clock;

pub struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
    /// Simulated scene state; bumps occasionally to simulate motion.
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn generate_synthetic_pixels(&mut self) -> Result<Vec<u8>> {
        let pixel_count = rgb_len(self.config.width, self.config.height).ok_or_else(|| {
            anyhow!(
                "frame size {}x{} is too large",
                self.config.width,
                self.config.height
            )
        })?;

        if self.frame_count.is_multiple_of(50) {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let noise: u8 = rand::thread_rng().gen_range(0..4);
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64 * 40 + noise as u64)
                % 256) as u8;
        }
        Ok(pixels)
    }
}

/// Byte length of an RGB8 frame, or `None` if it does not fit in `usize`.
fn rgb_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(3)
}

impl FrameSource for SyntheticSource {
    /// Synthetic sources are always "connected".
    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self, clock: &dyn Clock) -> Result<Frame> {
        let timestamp = clock.now();
        let sequence = self.frame_count;
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels()?;
        Ok(Frame::new(
            timestamp,
            sequence,
            self.config.width,
            self.config.height,
            pixels,
        ))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }
}
