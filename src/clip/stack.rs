//! Length-prefixed frame container.
//!
//! Layout (little endian):
//!
//! ```text
//! magic "CLPS" | version u8 | frame_count u32
//! per frame: sequence u64 | timestamp f64 | width u32 | height u32 | len u32 | payload
//! ```

use std::sync::Arc;

use super::ClipEncoder;
use crate::error::ClipError;
use crate::frame::Frame;

const MAGIC: &[u8; 4] = b"CLPS";
const VERSION: u8 = 1;
const FRAME_HEADER_BYTES: usize = 8 + 8 + 4 + 4 + 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStackEncoder;

impl ClipEncoder for FrameStackEncoder {
    fn format(&self) -> &'static str {
        "stack"
    }

    fn encode(&self, frames: &[Arc<Frame>], _end: f64) -> Result<Vec<u8>, ClipError> {
        let frame_count = u32::try_from(frames.len())
            .map_err(|_| ClipError::Encode("too many frames".to_string()))?;
        let payload_bytes: usize = frames.iter().map(|f| f.payload().len()).sum();
        let mut out =
            Vec::with_capacity(9 + frames.len() * FRAME_HEADER_BYTES + payload_bytes);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&frame_count.to_le_bytes());
        for frame in frames {
            let len = u32::try_from(frame.payload().len())
                .map_err(|_| ClipError::Encode("frame payload too large".to_string()))?;
            out.extend_from_slice(&frame.sequence.to_le_bytes());
            out.extend_from_slice(&frame.timestamp.to_le_bytes());
            out.extend_from_slice(&frame.width.to_le_bytes());
            out.extend_from_slice(&frame.height.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(frame.payload());
        }
        Ok(out)
    }
}

/// Parse a blob produced by `FrameStackEncoder`.
pub fn decode_frame_stack(blob: &[u8]) -> Result<Vec<Frame>, ClipError> {
    let mut cursor = Reader { data: blob, pos: 0 };
    if cursor.take(4)? != MAGIC {
        return Err(ClipError::Protocol("not a frame stack".to_string()));
    }
    let version = cursor.take(1)?[0];
    if version != VERSION {
        return Err(ClipError::Protocol(format!(
            "unsupported frame stack version {}",
            version
        )));
    }
    let count = cursor.u32()? as usize;
    let mut frames = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let sequence = cursor.u64()?;
        let timestamp = f64::from_le_bytes(cursor.array()?);
        let width = cursor.u32()?;
        let height = cursor.u32()?;
        let len = cursor.u32()? as usize;
        let payload = cursor.take(len)?.to_vec();
        frames.push(Frame::new(timestamp, sequence, width, height, payload));
    }
    Ok(frames)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ClipError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ClipError::Protocol("truncated frame stack".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ClipError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, ClipError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, ClipError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}
