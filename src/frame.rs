//! Frames and the rolling frame buffer.
//!
//! - `Frame`: Immutable captured image with a monotonic timestamp and sequence number.
//! - `RollingFrameBuffer`: Fixed-duration window of the most recent frames.
//! - `RangeRead`: Copy-out result of a range read, including the achieved start.
//!
//! The capture path appends and the serve path reads. Both hold the buffer lock
//! only long enough to push or to clone `Arc` handles out; encoding a clip never
//! happens under the lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::ClipError;

/// Default rolling window duration in seconds.
pub const DEFAULT_WINDOW_SECS: f64 = 20.0;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A captured frame. Immutable once created; shared by `Arc` after append.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Monotonic capture time in seconds.
    pub timestamp: f64,
    /// Monotonically increasing capture sequence.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Opaque image payload (RGB8 for the built-in sources).
    data: Vec<u8>,
}

impl Frame {
    pub fn new(timestamp: f64, sequence: u64, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            timestamp,
            sequence,
            width,
            height,
            data,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.data.len()
    }
}

// ----------------------------------------------------------------------------
// RangeRead
// ----------------------------------------------------------------------------

/// Frames copied out of the buffer for `[requested_start, end)`.
///
/// When the requested start predates the oldest buffered frame the read begins
/// at the oldest available frame and `achieved_start` says where.
#[derive(Debug, Clone)]
pub struct RangeRead {
    pub frames: Vec<Arc<Frame>>,
    pub requested_start: f64,
    pub achieved_start: f64,
    pub end: f64,
}

impl RangeRead {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Seconds lost to buffer overrun at the head of the range.
    pub fn gap_seconds(&self) -> f64 {
        (self.achieved_start - self.requested_start).max(0.0)
    }

    pub fn is_overrun(&self) -> bool {
        self.achieved_start > self.requested_start
    }
}

/// Point-in-time view of buffer occupancy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferStats {
    pub frame_count: usize,
    pub duration_secs: f64,
    pub memory_bytes: usize,
}

// ----------------------------------------------------------------------------
// RollingFrameBuffer
// ----------------------------------------------------------------------------

/// Fixed-duration circular store of frames.
///
/// Invariants:
/// - Stored timestamps are strictly ascending.
/// - `newest.timestamp - oldest.timestamp <= window` after every append.
pub struct RollingFrameBuffer {
    frames: Mutex<VecDeque<Arc<Frame>>>,
    window_secs: f64,
}

impl RollingFrameBuffer {
    pub fn new(window_secs: f64) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            window_secs,
        }
    }

    pub fn window_secs(&self) -> f64 {
        self.window_secs
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<Frame>>> {
        // A panicked holder cannot leave the deque half-mutated: every
        // mutation is a single push or pop.
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a frame and evict everything older than `frame.timestamp - window`.
    ///
    /// Rejects frames whose timestamp is not strictly after the newest buffered one;
    /// the buffer is left untouched in that case.
    pub fn append(&self, frame: Frame) -> Result<(), ClipError> {
        let now = frame.timestamp;
        let evicted = {
            let mut frames = self.lock();
            if let Some(newest) = frames.back() {
                if now <= newest.timestamp {
                    return Err(ClipError::OutOfOrderFrame {
                        timestamp: now,
                        newest: newest.timestamp,
                    });
                }
            }
            frames.push_back(Arc::new(frame));

            let mut evicted = Vec::new();
            while let Some(oldest) = frames.front() {
                if now - oldest.timestamp > self.window_secs {
                    if let Some(frame) = frames.pop_front() {
                        evicted.push(frame);
                    }
                } else {
                    break;
                }
            }
            evicted
        };
        // Payloads are released after the lock is gone.
        drop(evicted);
        Ok(())
    }

    /// All buffered frames with `start <= timestamp < end`, in timestamp order.
    ///
    /// An empty result means "nothing available yet", not an error.
    pub fn read_range(&self, start: f64, end: f64) -> RangeRead {
        let frames = self.lock();
        let achieved_start = match frames.front() {
            Some(oldest) if oldest.timestamp > start => oldest.timestamp,
            _ => start,
        };
        let lo = frames.partition_point(|f| f.timestamp < start);
        let hi = frames.partition_point(|f| f.timestamp < end);
        let selected: Vec<Arc<Frame>> = if lo < hi {
            frames.range(lo..hi).cloned().collect()
        } else {
            Vec::new()
        };
        RangeRead {
            frames: selected,
            requested_start: start,
            achieved_start,
            end,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Span between the oldest and newest buffered frames.
    pub fn buffered_duration_secs(&self) -> f64 {
        span(&self.lock())
    }

    pub fn oldest_timestamp(&self) -> Option<f64> {
        self.lock().front().map(|f| f.timestamp)
    }

    pub fn newest_timestamp(&self) -> Option<f64> {
        self.lock().back().map(|f| f.timestamp)
    }

    /// Memory usage estimate of buffered payloads.
    pub fn memory_bytes(&self) -> usize {
        self.lock().iter().map(|f| f.byte_len()).sum()
    }

    /// Count, duration and memory taken under a single lock.
    pub fn stats(&self) -> BufferStats {
        let frames = self.lock();
        BufferStats {
            frame_count: frames.len(),
            duration_secs: span(&frames),
            memory_bytes: frames.iter().map(|f| f.byte_len()).sum(),
        }
    }
}

impl Default for RollingFrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SECS)
    }
}

fn span(frames: &VecDeque<Arc<Frame>>) -> f64 {
    match (frames.front(), frames.back()) {
        (Some(oldest), Some(newest)) => newest.timestamp - oldest.timestamp,
        _ => 0.0,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
