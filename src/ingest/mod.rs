//! Frame ingestion.
//!
//! This module provides sources for frames and the loop that feeds them into
//! the rolling buffer:
//! - Synthetic source (`stub://`) for tests and demos
//! - `CaptureLoop`: paced capture on its own thread
//!
//! Sources stamp each frame at capture time from the shared `Clock` and own the
//! sequence counter. The capture loop is responsible for:
//! - Pacing to the target frame rate
//! - Appending to the buffer (never blocked by clip reads for longer than a copy)
//! - Dropping and counting out-of-order frames
//!
//! Sources MUST NOT:
//! - Store frames to disk
//! - Log frame payloads

pub mod synthetic;

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::ClipError;
use crate::frame::{Frame, RollingFrameBuffer};
use crate::Clock;

pub use synthetic::SyntheticSource;

/// Configuration for a frame source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Source URL. Only `stub://` is built in.
    pub url: String,
    /// Capture cadence. Informational for the buffer; used for pacing here.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://screen".to_string(),
            target_fps: 10,
            width: 320,
            height: 240,
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

/// Something that produces time-stamped frames at roughly fixed cadence.
pub trait FrameSource: Send {
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame, stamped with `clock.now()` at capture time.
    fn next_frame(&mut self, clock: &dyn Clock) -> Result<Frame>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Open the source named by `config.url`.
pub fn open_source(config: SourceConfig) -> Result<Box<dyn FrameSource>> {
    if config.url.starts_with("stub://") {
        Ok(Box::new(SyntheticSource::new(config)))
    } else {
        Err(anyhow!(
            "unsupported capture url '{}'; only stub:// sources are built in",
            config.url
        ))
    }
}

// ----------------------------------------------------------------------------
// CaptureLoop
// ----------------------------------------------------------------------------

/// Counters shared between the capture thread and its handle.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    appended: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureCounters {
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Continuous producer: source -> buffer.
pub struct CaptureLoop {
    source: Box<dyn FrameSource>,
    buffer: Arc<RollingFrameBuffer>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    counters: Arc<CaptureCounters>,
}

impl CaptureLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        buffer: Arc<RollingFrameBuffer>,
        clock: Arc<dyn Clock>,
        target_fps: u32,
    ) -> Self {
        let fps = target_fps.max(1);
        Self {
            source,
            buffer,
            clock,
            interval: Duration::from_secs_f64(1.0 / fps as f64),
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        self.counters.clone()
    }

    /// Capture one frame and append it.
    ///
    /// Returns `Ok(false)` when the frame was dropped as out of order.
    pub fn step(&mut self) -> Result<bool> {
        let frame = self.source.next_frame(self.clock.as_ref())?;
        match self.buffer.append(frame) {
            Ok(()) => {
                self.counters.appended.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(err @ ClipError::OutOfOrderFrame { .. }) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("capture: frame dropped: {}", err);
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run until `shutdown` is set. Source errors stall capture but never end it.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        self.source.connect()?;
        let mut last_health_log = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            if let Err(err) = self.step() {
                log::warn!("capture: source error: {}", err);
            }

            if last_health_log.elapsed() >= Duration::from_secs(5) {
                let stats = self.source.stats();
                let buffered = self.buffer.stats();
                log::info!(
                    "capture health={} frames={} dropped={} buffered={} ({:.2}s, ~{} KB) url={}",
                    self.source.is_healthy(),
                    stats.frames_captured,
                    self.counters.dropped(),
                    buffered.frame_count,
                    buffered.duration_secs,
                    buffered.memory_bytes / 1024,
                    stats.url
                );
                last_health_log = Instant::now();
            }

            if let Some(remaining) = self.interval.checked_sub(started.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
        Ok(())
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> Result<CaptureHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let counters = self.counters.clone();
        let join = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                if let Err(err) = self.run(shutdown_thread) {
                    log::error!("capture stopped: {}", err);
                }
            })?;
        Ok(CaptureHandle {
            shutdown,
            counters,
            join: Some(join),
        })
    }
}

#[derive(Debug)]
pub struct CaptureHandle {
    shutdown: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    join: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn frames_appended(&self) -> u64 {
        self.counters.appended()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.counters.dropped()
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("capture thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;

    struct FixedStampSource {
        stamps: Vec<f64>,
        next: usize,
    }

    impl FrameSource for FixedStampSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self, _clock: &dyn Clock) -> Result<Frame> {
            let t = *self
                .stamps
                .get(self.next)
                .ok_or_else(|| anyhow!("exhausted"))?;
            self.next += 1;
            Ok(Frame::new(t, self.next as u64, 1, 1, vec![0, 0, 0]))
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.next as u64,
                url: "fixed://".to_string(),
            }
        }
    }

    #[test]
    fn capture_step_drops_out_of_order_frames() -> Result<()> {
        let buffer = Arc::new(RollingFrameBuffer::new(20.0));
        let source = FixedStampSource {
            stamps: vec![1.0, 2.0, 1.5, 3.0],
            next: 0,
        };
        let mut capture = CaptureLoop::new(
            Box::new(source),
            buffer.clone(),
            Arc::new(ManualClock::new(0.0)),
            10,
        );

        assert!(capture.step()?);
        assert!(capture.step()?);
        assert!(!capture.step()?);
        assert!(capture.step()?);

        let counters = capture.counters();
        assert_eq!(counters.appended(), 3);
        assert_eq!(counters.dropped(), 1);
        assert_eq!(buffer.len(), 3);
        Ok(())
    }

    #[test]
    fn open_source_rejects_unknown_schemes() {
        let config = SourceConfig {
            url: "rtsp://camera".to_string(),
            ..SourceConfig::default()
        };
        assert!(open_source(config).is_err());
        assert!(open_source(SourceConfig::default()).is_ok());
    }

    #[test]
    fn spawned_capture_fills_buffer_and_stops() -> Result<()> {
        let buffer = Arc::new(RollingFrameBuffer::new(20.0));
        let source = open_source(SourceConfig {
            target_fps: 100,
            width: 4,
            height: 4,
            ..SourceConfig::default()
        })?;
        let handle = CaptureLoop::new(
            source,
            buffer.clone(),
            Arc::new(crate::MonotonicClock::new()),
            100,
        )
        .spawn()?;

        std::thread::sleep(Duration::from_millis(100));
        let appended = handle.frames_appended();
        handle.stop()?;

        assert!(appended > 0);
        assert!(!buffer.is_empty());
        Ok(())
    }
}
