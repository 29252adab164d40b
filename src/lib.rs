//! Clip Relay
//!
//! A producer keeps a rolling window of captured frames in memory and serves
//! contiguous clips on demand; a consumer asks for "everything since the last
//! clip" whenever its decision loop is ready for more.
//!
//! # Architecture
//!
//! The service holds three guarantees by construction:
//!
//! 1. **Bounded memory**: the buffer never holds more than the configured window.
//! 2. **Continuity**: consecutive successful clips share their boundary timestamp,
//!    with no gap and no overlap on the requested timeline.
//! 3. **Gated requests**: the consumer never asks for a clip before the effect of
//!    its last action is presumed visible.
//!
//! # Module Structure
//!
//! - `frame`: Frames and the rolling buffer
//! - `ingest`: Frame sources and the capture loop
//! - `clip`: Clip encoders and the assembler
//! - `server`: Clip cursor and request handling
//! - `api` / `protocol`: Wire transport and message shapes
//! - `client`, `gate`, `orchestrator`: Consumer side

use std::sync::Mutex;
use std::time::Instant;

pub mod api;
pub mod client;
pub mod clip;
pub mod config;
pub mod error;
pub mod frame;
pub mod gate;
pub mod ingest;
pub mod orchestrator;
pub mod protocol;
pub mod server;

pub use client::{BackoffPolicy, ClipClient};
pub use clip::{ClipAssembler, ClipEncoder, EncodedClip, FrameStackEncoder};
pub use error::ClipError;
pub use frame::{Frame, RangeRead, RollingFrameBuffer, DEFAULT_WINDOW_SECS};
pub use gate::{ActionTimingGate, GateState};
pub use ingest::{CaptureHandle, CaptureLoop, FrameSource, SourceConfig, SyntheticSource};
pub use orchestrator::{
    ActionExecutor, ClipSource, CycleOutcome, Decision, DecisionEngine, Orchestrator,
};
pub use protocol::{ClipReply, ClipSuccess, Request, StatusReply};
pub use server::{ClipServer, DEFAULT_INITIAL_WINDOW_SECS};

// -------------------- Clocks --------------------

/// Source of monotonic time in seconds.
///
/// Every timestamp in the crate (frame capture, clip bounds, action completion)
/// is read from a `Clock` so tests can drive time by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Seconds elapsed since the clock was created.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock for tests and replay.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, t: f64) {
        if let Ok(mut now) = self.now.lock() {
            *now = t;
        }
    }

    pub fn advance(&self, secs: f64) {
        if let Ok(mut now) = self.now.lock() {
            *now += secs;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.now.lock().map(|now| *now).unwrap_or(0.0)
    }
}
