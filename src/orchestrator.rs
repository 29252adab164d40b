//! Consumer loop.
//!
//! One cycle:
//! 1. Block until the gate allows a request (cancellable)
//! 2. Request the next clip; on "no frames" back off briefly and retry
//! 3. Hand the clip to the decision engine
//! 4. Dispatch the returned action and schedule its completion on the gate
//!
//! Decision-engine and dispatch failures end the cycle, not the loop. The
//! server's cursor is untouched by them; the next clip simply starts wherever
//! the last served clip ended.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::client::ClipClient;
use crate::error::ClipError;
use crate::gate::ActionTimingGate;
use crate::protocol::ClipSuccess;
use crate::server::ClipServer;

/// Where clips come from: a remote server or one in the same process.
pub trait ClipSource {
    fn request_clip(&mut self) -> Result<ClipSuccess, ClipError>;
}

impl ClipSource for ClipClient {
    fn request_clip(&mut self) -> Result<ClipSuccess, ClipError> {
        self.get_clip()
    }
}

/// In-process source backed directly by a `ClipServer`.
pub struct LocalClipSource {
    server: Arc<ClipServer>,
}

impl LocalClipSource {
    pub fn new(server: Arc<ClipServer>) -> Self {
        Self { server }
    }
}

impl ClipSource for LocalClipSource {
    fn request_clip(&mut self) -> Result<ClipSuccess, ClipError> {
        let now = self.server.now();
        self.server.handle_clip_request(now).map(ClipSuccess::from)
    }
}

/// An action chosen for a clip and how long it takes to play out.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub action: String,
    pub duration_secs: f64,
}

/// External decision maker: clip in, action out.
pub trait DecisionEngine {
    fn decide(&mut self, clip: &ClipSuccess) -> Result<Decision>;
}

/// External effector: carries out an action against the observed source.
pub trait ActionExecutor {
    fn execute(&mut self, decision: &Decision) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    Dispatched {
        start_timestamp: f64,
        end_timestamp: f64,
        frame_count: usize,
        action: String,
    },
    NoFrames,
    Failed(String),
}

pub struct Orchestrator<S, D, E> {
    source: S,
    engine: D,
    executor: E,
    gate: Arc<ActionTimingGate>,
    retry_interval: Duration,
}

impl<S, D, E> Orchestrator<S, D, E>
where
    S: ClipSource,
    D: DecisionEngine,
    E: ActionExecutor,
{
    pub fn new(
        source: S,
        engine: D,
        executor: E,
        gate: Arc<ActionTimingGate>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            source,
            engine,
            executor,
            gate,
            retry_interval,
        }
    }

    pub fn gate(&self) -> &Arc<ActionTimingGate> {
        &self.gate
    }

    /// Run one cycle. Only cancellation is returned as an error.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, ClipError> {
        self.gate.wait_until_ready()?;

        let clip = match self.source.request_clip() {
            Ok(clip) => clip,
            Err(ClipError::Cancelled) => return Err(ClipError::Cancelled),
            Err(err) if err.is_transient() => {
                log::debug!("orchestrator: {}; retrying in {:?}", err, self.retry_interval);
                self.gate.sleep(self.retry_interval)?;
                return Ok(CycleOutcome::NoFrames);
            }
            Err(err) => return Ok(CycleOutcome::Failed(err.to_string())),
        };

        let decision = match self.engine.decide(&clip) {
            Ok(decision) => decision,
            Err(err) => return Ok(CycleOutcome::Failed(format!("decision engine: {:#}", err))),
        };
        if !(decision.duration_secs.is_finite() && decision.duration_secs >= 0.0) {
            return Ok(CycleOutcome::Failed(format!(
                "decision engine returned invalid action duration {}",
                decision.duration_secs
            )));
        }
        if let Err(err) = self.executor.execute(&decision) {
            return Ok(CycleOutcome::Failed(format!("action dispatch: {:#}", err)));
        }
        self.gate.schedule_completion(decision.duration_secs);

        Ok(CycleOutcome::Dispatched {
            start_timestamp: clip.start_timestamp,
            end_timestamp: clip.end_timestamp,
            frame_count: clip.frame_count,
            action: decision.action,
        })
    }

    /// Loop until cancelled or `max_cycles` actions have been dispatched.
    ///
    /// Returns the number of dispatched actions.
    pub fn run(&mut self, max_cycles: Option<u64>) -> Result<u64> {
        let mut dispatched = 0u64;
        while max_cycles.map_or(true, |max| dispatched < max) {
            match self.run_cycle() {
                Ok(CycleOutcome::Dispatched {
                    start_timestamp,
                    end_timestamp,
                    frame_count,
                    action,
                }) => {
                    dispatched += 1;
                    log::info!(
                        "cycle {}: clip [{:.3}, {:.3}) {} frames -> {}",
                        dispatched,
                        start_timestamp,
                        end_timestamp,
                        frame_count,
                        action
                    );
                }
                Ok(CycleOutcome::NoFrames) => {}
                Ok(CycleOutcome::Failed(reason)) => {
                    log::warn!("cycle failed: {}", reason);
                    if self.gate.sleep(self.retry_interval).is_err() {
                        break;
                    }
                }
                Err(ClipError::Cancelled) => break,
                Err(err) => return Err(err.into()),
            }
        }
        log::info!("orchestrator stopped after {} actions", dispatched);
        Ok(dispatched)
    }
}

// ----------------------------------------------------------------------------
// Stub collaborators
// ----------------------------------------------------------------------------

/// Decision engine for demos: always picks the same action and reports capture
/// gaps it can infer from the clip metadata.
pub struct StubDecisionEngine {
    pub action: String,
    pub duration_secs: f64,
    /// Expected capture cadence, used to flag thin clips.
    pub expected_fps: f64,
}

impl DecisionEngine for StubDecisionEngine {
    fn decide(&mut self, clip: &ClipSuccess) -> Result<Decision> {
        if clip.gap_seconds > 0.0 {
            log::warn!(
                "clip [{:.3}, {:.3}) lost {:.3}s to buffer overrun",
                clip.start_timestamp,
                clip.end_timestamp,
                clip.gap_seconds
            );
        }
        if clip.duration > 0.0 && self.expected_fps > 0.0 {
            let fps = clip.frame_count as f64 / clip.duration;
            if fps < self.expected_fps * 0.5 {
                log::warn!(
                    "clip [{:.3}, {:.3}) is thin: {:.1} fps, expected ~{:.1}",
                    clip.start_timestamp,
                    clip.end_timestamp,
                    fps,
                    self.expected_fps
                );
            }
        }
        Ok(Decision {
            action: self.action.clone(),
            duration_secs: self.duration_secs,
        })
    }
}

/// Executor that only logs what it would do.
#[derive(Default)]
pub struct LoggingExecutor;

impl ActionExecutor for LoggingExecutor {
    fn execute(&mut self, decision: &Decision) -> Result<()> {
        log::info!(
            "dispatching '{}' (expected {:.2}s)",
            decision.action,
            decision.duration_secs
        );
        Ok(())
    }
}
