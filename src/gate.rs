//! Consumer-side request gate.
//!
//! The gate decides whether enough time has passed since the last action
//! completed for its effect to be visible in the next clip. Completion arrives
//! asynchronously: either from the timer started by `schedule_completion` or
//! from an explicit `record_completion` callback. A newer schedule supersedes
//! any pending one; stale timers wake up, see a newer generation, and exit.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::ClipError;
use crate::Clock;

/// Upper bound on a single condvar wait, so clock jumps are noticed promptly.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);
const MIN_WAIT_SLICE: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    Idle,
    ActionInFlight,
}

#[derive(Debug)]
struct TimingState {
    last_action_complete_time: Option<f64>,
    state: GateState,
    /// Bumped on every dispatched action; completions for older values are ignored.
    generation: u64,
    cancelled: bool,
}

pub struct ActionTimingGate {
    action_delay_secs: f64,
    clock: Arc<dyn Clock>,
    timing: Mutex<TimingState>,
    changed: Condvar,
}

impl ActionTimingGate {
    pub fn new(action_delay_secs: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            action_delay_secs,
            clock,
            timing: Mutex::new(TimingState {
                last_action_complete_time: None,
                state: GateState::Idle,
                generation: 0,
                cancelled: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimingState> {
        self.timing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn action_delay_secs(&self) -> f64 {
        self.action_delay_secs
    }

    pub fn state(&self) -> GateState {
        self.lock().state
    }

    pub fn last_action_complete_time(&self) -> Option<f64> {
        self.lock().last_action_complete_time
    }

    /// True before any action has ever completed; afterwards true once
    /// `action_delay_secs` have elapsed since the last completion.
    pub fn may_request_now(&self, now: f64) -> bool {
        ready(&self.lock(), now, self.action_delay_secs)
    }

    /// Mark a new action as dispatched. Supersedes any pending completion.
    pub fn begin_action(&self) -> u64 {
        let mut timing = self.lock();
        timing.generation += 1;
        if timing.state == GateState::ActionInFlight {
            log::debug!(
                "gate: action {} supersedes a pending completion",
                timing.generation
            );
        }
        timing.state = GateState::ActionInFlight;
        let generation = timing.generation;
        drop(timing);
        self.changed.notify_all();
        generation
    }

    /// Dispatch bookkeeping plus a completion timer of `action_duration_secs`.
    ///
    /// When the timer fires it records `clock.now()` as the completion time,
    /// unless a newer action has been dispatched in the meantime.
    pub fn schedule_completion(self: &Arc<Self>, action_duration_secs: f64) -> u64 {
        let generation = self.begin_action();
        let gate = Arc::clone(self);
        let duration = secs_to_duration(action_duration_secs);
        std::thread::spawn(move || gate.run_timer(generation, duration));
        generation
    }

    fn run_timer(&self, generation: u64, duration: Duration) {
        // No deadline means the action never completes on its own; only a
        // newer action or cancellation ends the wait.
        let deadline = Instant::now().checked_add(duration);
        let mut timing = self.lock();
        loop {
            if timing.cancelled || timing.generation != generation {
                return;
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    deadline - now
                }
                None => MAX_WAIT_SLICE,
            };
            timing = self
                .changed
                .wait_timeout(timing, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let fired_at = self.clock.now();
        drop(timing);
        self.complete(generation, fired_at);
    }

    /// Explicit completion callback for the action currently in flight.
    ///
    /// Returns false when no action is in flight.
    pub fn record_completion(&self, now: f64) -> bool {
        let generation = self.lock().generation;
        self.complete(generation, now)
    }

    fn complete(&self, generation: u64, now: f64) -> bool {
        let mut timing = self.lock();
        if timing.state != GateState::ActionInFlight || timing.generation != generation {
            return false;
        }
        timing.state = GateState::Idle;
        timing.last_action_complete_time = Some(now);
        drop(timing);
        log::debug!("gate: action {} completed at {:.3}", generation, now);
        self.changed.notify_all();
        true
    }

    /// Block until no action is in flight and `may_request_now` holds.
    ///
    /// Returns `Err(Cancelled)` as soon as `cancel` is called.
    pub fn wait_until_ready(&self) -> Result<(), ClipError> {
        let mut timing = self.lock();
        loop {
            if timing.cancelled {
                return Err(ClipError::Cancelled);
            }
            let now = self.clock.now();
            if timing.state == GateState::Idle && ready(&timing, now, self.action_delay_secs) {
                return Ok(());
            }
            let wait = match (timing.state, timing.last_action_complete_time) {
                (GateState::Idle, Some(done)) => {
                    let remaining = self.action_delay_secs - (now - done);
                    secs_to_duration(remaining).clamp(MIN_WAIT_SLICE, MAX_WAIT_SLICE)
                }
                _ => MAX_WAIT_SLICE,
            };
            timing = self
                .changed
                .wait_timeout(timing, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub fn sleep(&self, duration: Duration) -> Result<(), ClipError> {
        let deadline = Instant::now().checked_add(duration);
        let mut timing = self.lock();
        loop {
            if timing.cancelled {
                return Err(ClipError::Cancelled);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    deadline - now
                }
                None => MAX_WAIT_SLICE,
            };
            timing = self
                .changed
                .wait_timeout(timing, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wake every waiter and make all future waits fail fast.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }
}

/// Seconds to a `Duration`. NaN and negatives become zero; values too large to
/// represent saturate to `Duration::MAX`.
fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

fn ready(timing: &TimingState, now: f64, delay: f64) -> bool {
    match timing.last_action_complete_time {
        None => true,
        Some(done) => now - done >= delay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, MonotonicClock};

    #[test]
    fn first_request_is_never_gated() {
        let gate = ActionTimingGate::new(0.5, Arc::new(ManualClock::new(0.0)));
        assert!(gate.may_request_now(0.0));
        assert_eq!(gate.state(), GateState::Idle);
        assert!(gate.wait_until_ready().is_ok());
    }

    #[test]
    fn gate_closes_on_completion_and_reopens_after_delay() {
        let gate = ActionTimingGate::new(0.5, Arc::new(ManualClock::new(0.0)));
        gate.begin_action();
        assert_eq!(gate.state(), GateState::ActionInFlight);

        assert!(gate.record_completion(7.3));
        assert_eq!(gate.state(), GateState::Idle);
        assert!(!gate.may_request_now(7.3));
        assert!(!gate.may_request_now(7.5));
        assert!(gate.may_request_now(7.9));
    }

    #[test]
    fn completion_without_action_in_flight_is_ignored() {
        let gate = ActionTimingGate::new(0.5, Arc::new(ManualClock::new(0.0)));
        assert!(!gate.record_completion(1.0));
        assert_eq!(gate.last_action_complete_time(), None);

        gate.begin_action();
        assert!(gate.record_completion(2.0));
        assert!(!gate.record_completion(3.0));
        assert_eq!(gate.last_action_complete_time(), Some(2.0));
    }

    #[test]
    fn timer_records_completion() {
        let gate = Arc::new(ActionTimingGate::new(0.0, Arc::new(MonotonicClock::new())));
        gate.schedule_completion(0.05);
        assert_eq!(gate.state(), GateState::ActionInFlight);

        gate.wait_until_ready().unwrap();
        assert_eq!(gate.state(), GateState::Idle);
        assert!(gate.last_action_complete_time().unwrap() >= 0.05);
    }

    #[test]
    fn newer_schedule_supersedes_pending_one() {
        let clock = Arc::new(MonotonicClock::new());
        let gate = Arc::new(ActionTimingGate::new(0.0, clock.clone()));
        gate.schedule_completion(0.05);
        gate.schedule_completion(0.3);

        std::thread::sleep(Duration::from_millis(150));
        // The short timer was superseded; the action is still in flight.
        assert_eq!(gate.state(), GateState::ActionInFlight);
        assert_eq!(gate.last_action_complete_time(), None);

        gate.wait_until_ready().unwrap();
        assert!(gate.last_action_complete_time().unwrap() >= 0.3);
    }

    #[test]
    fn cancel_unblocks_waiters() {
        let gate = Arc::new(ActionTimingGate::new(60.0, Arc::new(MonotonicClock::new())));
        gate.begin_action();
        gate.record_completion(0.0);

        let waiter = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.wait_until_ready())
        };
        std::thread::sleep(Duration::from_millis(50));
        gate.cancel();

        assert_eq!(waiter.join().unwrap(), Err(ClipError::Cancelled));
        assert_eq!(gate.sleep(Duration::from_secs(60)), Err(ClipError::Cancelled));
    }

    #[test]
    fn cancel_stops_pending_timer() {
        let gate = Arc::new(ActionTimingGate::new(0.0, Arc::new(MonotonicClock::new())));
        gate.schedule_completion(0.05);
        gate.cancel();
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(gate.last_action_complete_time(), None);
    }

    #[test]
    fn secs_to_duration_saturates() {
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(-3.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::INFINITY), Duration::MAX);
        assert_eq!(secs_to_duration(1e20), Duration::MAX);
        assert_eq!(secs_to_duration(0.25), Duration::from_millis(250));
    }

    #[test]
    fn infinite_delay_waits_until_cancelled() {
        let gate = Arc::new(ActionTimingGate::new(
            f64::INFINITY,
            Arc::new(ManualClock::new(0.0)),
        ));
        gate.begin_action();
        assert!(gate.record_completion(0.0));
        assert!(!gate.may_request_now(1e9));

        let waiter = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.wait_until_ready())
        };
        std::thread::sleep(Duration::from_millis(150));
        gate.cancel();
        assert_eq!(waiter.join().unwrap(), Err(ClipError::Cancelled));
    }

    #[test]
    fn oversized_action_duration_does_not_panic() {
        let gate = Arc::new(ActionTimingGate::new(0.0, Arc::new(MonotonicClock::new())));
        gate.schedule_completion(1e20);
        gate.schedule_completion(f64::INFINITY);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(gate.state(), GateState::ActionInFlight);

        // A newer, short action supersedes the unbounded ones.
        gate.schedule_completion(0.02);
        gate.wait_until_ready().unwrap();
        assert_eq!(gate.state(), GateState::Idle);

        let sleeper = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.sleep(Duration::MAX))
        };
        std::thread::sleep(Duration::from_millis(50));
        gate.cancel();
        assert_eq!(sleeper.join().unwrap(), Err(ClipError::Cancelled));
    }
}
