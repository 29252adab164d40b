//! clip_orchestrator - gated consumer loop
//!
//! Repeatedly:
//! 1. Waits until the last action's effect should be visible
//! 2. Fetches the next contiguous clip from clipd
//! 3. Asks the decision engine for an action and dispatches it

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clip_relay::{
    orchestrator::{LoggingExecutor, StubDecisionEngine},
    ActionTimingGate, BackoffPolicy, ClipClient, MonotonicClock, Orchestrator,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Gated clip consumer loop")]
struct Args {
    /// clipd address.
    #[arg(long, env = "CLIP_SERVER_ADDR", default_value = "127.0.0.1:8765")]
    server_addr: String,

    /// Seconds to wait after an action completes before requesting the next clip.
    #[arg(long, env = "CLIP_ACTION_DELAY_SECS", default_value_t = 0.5)]
    action_delay_secs: f64,

    /// Back-off after "no frames available" or a failed cycle.
    #[arg(long, env = "CLIP_RETRY_INTERVAL_MS", default_value_t = 250)]
    retry_interval_ms: u64,

    /// Upper bound for reconnect back-off.
    #[arg(long, env = "CLIP_MAX_BACKOFF_SECS", default_value_t = 10)]
    max_backoff_secs: u64,

    /// Stop after this many dispatched actions.
    #[arg(long)]
    max_cycles: Option<u64>,

    /// Action the stub decision engine returns.
    #[arg(long, default_value = "observe")]
    action: String,

    /// Duration the stub action takes to play out.
    #[arg(long, default_value_t = 1.0)]
    action_duration_secs: f64,

    /// Expected capture cadence, used to flag thin clips.
    #[arg(long, default_value_t = 10.0)]
    expected_fps: f64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if !(args.action_delay_secs.is_finite() && args.action_delay_secs >= 0.0) {
        return Err(anyhow!(
            "--action-delay-secs must be a finite number of seconds >= 0 (got {})",
            args.action_delay_secs
        ));
    }
    if !(args.action_duration_secs.is_finite() && args.action_duration_secs >= 0.0) {
        return Err(anyhow!(
            "--action-duration-secs must be a finite number of seconds >= 0 (got {})",
            args.action_duration_secs
        ));
    }

    let client = ClipClient::new(
        args.server_addr.clone(),
        BackoffPolicy {
            max: Duration::from_secs(args.max_backoff_secs.max(1)),
            ..BackoffPolicy::default()
        },
    );
    let client_cancel = client.cancel_token();
    let gate = Arc::new(ActionTimingGate::new(
        args.action_delay_secs,
        Arc::new(MonotonicClock::new()),
    ));

    let handler_gate = gate.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, stopping orchestrator...");
        client_cancel.store(true, Ordering::SeqCst);
        handler_gate.cancel();
    })?;

    let engine = StubDecisionEngine {
        action: args.action.clone(),
        duration_secs: args.action_duration_secs,
        expected_fps: args.expected_fps,
    };
    let mut orchestrator = Orchestrator::new(
        client,
        engine,
        LoggingExecutor,
        gate,
        Duration::from_millis(args.retry_interval_ms),
    );

    log::info!(
        "orchestrator requesting clips from {} (action delay {:.2}s)",
        args.server_addr,
        args.action_delay_secs
    );
    orchestrator.run(args.max_cycles)?;
    Ok(())
}
