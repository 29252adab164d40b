//! clipd - frame capture + clip server
//!
//! This daemon:
//! 1. Captures frames from the configured source at a fixed cadence
//! 2. Keeps the most recent window of frames in a rolling buffer
//! 3. Serves contiguous clips and status over a line-delimited JSON socket

use anyhow::Result;
use std::sync::{mpsc, Arc};

use clip_relay::{
    api::{ApiConfig, ApiServer},
    clip::encoder_by_name,
    config::ClipdConfig,
    ingest::open_source,
    CaptureLoop, ClipAssembler, ClipServer, Clock, MonotonicClock, RollingFrameBuffer,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = ClipdConfig::load()?;
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let buffer = Arc::new(RollingFrameBuffer::new(cfg.window_secs));

    let source = open_source(cfg.capture.clone())?;
    let capture = CaptureLoop::new(
        source,
        buffer.clone(),
        clock.clone(),
        cfg.capture.target_fps,
    )
    .spawn()?;

    let assembler = ClipAssembler::new(encoder_by_name(&cfg.encoder)?);
    let server = Arc::new(ClipServer::new(
        buffer,
        assembler,
        clock,
        cfg.initial_window_secs,
    ));
    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
        },
        server,
    )
    .spawn()?;

    log::info!("clip api listening on {}", api_handle.addr);
    log::info!(
        "capturing {} at {} fps; window {:.1}s, first clip {:.1}s, encoder {}",
        cfg.capture.url,
        cfg.capture.target_fps,
        cfg.window_secs,
        cfg.initial_window_secs,
        cfg.encoder
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("clipd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    log::info!(
        "capture stopping: {} frames appended, {} dropped",
        capture.frames_appended(),
        capture.frames_dropped()
    );
    capture.stop()?;

    Ok(())
}
