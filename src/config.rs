use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use crate::frame::DEFAULT_WINDOW_SECS;
use crate::ingest::SourceConfig;
use crate::server::DEFAULT_INITIAL_WINDOW_SECS;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8765";
const DEFAULT_CAPTURE_URL: &str = "stub://screen";
const DEFAULT_CAPTURE_FPS: u32 = 10;
const DEFAULT_CAPTURE_WIDTH: u32 = 320;
const DEFAULT_CAPTURE_HEIGHT: u32 = 240;
const DEFAULT_ENCODER: &str = "stack";
/// Largest accepted capture width or height.
const MAX_CAPTURE_DIMENSION: u32 = 8192;

#[derive(Debug, Deserialize, Default)]
struct ClipdConfigFile {
    api: Option<ApiConfigFile>,
    buffer: Option<BufferConfigFile>,
    capture: Option<CaptureConfigFile>,
    clip: Option<ClipConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BufferConfigFile {
    window_secs: Option<f64>,
    initial_window_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ClipConfigFile {
    encoder: Option<String>,
}

/// Settings for the clip daemon.
#[derive(Debug, Clone)]
pub struct ClipdConfig {
    pub api_addr: String,
    /// Rolling window duration W.
    pub window_secs: f64,
    /// Look-back for the first clip of a session.
    pub initial_window_secs: f64,
    pub capture: SourceConfig,
    pub encoder: String,
}

impl ClipdConfig {
    /// Defaults, then `CLIPD_CONFIG` (JSON file), then `CLIPD_*` env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CLIPD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ClipdConfigFile) -> Self {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let window_secs = file
            .buffer
            .as_ref()
            .and_then(|buffer| buffer.window_secs)
            .unwrap_or(DEFAULT_WINDOW_SECS);
        let initial_window_secs = file
            .buffer
            .as_ref()
            .and_then(|buffer| buffer.initial_window_secs)
            .unwrap_or(DEFAULT_INITIAL_WINDOW_SECS);
        let capture = SourceConfig {
            url: file
                .capture
                .as_ref()
                .and_then(|capture| capture.url.clone())
                .unwrap_or_else(|| DEFAULT_CAPTURE_URL.to_string()),
            target_fps: file
                .capture
                .as_ref()
                .and_then(|capture| capture.target_fps)
                .unwrap_or(DEFAULT_CAPTURE_FPS),
            width: file
                .capture
                .as_ref()
                .and_then(|capture| capture.width)
                .unwrap_or(DEFAULT_CAPTURE_WIDTH),
            height: file
                .capture
                .as_ref()
                .and_then(|capture| capture.height)
                .unwrap_or(DEFAULT_CAPTURE_HEIGHT),
        };
        let encoder = file
            .clip
            .and_then(|clip| clip.encoder)
            .unwrap_or_else(|| DEFAULT_ENCODER.to_string());
        Self {
            api_addr,
            window_secs,
            initial_window_secs,
            capture,
            encoder,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("CLIPD_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(url) = std::env::var("CLIPD_CAPTURE_URL") {
            if !url.trim().is_empty() {
                self.capture.url = url;
            }
        }
        if let Ok(encoder) = std::env::var("CLIPD_ENCODER") {
            if !encoder.trim().is_empty() {
                self.encoder = encoder.trim().to_string();
            }
        }
        if let Ok(window) = std::env::var("CLIPD_WINDOW_SECS") {
            self.window_secs = window
                .trim()
                .parse()
                .map_err(|_| anyhow!("CLIPD_WINDOW_SECS must be a number of seconds"))?;
        }
        if let Ok(initial) = std::env::var("CLIPD_INITIAL_WINDOW_SECS") {
            self.initial_window_secs = initial
                .trim()
                .parse()
                .map_err(|_| anyhow!("CLIPD_INITIAL_WINDOW_SECS must be a number of seconds"))?;
        }
        if let Ok(fps) = std::env::var("CLIPD_TARGET_FPS") {
            self.capture.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("CLIPD_TARGET_FPS must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(self.window_secs.is_finite() && self.window_secs > 0.0) {
            return Err(anyhow!("window_secs must be greater than zero"));
        }
        if !(self.initial_window_secs > 0.0 && self.initial_window_secs < self.window_secs) {
            return Err(anyhow!(
                "initial_window_secs must be greater than zero and smaller than window_secs ({})",
                self.window_secs
            ));
        }
        if self.capture.target_fps == 0 {
            return Err(anyhow!("capture target_fps must be greater than zero"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if self.capture.width > MAX_CAPTURE_DIMENSION || self.capture.height > MAX_CAPTURE_DIMENSION {
            return Err(anyhow!(
                "capture width and height must be at most {} (got {}x{})",
                MAX_CAPTURE_DIMENSION,
                self.capture.width,
                self.capture.height
            ));
        }
        crate::clip::encoder_by_name(&self.encoder)?;
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ClipdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
