//! Clip server: owns the "last clip end" cursor.
//!
//! Every clip request runs as one critical section around the cursor, so two
//! concurrent requests can never both claim the window after the same
//! `last_clip_end`. The buffer lock is only taken inside `read_range`; encoding
//! happens with the buffer unlocked.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clip::{ClipAssembler, EncodedClip};
use crate::error::ClipError;
use crate::frame::RollingFrameBuffer;
use crate::protocol::{ClipReply, Request, StatusReply};
use crate::Clock;

/// Default look-back for the very first clip of a session.
pub const DEFAULT_INITIAL_WINDOW_SECS: f64 = 5.0;

/// A clip handed out by the server, plus how much of its head was lost to overrun.
#[derive(Debug, Clone)]
pub struct ServedClip {
    pub clip: EncodedClip,
    pub achieved_start: f64,
    pub gap_seconds: f64,
}

pub struct ClipServer {
    buffer: Arc<RollingFrameBuffer>,
    assembler: ClipAssembler,
    clock: Arc<dyn Clock>,
    /// `None` until the first clip has been served. Never rolled back.
    last_clip_end: Mutex<Option<f64>>,
    initial_window_secs: f64,
    started_at: f64,
}

impl ClipServer {
    pub fn new(
        buffer: Arc<RollingFrameBuffer>,
        assembler: ClipAssembler,
        clock: Arc<dyn Clock>,
        initial_window_secs: f64,
    ) -> Self {
        let started_at = clock.now();
        Self {
            buffer,
            assembler,
            clock,
            last_clip_end: Mutex::new(None),
            initial_window_secs,
            started_at,
        }
    }

    fn cursor(&self) -> MutexGuard<'_, Option<f64>> {
        self.last_clip_end
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn last_clip_end(&self) -> Option<f64> {
        *self.cursor()
    }

    pub fn buffer(&self) -> &Arc<RollingFrameBuffer> {
        &self.buffer
    }

    /// Serve the clip `[last_clip_end, now)`, or `[now - initial_window, now)` first time.
    ///
    /// On `NoFramesAvailable` (or any assembler failure) the cursor stays put so the
    /// next request retries the same start. On success the cursor moves to `now`
    /// even when the buffer could only supply a later start.
    pub fn handle_clip_request(&self, now: f64) -> Result<ServedClip, ClipError> {
        let mut cursor = self.cursor();
        let start = cursor.unwrap_or(now - self.initial_window_secs);
        let end = now;

        let read = self.buffer.read_range(start, end);
        if read.is_empty() {
            log::debug!(
                "clip [{:.3}, {:.3}) requested: no frames available",
                start,
                end
            );
            return Err(ClipError::NoFramesAvailable);
        }
        if read.is_overrun() {
            log::warn!(
                "clip [{:.3}, {:.3}) overran the buffer: first frame at {:.3} ({:.3}s lost)",
                start,
                end,
                read.achieved_start,
                read.gap_seconds()
            );
        }

        let clip = self.assembler.assemble(&read.frames, start, end)?;
        *cursor = Some(end);
        log::debug!(
            "clip [{:.3}, {:.3}) served: {} frames, {} bytes",
            start,
            end,
            clip.frame_count,
            clip.blob.len()
        );
        Ok(ServedClip {
            clip,
            achieved_start: read.achieved_start,
            gap_seconds: read.gap_seconds(),
        })
    }

    /// Read-only status snapshot.
    pub fn handle_status_request(&self, now: f64) -> StatusReply {
        let stats = self.buffer.stats();
        StatusReply {
            running: true,
            buffered_frame_count: stats.frame_count,
            buffered_duration_seconds: stats.duration_secs,
            last_clip_end: self.last_clip_end(),
            uptime: (now - self.started_at).max(0.0),
        }
    }

    /// Answer one raw request line with one JSON reply.
    pub fn respond(&self, raw: &[u8]) -> serde_json::Result<String> {
        let request = match serde_json::from_slice::<Request>(raw) {
            Ok(request) => request,
            Err(err) => {
                let reply = ClipReply::failure(&ClipError::Protocol(format!(
                    "invalid request: {}",
                    err
                )));
                return serde_json::to_string(&reply);
            }
        };
        let now = self.clock.now();
        match request {
            Request::GetClip => serde_json::to_string(&ClipReply::from(self.handle_clip_request(now))),
            Request::Status => serde_json::to_string(&self.handle_status_request(now)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::ManualClock;

    const FPS: f64 = 10.0;

    struct Fixture {
        clock: Arc<ManualClock>,
        buffer: Arc<RollingFrameBuffer>,
        server: ClipServer,
        next_seq: u64,
        next_t: f64,
    }

    impl Fixture {
        fn new(window: f64, initial: f64) -> Self {
            let clock = Arc::new(ManualClock::new(0.0));
            let buffer = Arc::new(RollingFrameBuffer::new(window));
            let server = ClipServer::new(
                buffer.clone(),
                ClipAssembler::default(),
                clock.clone(),
                initial,
            );
            Self {
                clock,
                buffer,
                server,
                next_seq: 0,
                next_t: 0.0,
            }
        }

        /// Capture at FPS up to (but excluding) `until`, then set the clock there.
        fn capture_until(&mut self, until: f64) {
            while self.next_t < until - 1e-9 {
                let frame = Frame::new(self.next_t, self.next_seq, 1, 1, vec![0, 0, 0]);
                self.buffer.append(frame).unwrap();
                self.next_seq += 1;
                self.next_t = self.next_seq as f64 / FPS;
            }
            self.clock.set(until);
        }
    }

    #[test]
    fn first_request_uses_initial_window() {
        let mut fx = Fixture::new(20.0, 5.0);
        fx.capture_until(12.0);

        let served = fx.server.handle_clip_request(12.0).unwrap();
        assert_eq!(served.clip.start_timestamp, 7.0);
        assert_eq!(served.clip.end_timestamp, 12.0);
        assert_eq!(served.gap_seconds, 0.0);
        assert_eq!(fx.server.last_clip_end(), Some(12.0));
    }

    #[test]
    fn consecutive_clips_are_contiguous() {
        let mut fx = Fixture::new(20.0, 5.0);
        let mut prev_end = None;
        for now in [5.0, 5.3, 7.9, 9.0, 12.5] {
            fx.capture_until(now);
            let served = fx.server.handle_clip_request(now).unwrap();
            if let Some(end) = prev_end {
                assert_eq!(served.clip.start_timestamp, end);
            }
            prev_end = Some(served.clip.end_timestamp);
        }
    }

    #[test]
    fn no_frames_does_not_advance_cursor() {
        let mut fx = Fixture::new(20.0, 5.0);
        fx.capture_until(5.0);
        fx.server.handle_clip_request(5.0).unwrap();

        // No new capture since 5.0 -> nothing in [5.0, 5.05)
        let err = fx.server.handle_clip_request(5.05).unwrap_err();
        assert_eq!(err, ClipError::NoFramesAvailable);
        assert_eq!(fx.server.last_clip_end(), Some(5.0));

        let err = fx.server.handle_clip_request(5.05).unwrap_err();
        assert_eq!(err, ClipError::NoFramesAvailable);

        fx.capture_until(6.0);
        let served = fx.server.handle_clip_request(6.0).unwrap();
        assert_eq!(served.clip.start_timestamp, 5.0);
    }

    #[test]
    fn empty_buffer_on_first_request_keeps_cursor_unset() {
        let fx = Fixture::new(20.0, 5.0);
        assert_eq!(
            fx.server.handle_clip_request(3.0).unwrap_err(),
            ClipError::NoFramesAvailable
        );
        assert_eq!(fx.server.last_clip_end(), None);
    }

    #[test]
    fn overrun_advances_cursor_to_wall_clock_end() {
        let mut fx = Fixture::new(2.0, 1.0);
        fx.capture_until(1.0);
        fx.server.handle_clip_request(1.0).unwrap();

        // Consumer goes quiet for longer than the window
        fx.capture_until(10.0);
        let served = fx.server.handle_clip_request(10.0).unwrap();
        assert_eq!(served.clip.start_timestamp, 1.0);
        assert!(served.achieved_start > 7.0);
        assert!(served.gap_seconds > 6.0);
        assert_eq!(fx.server.last_clip_end(), Some(10.0));
    }

    #[test]
    fn status_is_read_only() {
        let mut fx = Fixture::new(20.0, 5.0);
        fx.capture_until(3.0);
        let status = fx.server.handle_status_request(3.0);
        assert!(status.running);
        assert_eq!(status.buffered_frame_count, 30);
        assert!((status.buffered_duration_seconds - 2.9).abs() < 1e-9);
        assert_eq!(status.last_clip_end, None);
        assert_eq!(status.uptime, 3.0);
        assert_eq!(fx.server.last_clip_end(), None);
    }

    #[test]
    fn respond_handles_wire_requests() {
        let mut fx = Fixture::new(20.0, 5.0);
        fx.capture_until(5.0);

        let raw = fx.server.respond(br#"{"type": "get_clip"}"#).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["frame_count"], 50);
        assert_eq!(value["start_timestamp"], 0.0);
        assert_eq!(value["end_timestamp"], 5.0);

        let raw = fx.server.respond(br#"{"type": "status"}"#).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["last_clip_end"], 5.0);

        let raw = fx.server.respond(b"not json").unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["success"], false);
        assert!(value["error"].as_str().unwrap().starts_with("protocol error"));
    }

    #[test]
    fn concurrent_requests_never_share_a_window() {
        let mut fx = Fixture::new(20.0, 5.0);
        fx.capture_until(10.0);
        fx.server.handle_clip_request(5.0).unwrap();

        let server = Arc::new(fx.server);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let server = server.clone();
                std::thread::spawn(move || server.handle_clip_request(5.5 + i as f64 * 0.5))
            })
            .collect();
        let mut starts: Vec<f64> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap().ok())
            .map(|served| served.clip.start_timestamp)
            .collect();
        starts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let before = starts.len();
        starts.dedup();
        assert_eq!(starts.len(), before, "two requests claimed the same start");
    }
}
