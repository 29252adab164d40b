//! Consumer-side connection to the clip server.
//!
//! One persistent connection, re-established on failure with capped
//! exponential backoff. Retries are unlimited by default; every backoff sleep
//! observes the cancel flag so shutdown never waits out a delay.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ClipError;
use crate::protocol::{ClipReply, ClipSuccess, Request, StatusReply};

const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(20));
        self.initial.saturating_mul(factor).min(self.max)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn open(addr: &str, io_timeout: Duration) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    fn exchange(&mut self, line: &str) -> Result<String, ExchangeError> {
        self.send(line).map_err(ExchangeError::Send)?;
        let mut reply = String::new();
        match self.reader.read_line(&mut reply) {
            Ok(0) => Err(ExchangeError::Receive(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "server closed the connection",
            ))),
            Ok(_) => Ok(reply),
            Err(err) => Err(ExchangeError::Receive(err)),
        }
    }

    fn send(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Which half of a request/reply exchange failed.
#[derive(Debug)]
enum ExchangeError {
    /// Connecting or writing failed; the server never saw the request.
    Send(std::io::Error),
    /// The request was written but no reply arrived.
    Receive(std::io::Error),
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeError::Send(err) => write!(f, "send failed: {}", err),
            ExchangeError::Receive(err) => write!(f, "no reply: {}", err),
        }
    }
}

pub struct ClipClient {
    addr: String,
    backoff: BackoffPolicy,
    io_timeout: Duration,
    cancel: Arc<AtomicBool>,
    conn: Option<Connection>,
}

impl ClipClient {
    pub fn new(addr: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            addr: addr.into(),
            backoff,
            io_timeout: Duration::from_secs(30),
            cancel: Arc::new(AtomicBool::new(false)),
            conn: None,
        }
    }

    /// Reply timeout; clip encoding on the server counts against it.
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Flag that aborts reconnect loops when set.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Fetch the next clip.
    ///
    /// A request that was sent but never answered is not resent: the server may
    /// have served it and moved its cursor, so the failure is reported as
    /// `ReplyLost` and the next call starts from wherever the cursor is.
    pub fn get_clip(&mut self) -> Result<ClipSuccess, ClipError> {
        let raw = self.call(Request::GetClip, false)?;
        let reply: ClipReply = serde_json::from_str(&raw)
            .map_err(|e| ClipError::Protocol(format!("invalid clip reply: {}", e)))?;
        reply.into_result()
    }

    pub fn status(&mut self) -> Result<StatusReply, ClipError> {
        let raw = self.call(Request::Status, true)?;
        serde_json::from_str(&raw)
            .map_err(|e| ClipError::Protocol(format!("invalid status reply: {}", e)))
    }

    /// Send `request`, reconnecting with backoff. With `resend_unanswered` unset,
    /// a request that was written but not answered fails with `ReplyLost`.
    fn call(&mut self, request: Request, resend_unanswered: bool) -> Result<String, ClipError> {
        let line = serde_json::to_string(&request)
            .map_err(|e| ClipError::Protocol(e.to_string()))?;
        let mut failures = 0u32;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(ClipError::Cancelled);
            }
            match self.try_exchange(&line) {
                Ok(reply) => return Ok(reply),
                Err(ExchangeError::Receive(err)) if !resend_unanswered => {
                    self.conn = None;
                    log::warn!(
                        "clip client: reply from {} lost ({}); the span it covered may be skipped",
                        self.addr,
                        err
                    );
                    return Err(ClipError::ReplyLost(err.to_string()));
                }
                Err(err) => {
                    self.conn = None;
                    failures += 1;
                    if self.backoff.exhausted(failures) {
                        return Err(ClipError::Connection(format!(
                            "{} unreachable after {} attempts: {}",
                            self.addr, failures, err
                        )));
                    }
                    let delay = self.backoff.delay(failures - 1);
                    log::warn!(
                        "clip client: {} ({}); reconnecting in {:?}",
                        self.addr,
                        err,
                        delay
                    );
                    self.sleep(delay)?;
                }
            }
        }
    }

    fn try_exchange(&mut self, line: &str) -> Result<String, ExchangeError> {
        if self.conn.is_none() {
            let conn = Connection::open(&self.addr, self.io_timeout).map_err(ExchangeError::Send)?;
            log::info!("clip client: connected to {}", self.addr);
            self.conn = Some(conn);
        }
        match self.conn.as_mut() {
            Some(conn) => conn.exchange(line),
            None => Err(ExchangeError::Send(std::io::Error::new(
                ErrorKind::NotConnected,
                "not connected",
            ))),
        }
    }

    fn sleep(&self, duration: Duration) -> Result<(), ClipError> {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(ClipError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(2),
            max_attempts: None,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(30), Duration::from_secs(2));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut client = ClipClient::new(
            addr.to_string(),
            BackoffPolicy {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                max_attempts: Some(3),
            },
        );
        let err = client.status().unwrap_err();
        assert!(matches!(err, ClipError::Connection(_)));
        assert!(!client.is_connected());
    }

    /// Accepts one connection, reads one request line, and hangs up without answering.
    fn spawn_silent_server() -> (std::net::SocketAddr, std::thread::JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = std::thread::spawn(move || {
            let mut requests = 0;
            listener.set_nonblocking(true).unwrap();
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                match listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        let mut line = String::new();
                        if BufReader::new(stream).read_line(&mut line).unwrap_or(0) > 0 {
                            requests += 1;
                        }
                    }
                    Err(_) => std::thread::sleep(Duration::from_millis(10)),
                }
            }
            requests
        });
        (addr, join)
    }

    #[test]
    fn unanswered_clip_request_is_not_resent() {
        let (addr, server) = spawn_silent_server();
        let mut client = ClipClient::new(
            addr.to_string(),
            BackoffPolicy {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                max_attempts: Some(5),
            },
        );

        let err = client.get_clip().unwrap_err();
        assert!(matches!(err, ClipError::ReplyLost(_)));
        assert!(!err.is_transient());
        assert!(!client.is_connected());
        assert_eq!(server.join().unwrap(), 1);
    }

    #[test]
    fn cancel_interrupts_reconnect_loop() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut client = ClipClient::new(
            addr.to_string(),
            BackoffPolicy {
                initial: Duration::from_secs(30),
                max: Duration::from_secs(30),
                max_attempts: None,
            },
        );
        let cancel = client.cancel_token();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            cancel.store(true, Ordering::SeqCst);
        });

        let started = Instant::now();
        assert_eq!(client.get_clip().unwrap_err(), ClipError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }
}
