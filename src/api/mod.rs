use crate::server::ClipServer;
use anyhow::{anyhow, Result};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8765".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("clip api thread panicked"))?;
        }
        Ok(())
    }
}

/// Line-delimited JSON endpoint in front of a `ClipServer`.
///
/// Connections are persistent and each one gets its own thread; the server's
/// cursor lock serializes clip requests across them. Nothing per-connection
/// survives a disconnect.
pub struct ApiServer {
    cfg: ApiConfig,
    server: Arc<ClipServer>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, server: Arc<ClipServer>) -> Self {
        Self { cfg, server }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let server = self.server.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, server, shutdown_thread) {
                log::error!("clip api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, server: Arc<ClipServer>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                log::info!("clip api: consumer connected from {}", peer);
                let server = server.clone();
                let shutdown = shutdown.clone();
                connections.push(std::thread::spawn(move || {
                    match handle_connection(stream, &server, &shutdown) {
                        Ok(()) => log::info!("clip api: consumer {} disconnected", peer),
                        Err(err) => log::warn!("clip api: connection {} dropped: {}", peer, err),
                    }
                }));
                connections.retain(|handle| !handle.is_finished());
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for handle in connections {
        let _ = handle.join();
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, server: &ClipServer, shutdown: &AtomicBool) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_nodelay(true)?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        // One byte past the cap is enough to tell an oversized request apart.
        let limit = (MAX_REQUEST_BYTES + 1).saturating_sub(line.len()) as u64;
        match reader.by_ref().take(limit).read_until(b'\n', &mut line) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                if line.len() > MAX_REQUEST_BYTES {
                    write_line(
                        &mut writer,
                        r#"{"success":false,"error":"protocol error: request too large"}"#,
                    )?;
                    return Err(anyhow!("request too large"));
                }
                let complete = line.last() == Some(&b'\n');
                if !is_blank(&line) {
                    let reply = server.respond(&line)?;
                    write_line(&mut writer, &reply)?;
                }
                line.clear();
                if !complete {
                    return Ok(());
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => return Err(err.into()),
        }
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

fn write_line(stream: &mut TcpStream, body: &str) -> Result<()> {
    stream.write_all(body.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
