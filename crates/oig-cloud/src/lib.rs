//! Cloud session (C5): the single outbound TCP connection to the vendor
//! cloud endpoint, shared by every forwarded frame.
//!
//! A single object guards the one legal path to the cloud, with the
//! connection lock and the I/O lock kept distinct so a connect attempt can
//! never be blocked behind an in-flight send, and a send always acquires
//! I/O before it touches connection state (so the two never nest in the
//! opposite order).

use anyhow::Result;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Doubling backoff clamped to `[min, max]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, current: min }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Doubles the current delay (clamped to `max`) and returns it.
    pub fn bump(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.max);
        self.current
    }

    /// Resets to `min` after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Error kinds surfaced by a failed send/read-ack or connect attempt.
#[derive(Debug)]
pub enum CloudError {
    ConnectFailed(String),
    Timeout,
    Eof,
    Io(String),
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudError::ConnectFailed(msg) => write!(f, "cloud connect failed: {msg}"),
            CloudError::Timeout => write!(f, "cloud ack read timed out"),
            CloudError::Eof => write!(f, "cloud connection closed before any byte was read"),
            CloudError::Io(msg) => write!(f, "cloud io error: {msg}"),
        }
    }
}

impl std::error::Error for CloudError {}

fn contains_end_frame_marker(buf: &[u8]) -> bool {
    const MARKER: &[u8] = b"</Frame>";
    buf.windows(MARKER.len()).any(|w| w == MARKER)
}

/// Running counters, published verbatim in the periodic status snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudStats {
    pub connects: u64,
    pub disconnects: u64,
    pub timeouts: u64,
    pub errors: u64,
}

struct ConnSlot {
    stream: Option<TcpStream>,
    backoff: Backoff,
    last_attempt_at: Option<Instant>,
    stats: CloudStats,
}

pub struct CloudSession {
    host: String,
    port: u16,
    connect_timeout: Duration,
    ack_max_bytes: usize,
    conn: Mutex<ConnSlot>,
    io: Mutex<()>,
}

impl CloudSession {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        min_backoff: Duration,
        max_backoff: Duration,
        ack_max_bytes: usize,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
            ack_max_bytes,
            conn: Mutex::new(ConnSlot {
                stream: None,
                backoff: Backoff::new(min_backoff, max_backoff),
                last_attempt_at: None,
                stats: CloudStats::default(),
            }),
            io: Mutex::new(()),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.stream.is_some()
    }

    pub async fn stats(&self) -> CloudStats {
        self.conn.lock().await.stats
    }

    pub async fn backoff_seconds(&self) -> u64 {
        self.conn.lock().await.backoff.current().as_secs()
    }

    /// Connects if not already connected, respecting the minimum spacing
    /// imposed by the current backoff window.
    pub async fn ensure_connected(&self) -> Result<(), CloudError> {
        let mut slot = self.conn.lock().await;
        if slot.stream.is_some() {
            return Ok(());
        }

        if let Some(last) = slot.last_attempt_at {
            let elapsed = last.elapsed();
            let wait = slot.backoff.current();
            if elapsed < wait {
                tokio::time::sleep(wait - elapsed).await;
            }
        }
        slot.last_attempt_at = Some(Instant::now());

        let addr = format!("{}:{}", self.host, self.port);
        let connect = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await;
        match connect {
            Ok(Ok(stream)) => {
                slot.stream = Some(stream);
                slot.backoff.reset();
                slot.stats.connects += 1;
                Ok(())
            }
            Ok(Err(e)) => {
                slot.backoff.bump();
                slot.stats.errors += 1;
                Err(CloudError::ConnectFailed(e.to_string()))
            }
            Err(_) => {
                slot.backoff.bump();
                slot.stats.errors += 1;
                Err(CloudError::ConnectFailed("connect timed out".to_string()))
            }
        }
    }

    /// Writes `payload`, then reads until a full `</Frame>` marker appears
    /// or `ack_max_bytes` is exceeded. Only one send/read is ever in flight.
    pub async fn send_and_read_ack(&self, payload: &[u8], ack_timeout: Duration) -> Result<Vec<u8>, CloudError> {
        let _io_guard = self.io.lock().await;
        self.ensure_connected().await?;

        let mut slot = self.conn.lock().await;
        let stream = match slot.stream.as_mut() {
            Some(s) => s,
            None => return Err(CloudError::ConnectFailed("no stream after ensure_connected".into())),
        };

        if let Err(e) = stream.write_all(payload).await {
            slot.stream = None;
            slot.stats.errors += 1;
            return Err(CloudError::Io(e.to_string()));
        }
        if let Err(e) = stream.flush().await {
            slot.stream = None;
            slot.stats.errors += 1;
            return Err(CloudError::Io(e.to_string()));
        }

        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + ack_timeout;
        loop {
            if buf.len() > self.ack_max_bytes {
                slot.stream = None;
                slot.stats.errors += 1;
                return Err(CloudError::Io("ack exceeded max bytes".into()));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let read = tokio::time::timeout(remaining, stream.read(&mut chunk)).await;
            match read {
                Err(_) => {
                    slot.stream = None;
                    slot.stats.timeouts += 1;
                    return Err(CloudError::Timeout);
                }
                Ok(Err(e)) => {
                    slot.stream = None;
                    slot.stats.errors += 1;
                    return Err(CloudError::Io(e.to_string()));
                }
                Ok(Ok(0)) => {
                    slot.stream = None;
                    if buf.is_empty() {
                        slot.stats.disconnects += 1;
                        return Err(CloudError::Eof);
                    }
                    slot.stats.errors += 1;
                    return Err(CloudError::Io("connection closed mid-frame".into()));
                }
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if contains_end_frame_marker(&buf) {
                        return Ok(buf);
                    }
                }
            }
        }
    }

    /// Idempotent.
    pub async fn close(&self) {
        let mut slot = self.conn.lock().await;
        slot.stream = None;
    }
}
