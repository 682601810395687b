//! Box listener (C6): accepts BOX connections and drives the per-connection
//! frame loop described in the system overview — read, extract, parse,
//! decide forward-vs-synthesize, write the ACK back, hand the record to
//! whoever else needs it.
//!
//! Only one BOX connection is expected in practice, but nothing here
//! assumes exclusivity: each accepted socket gets its own `conn_id` and
//! runs independently off one shared set of handles, the way an HTTP
//! handler gets its own request context off one shared application state.

use oig_cloud::CloudSession;
use oig_hybrid::{ConfiguredMode, HybridState};
use oig_offline::{synthesize, OfflineReply};
use oig_protocol::{build_frame, extract_one_frame, parse_frame, ParseOutcome, ParsedRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    IdleTimeout,
    Eof,
    Reset,
    Error,
}

/// Receives every successfully parsed record, regardless of whether it was
/// forwarded or synthesized. Implementors fan it out to the bus publisher
/// and the control pipeline; this crate doesn't know about either.
pub trait FrameObserver: Send + Sync {
    fn on_parsed(&self, conn_id: u64, record: &ParsedRecord);
    fn on_connect(&self, conn_id: u64) {
        let _ = conn_id;
    }
    fn on_disconnect(&self, conn_id: u64, reason: DisconnectReason) {
        let _ = (conn_id, reason);
    }
}

pub struct BoxListenerConfig {
    pub bind_addr: String,
    pub idle_timeout: Duration,
    pub ack_timeout: Duration,
}

/// A write channel to whichever BOX connection is currently live, if any.
/// The control pipeline uses this to push `Setting` frames.
#[derive(Clone, Default)]
pub struct BoxWriterHandle {
    inner: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl BoxWriterHandle {
    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    /// Queues `frame` for the active connection's writer task. Returns
    /// `false` if nothing is connected.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        match self.inner.lock().unwrap().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn set(&self, tx: Option<mpsc::UnboundedSender<Vec<u8>>>) {
        *self.inner.lock().unwrap() = tx;
    }
}

pub struct BoxListener {
    config: BoxListenerConfig,
    hybrid: Arc<Mutex<HybridState>>,
    cloud: Arc<CloudSession>,
    observer: Arc<dyn FrameObserver>,
    writer_handle: BoxWriterHandle,
    next_conn_id: AtomicU64,
}

impl BoxListener {
    /// `writer_handle` is shared with the caller (typically the control
    /// pipeline) so both sides always see the same live-connection state
    /// without this crate depending back on the caller.
    pub fn new(
        config: BoxListenerConfig,
        hybrid: Arc<Mutex<HybridState>>,
        cloud: Arc<CloudSession>,
        observer: Arc<dyn FrameObserver>,
        writer_handle: BoxWriterHandle,
    ) -> Self {
        Self { config, hybrid, cloud, observer, writer_handle, next_conn_id: AtomicU64::new(1) }
    }

    pub fn writer_handle(&self) -> BoxWriterHandle {
        self.writer_handle.clone()
    }

    /// Binds and serves forever (until the listener errors, which is
    /// treated as fatal: an unbindable port terminates the process).
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "box listener bound");
        loop {
            let (socket, peer) = listener.accept().await?;
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
            tracing::info!(conn_id, %peer, "box connected");
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.run_connection(conn_id, socket).await;
            });
        }
    }

    async fn run_connection(&self, conn_id: u64, socket: TcpStream) {
        let (mut read_half, mut write_half) = socket.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.writer_handle.set(Some(tx));
        self.observer.on_connect(conn_id);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
                let _ = write_half.flush().await;
            }
        });

        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        let reason = loop {
            let read = tokio::time::timeout(self.config.idle_timeout, read_half.read(&mut chunk)).await;
            match read {
                Err(_) => break DisconnectReason::IdleTimeout,
                Ok(Ok(0)) => break DisconnectReason::Eof,
                Ok(Err(e)) => {
                    tracing::warn!(conn_id, error = %e, "box read error");
                    break DisconnectReason::Reset;
                }
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    while let Some(frame) = extract_one_frame(&mut buf) {
                        self.handle_frame(conn_id, &frame).await;
                    }
                }
            }
        };

        tracing::info!(conn_id, ?reason, "box disconnected");
        self.writer_handle.set(None);
        self.observer.on_disconnect(conn_id, reason);
        drop(writer_task);
    }

    async fn handle_frame(&self, conn_id: u64, frame: &[u8]) {
        let Ok(text) = std::str::from_utf8(frame) else {
            tracing::warn!(conn_id, "box frame was not valid utf-8, dropping");
            return;
        };
        let record = match parse_frame(text) {
            ParseOutcome::Record(r) => r,
            ParseOutcome::DroppedInactiveReplica => return,
        };

        let (should_try_cloud, configured_mode) = {
            let hybrid = self.hybrid.lock().unwrap();
            (hybrid.should_try_cloud(Instant::now()), hybrid.configured_mode())
        };

        if should_try_cloud {
            match self.cloud.send_and_read_ack(frame, self.config.ack_timeout).await {
                Ok(ack) => {
                    self.hybrid.lock().unwrap().record_success();
                    self.writer_handle.send(ack);
                }
                Err(e) => {
                    tracing::warn!(conn_id, error = %e, "cloud forward failed");
                    let offline_event = self.hybrid.lock().unwrap().record_failure(e.to_string(), Instant::now());
                    if let Some(event) = offline_event {
                        tracing::warn!(conn_id, reason = %event.reason, "hybrid state machine tripped to offline");
                    }
                    if configured_mode != ConfiguredMode::Online {
                        self.synthesize_and_send(&record);
                    }
                    // Pure online mode: no local ACK, BOX will retry against the closed session.
                }
            }
        } else {
            self.synthesize_and_send(&record);
        }

        self.observer.on_parsed(conn_id, &record);
    }

    fn synthesize_and_send(&self, record: &ParsedRecord) {
        if let OfflineReply::Send(frame) = synthesize(record) {
            self.writer_handle.send(frame);
        }
    }
}

/// Builds the frame for a `Setting` write the control pipeline wants sent
/// to the BOX, specialized from `build_frame` for the `Reason=Setting`
/// shape used by control transactions.
pub fn build_setting_frame(table: &str, item: &str, value: &str, id_set: &str) -> Vec<u8> {
    let inner = format!(
        "<TblName>{table}</TblName><{item}>{value}</{item}><ID_Set>{id_set}</ID_Set><Reason>Setting</Reason>"
    );
    build_frame(&inner, true)
}
