//! Control pipeline (C10): turns external set-requests into `Setting`
//! frames on the BOX and reconciles each through to completion.
//!
//! Requests are gated in order (ordered checks that refuse before anything
//! reaches the wire) and carried through explicit per-stage transitions,
//! with illegal transitions rejected rather than silently coerced.
//! Persisted non-terminal request_keys use the same atomic
//! write-then-rename discipline as [`oig_persist`]'s snapshots.

use anyhow::{Context, Result};
use oig_box::{build_setting_frame, BoxWriterHandle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Table -> allowed item set, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct Whitelist(BTreeMap<String, BTreeSet<String>>);

impl Whitelist {
    pub fn new(tables: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        Self(tables.into_iter().map(|(t, items)| (t, items.into_iter().collect())).collect())
    }

    pub fn is_allowed(&self, table: &str, item: &str) -> bool {
        self.0.get(table).map(|items| items.contains(item)).unwrap_or(false)
    }
}

/// A rejected request never reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    NotAllowed,
    BadValue,
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::NotAllowed => write!(f, "not_allowed"),
            RequestError::BadValue => write!(f, "bad_value"),
        }
    }
}

/// Normalizes `raw` into its canonical wire form for `item`, or rejects it.
///
/// `MODE` must be an integer in `0..=5`; items whose name contains
/// `Current` are normalized to a one-decimal float; everything else passes
/// through as trimmed text.
pub fn normalize_value(item: &str, raw: &str) -> Result<String, RequestError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(RequestError::BadValue);
    }
    if item == "MODE" {
        let v: i64 = raw.parse().map_err(|_| RequestError::BadValue)?;
        if !(0..=5).contains(&v) {
            return Err(RequestError::BadValue);
        }
        return Ok(v.to_string());
    }
    if item.contains("Current") {
        let v: f64 = raw.parse().map_err(|_| RequestError::BadValue)?;
        return Ok(format!("{v:.1}"));
    }
    Ok(raw.to_string())
}

/// `{New, Saved}` — the only two recognized `Confirm` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confirm {
    New,
    Saved,
}

/// An inbound set-request from `control/set`.
#[derive(Debug, Clone)]
pub struct SetRequest {
    pub tx_id: String,
    pub table: String,
    pub item: String,
    pub raw_value: String,
    pub confirm: Confirm,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Queued,
    SentToBox,
    BoxAck,
    Applied,
    Completed,
    Error,
    Deferred,
}

#[derive(Debug, Clone)]
pub struct ControlTransaction {
    pub tx_id: String,
    pub request_key: String,
    pub table: String,
    pub item: String,
    pub raw_value: String,
    pub canonical_value: String,
    pub confirm: Confirm,
    pub attempts: u32,
    pub stage: Stage,
    pub next_attempt_at: Option<Instant>,
    pub last_result: Option<String>,
    pub source: String,
    quiet_deadline: Option<Instant>,
    ack_deadline: Option<Instant>,
    applied_deadline: Option<Instant>,
}

impl ControlTransaction {
    fn new(req: SetRequest, canonical_value: String) -> Self {
        let request_key = format!("{}/{}/{}", req.table, req.item, canonical_value);
        Self {
            tx_id: req.tx_id,
            request_key,
            table: req.table,
            item: req.item,
            raw_value: req.raw_value,
            canonical_value,
            confirm: req.confirm,
            attempts: 0,
            stage: Stage::Queued,
            next_attempt_at: None,
            last_result: None,
            source: req.source,
            quiet_deadline: None,
            ack_deadline: None,
            applied_deadline: None,
        }
    }
}

/// Published on `control/result` for a given `tx_id`.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Accepted,
    Superseded,
    SentToBox,
    Applied,
    Completed { reason: &'static str },
    Error { kind: String },
    Deferred,
}

/// Preconditions gating the start of a new attempt, in check order.
pub struct BoxReadiness {
    pub device_id_known: bool,
    pub box_connected: bool,
    pub connected_since: Option<Instant>,
    pub last_box_data_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessRefusal {
    DeviceIdUnknown,
    BoxNotConnected,
    BoxNotReady,
    BoxNotSendingData,
}

impl BoxReadiness {
    /// Evaluates the four readiness checks in order, refusing at the
    /// first failure — mirrors a gateway's ordered gate verdicts.
    pub fn check(&self, now: Instant, box_ready_s: Duration) -> Result<(), ReadinessRefusal> {
        if !self.device_id_known {
            return Err(ReadinessRefusal::DeviceIdUnknown);
        }
        if !self.box_connected {
            return Err(ReadinessRefusal::BoxNotConnected);
        }
        let Some(since) = self.connected_since else {
            return Err(ReadinessRefusal::BoxNotConnected);
        };
        if now.duration_since(since) < box_ready_s {
            return Err(ReadinessRefusal::BoxNotReady);
        }
        let Some(last_data) = self.last_box_data_at else {
            return Err(ReadinessRefusal::BoxNotSendingData);
        };
        if now.duration_since(last_data) > Duration::from_secs(30) {
            return Err(ReadinessRefusal::BoxNotSendingData);
        }
        Ok(())
    }
}

pub struct ControlPipelineConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub box_ready_s: Duration,
    pub ack_timeout: Duration,
    pub applied_timeout: Duration,
    pub mode_quiet: Duration,
}

/// Owns the one-inflight-slot queue of control transactions.
pub struct ControlPipeline {
    config: ControlPipelineConfig,
    whitelist: Whitelist,
    writer: BoxWriterHandle,
    queued: VecDeque<ControlTransaction>,
    inflight: Option<ControlTransaction>,
    last_completed_was_sa: bool,
    sa_refresh_pending: bool,
    pending_store: Option<PendingKeysStore>,
    next_id_set: u64,
}

impl ControlPipeline {
    pub fn new(config: ControlPipelineConfig, whitelist: Whitelist, writer: BoxWriterHandle) -> Self {
        Self {
            config,
            whitelist,
            writer,
            queued: VecDeque::new(),
            inflight: None,
            last_completed_was_sa: true,
            sa_refresh_pending: false,
            pending_store: None,
            next_id_set: 1,
        }
    }

    pub fn with_persistence(mut self, data_dir: impl AsRef<Path>) -> Self {
        let store = PendingKeysStore::new(data_dir);
        if let Some(keys) = store.load() {
            for key in keys {
                tracing::warn!(request_key = %key, "restoring non-terminal control request from restart");
            }
        }
        self.pending_store = Some(store);
        self
    }

    fn persist_pending(&self) {
        let Some(store) = &self.pending_store else { return };
        let mut keys: Vec<String> = self.queued.iter().map(|t| t.request_key.clone()).collect();
        if let Some(tx) = &self.inflight {
            keys.push(tx.request_key.clone());
        }
        if let Err(e) = store.save(&keys) {
            tracing::warn!(error = %e, "failed to persist pending control keys");
        }
    }

    fn active_entry_index(&self, request_key: &str) -> Option<usize> {
        self.queued.iter().position(|t| t.request_key == request_key)
    }

    /// Accepts a new request: whitelist + normalize, dedup against the
    /// cache, supersede any still-queued entry for the same key.
    pub fn submit(&mut self, req: SetRequest, cached_value: Option<&str>) -> Vec<(String, ControlEvent)> {
        let mut events = Vec::new();

        if !self.whitelist.is_allowed(&req.table, &req.item) {
            events.push((req.tx_id.clone(), ControlEvent::Error { kind: RequestError::NotAllowed.to_string() }));
            return events;
        }
        let canonical_value = match normalize_value(&req.item, &req.raw_value) {
            Ok(v) => v,
            Err(e) => {
                events.push((req.tx_id.clone(), ControlEvent::Error { kind: e.to_string() }));
                return events;
            }
        };

        if cached_value == Some(canonical_value.as_str()) {
            events.push((req.tx_id.clone(), ControlEvent::Completed { reason: "noop_already_set" }));
            return events;
        }

        let tx = ControlTransaction::new(req, canonical_value);

        if let Some(idx) = self.active_entry_index(&tx.request_key) {
            let superseded = self.queued.remove(idx).unwrap();
            events.push((superseded.tx_id, ControlEvent::Superseded));
        } else if let Some(current) = &self.inflight {
            if current.request_key == tx.request_key {
                let superseded = self.inflight.take().unwrap();
                events.push((superseded.tx_id, ControlEvent::Superseded));
            }
        }

        events.push((tx.tx_id.clone(), ControlEvent::Accepted));
        self.queued.push_back(tx);
        self.persist_pending();
        events
    }

    /// Tries to promote the front of the queue into the one inflight slot.
    pub fn try_advance(&mut self, readiness: &BoxReadiness, now: Instant) -> Vec<(String, ControlEvent)> {
        let mut events = Vec::new();
        if self.inflight.is_some() {
            return events;
        }

        let Some(front) = self.queued.front() else {
            self.maybe_enqueue_sa_refresh();
            return events;
        };
        if let Some(next_at) = front.next_attempt_at {
            if now < next_at {
                return events;
            }
        }
        if let Err(refusal) = readiness.check(now, self.config.box_ready_s) {
            tracing::debug!(?refusal, "control attempt deferred: box not ready");
            return events;
        }

        let mut tx = self.queued.pop_front().unwrap();
        tx.attempts += 1;
        let id_set = self.next_id_set;
        self.next_id_set += 1;
        let frame = build_setting_frame(&tx.table, &tx.item, &tx.canonical_value, &id_set.to_string());

        if !self.writer.send(frame) {
            if tx.attempts < self.config.max_attempts {
                tx.stage = Stage::Deferred;
                tx.next_attempt_at = Some(now + self.config.retry_delay);
                events.push((tx.tx_id.clone(), ControlEvent::Deferred));
                self.queued.push_front(tx);
            } else {
                events.push((tx.tx_id.clone(), ControlEvent::Error { kind: "send_failed".to_string() }));
            }
            self.persist_pending();
            return events;
        }

        tx.stage = Stage::SentToBox;
        tx.ack_deadline = Some(now + self.config.ack_timeout);
        tx.applied_deadline = Some(now + self.config.applied_timeout);
        events.push((tx.tx_id.clone(), ControlEvent::SentToBox));
        self.inflight = Some(tx);
        self.persist_pending();
        events
    }

    fn maybe_enqueue_sa_refresh(&mut self) {
        if self.last_completed_was_sa || self.sa_refresh_pending {
            return;
        }
        self.sa_refresh_pending = true;
        let tx = ControlTransaction::new(
            SetRequest {
                tx_id: format!("sa-refresh-{}", self.next_id_set),
                table: "tbl_box_prms".to_string(),
                item: "SA".to_string(),
                raw_value: "refresh".to_string(),
                confirm: Confirm::New,
                source: "queue_drained".to_string(),
            },
            "refresh".to_string(),
        );
        self.queued.push_back(tx);
    }

    /// Feeds a `tbl_events` content line; detects the ack/applied/
    /// setting-event-match signals for the currently inflight transaction.
    pub fn on_tbl_events(&mut self, content: &str, now: Instant) -> Vec<(String, ControlEvent)> {
        let mut events = Vec::new();
        let Some(tx) = &mut self.inflight else { return events };

        if tx.item == "MODE" && content.contains("Invertor ACK") {
            tx.stage = Stage::Applied;
            tx.quiet_deadline = Some(now + self.config.mode_quiet);
            tx.applied_deadline = None;
            events.push((tx.tx_id.clone(), ControlEvent::Applied));
            return events;
        }

        if let Some((table, item, new_value)) = parse_setting_event(content) {
            if table == tx.table && item == tx.item && new_value == tx.canonical_value {
                tx.stage = Stage::BoxAck;
                if tx.item == "MODE" {
                    tx.stage = Stage::Applied;
                    tx.quiet_deadline = Some(now + self.config.mode_quiet);
                    tx.applied_deadline = None;
                    events.push((tx.tx_id.clone(), ControlEvent::Applied));
                } else {
                    let finished = self.inflight.take().unwrap();
                    self.last_completed_was_sa = finished.item == "SA" && finished.table == "tbl_box_prms";
                    self.sa_refresh_pending = false;
                    events.push((finished.tx_id, ControlEvent::Completed { reason: "setting_event_match" }));
                    self.persist_pending();
                }
            }
        }
        events
    }

    /// Advances ack/quiet timers; call on every tick of the orchestrator's
    /// status loop (or more often).
    pub fn check_timers(&mut self, now: Instant) -> Vec<(String, ControlEvent)> {
        let mut events = Vec::new();
        let Some(tx) = &mut self.inflight else { return events };

        if tx.stage == Stage::SentToBox {
            if let Some(deadline) = tx.ack_deadline {
                if now >= deadline {
                    if tx.attempts < self.config.max_attempts {
                        tx.stage = Stage::Deferred;
                        tx.next_attempt_at = Some(now + self.config.retry_delay);
                        let mut requeued = self.inflight.take().unwrap();
                        requeued.stage = Stage::Deferred;
                        events.push((requeued.tx_id.clone(), ControlEvent::Deferred));
                        self.queued.push_front(requeued);
                    } else {
                        let finished = self.inflight.take().unwrap();
                        events.push((finished.tx_id, ControlEvent::Error { kind: "ack_timeout".to_string() }));
                    }
                    self.persist_pending();
                    return events;
                }
            }
        }

        if matches!(tx.stage, Stage::SentToBox | Stage::BoxAck) {
            if let Some(deadline) = tx.applied_deadline {
                if now >= deadline {
                    let finished = self.inflight.take().unwrap();
                    events.push((finished.tx_id, ControlEvent::Error { kind: "applied_timeout".to_string() }));
                    self.persist_pending();
                    return events;
                }
            }
        }

        if tx.stage == Stage::Applied {
            if let Some(deadline) = tx.quiet_deadline {
                if now >= deadline {
                    let finished = self.inflight.take().unwrap();
                    self.last_completed_was_sa = finished.item == "SA" && finished.table == "tbl_box_prms";
                    self.sa_refresh_pending = false;
                    events.push((finished.tx_id, ControlEvent::Completed { reason: "setting_event_match" }));
                    self.persist_pending();
                }
            }
        }

        events
    }

    /// Any tbl_events traffic bumps an in-progress quiet window back out.
    pub fn bump_quiet_window(&mut self, now: Instant) {
        if let Some(tx) = &mut self.inflight {
            if tx.stage == Stage::Applied {
                tx.quiet_deadline = Some(now + self.config.mode_quiet);
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queued.len()
    }

    pub fn inflight_descriptor(&self) -> Option<String> {
        self.inflight
            .as_ref()
            .map(|tx| format!("{}:{:?}:attempt{}", tx.request_key, tx.stage, tx.attempts))
    }

    pub fn pending_request_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.queued.iter().map(|t| t.request_key.clone()).collect();
        if let Some(tx) = &self.inflight {
            keys.push(tx.request_key.clone());
        }
        keys
    }
}

/// Extracts `(table, item, new_value)` from a `tbl_events` content line of
/// the form `"... : {table} / {item}: [OLD]->[NEW]"`.
fn parse_setting_event(content: &str) -> Option<(String, String, String)> {
    let colon = content.rfind(" : ")?;
    let rest = &content[colon + 3..];
    let slash = rest.find('/')?;
    let table = rest[..slash].trim().to_string();
    let rest2 = &rest[slash + 1..];
    let colon2 = rest2.find(':')?;
    let item = rest2[..colon2].trim().to_string();
    let rest3 = &rest2[colon2 + 1..];
    let arrow = rest3.find("->")?;
    let new_part = &rest3[arrow + 2..];
    let open = new_part.find('[')?;
    let close = new_part[open..].find(']')?;
    let new_value = new_part[open + 1..open + close].to_string();
    Some((table, item, new_value))
}

/// Persists the set of non-terminal `request_key`s so a restart can
/// re-publish `error/restart` instead of silently dropping them.
struct PendingKeysStore {
    path: PathBuf,
}

impl PendingKeysStore {
    fn new(data_dir: impl AsRef<Path>) -> Self {
        Self { path: data_dir.as_ref().join("control_pending_keys.json") }
    }

    fn load(&self) -> Option<Vec<String>> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn save(&self, keys: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("creating control data directory")?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(keys)?).context("writing pending keys temp file")?;
        std::fs::rename(&tmp, &self.path).context("renaming pending keys file into place")?;
        Ok(())
    }
}
