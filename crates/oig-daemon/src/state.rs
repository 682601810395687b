//! Shared runtime state (C12), wired together by [`crate::orchestrator`].
//!
//! One `Arc<AppState>` is cloned into every task and every Axum handler,
//! carrying this proxy's subsystems (bus, cloud, hybrid, control) and the
//! cross-cutting bits of runtime state every one of them needs to read.

use oig_box::BoxWriterHandle;
use oig_bus::BusPublisher;
use oig_cloud::{CloudSession, CloudStats};
use oig_control::ControlPipeline;
use oig_hybrid::HybridState;
use oig_persist::{ModeSnapshot, PrmsSnapshot, SnapshotStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub struct AppState {
    pub session_id: String,
    pub started_at: Instant,
    pub bus: BusPublisher,
    pub cloud: Arc<CloudSession>,
    pub hybrid: Arc<Mutex<HybridState>>,
    pub control: Arc<Mutex<ControlPipeline>>,
    pub box_writer: BoxWriterHandle,
    pub snapshots: Arc<SnapshotStore>,
    pub device_id: Mutex<Option<String>>,
    pub table_cache: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    pub mode_snapshot: Mutex<Option<ModeSnapshot>>,
    pub prms_snapshot: Mutex<PrmsSnapshot>,
    pub box_connected: AtomicBool,
    pub box_connected_since: Mutex<Option<Instant>>,
    pub last_box_data_at: Mutex<Option<Instant>>,
    pub namespace: String,
    pub isnewset_polls: AtomicU64,
    pub isnewset_last_poll: Mutex<Option<String>>,
    pub isnewset_last_response: Mutex<Option<String>>,
    /// `tx_id`s already accepted through the HTTP wrapper, so a client
    /// retrying the same request body gets a conflict instead of a second
    /// queue entry under a new identity.
    pub seen_http_tx_ids: Mutex<BTreeSet<String>>,
    /// Last values observed from `CloudSession`/`BusPublisher`'s async
    /// getters, refreshed by a periodic task so the synchronous status
    /// snapshot builder never needs to `.await`.
    pub cloud_connected_cache: AtomicBool,
    pub cloud_stats_cache: Mutex<CloudStats>,
    pub bus_queue_depth_cache: AtomicI64,
}

impl AppState {
    pub fn device_id(&self) -> Option<String> {
        self.device_id.lock().unwrap().clone()
    }

    pub fn set_device_id(&self, id: String) {
        *self.device_id.lock().unwrap() = Some(id);
    }

    pub fn mark_box_connected(&self) {
        self.box_connected.store(true, Ordering::SeqCst);
        *self.box_connected_since.lock().unwrap() = Some(Instant::now());
    }

    pub fn mark_box_disconnected(&self) {
        self.box_connected.store(false, Ordering::SeqCst);
        *self.box_connected_since.lock().unwrap() = None;
    }

    pub fn mark_box_data_seen(&self) {
        *self.last_box_data_at.lock().unwrap() = Some(Instant::now());
    }

    pub fn readiness(&self) -> oig_control::BoxReadiness {
        oig_control::BoxReadiness {
            device_id_known: self.device_id().is_some(),
            box_connected: self.box_connected.load(Ordering::SeqCst),
            connected_since: *self.box_connected_since.lock().unwrap(),
            last_box_data_at: *self.last_box_data_at.lock().unwrap(),
        }
    }

    pub fn cached_value(&self, table: &str, item: &str) -> Option<String> {
        self.table_cache.lock().unwrap().get(table).and_then(|row| row.get(item).cloned())
    }

    pub fn merge_table_row(&self, table: &str, fields: impl IntoIterator<Item = (String, String)>) {
        let mut cache = self.table_cache.lock().unwrap();
        let row = cache.entry(table.to_string()).or_default();
        for (k, v) in fields {
            row.insert(k, v);
        }
    }

    pub fn record_isnewset_poll(&self, at: String) {
        self.isnewset_polls.fetch_add(1, Ordering::SeqCst);
        *self.isnewset_last_poll.lock().unwrap() = Some(at);
    }

    pub fn record_isnewset_response(&self, response: String) {
        *self.isnewset_last_response.lock().unwrap() = Some(response);
    }

    /// `true` if this is the first time `tx_id` has been seen through the
    /// HTTP wrapper.
    pub fn claim_http_tx_id(&self, tx_id: &str) -> bool {
        self.seen_http_tx_ids.lock().unwrap().insert(tx_id.to_string())
    }

    pub fn refresh_remote_stats_cache(&self, cloud_connected: bool, cloud_stats: CloudStats, bus_queue_depth: i64) {
        self.cloud_connected_cache.store(cloud_connected, Ordering::SeqCst);
        *self.cloud_stats_cache.lock().unwrap() = cloud_stats;
        self.bus_queue_depth_cache.store(bus_queue_depth, Ordering::SeqCst);
    }
}
