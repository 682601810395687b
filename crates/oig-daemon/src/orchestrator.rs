//! Orchestrator (C12): wires every subsystem together and owns the
//! start/shutdown sequence.
//!
//! Start order: load sensor map -> build bus publisher -> start control
//! pipeline subscriptions -> start box listener -> start status + heartbeat
//! loops -> start bus health-check loop. Shutdown: stop listener (drains
//! in-flight frames), stop loops, close cloud session, close bus, close
//! persistence stores.

use crate::discovery::{default_sensor_map, discovery_payload, discovery_topic};
use crate::state::AppState;
use oig_box::{BoxListener, BoxListenerConfig, DisconnectReason, FrameObserver};
use oig_bus::BusConfig;
use oig_control::ControlEvent;
use oig_protocol::{parse_mode_from_event, ParsedRecord, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Receives every parsed BOX record: merges it into the table cache,
/// persists MODE/PRMS, feeds `tbl_events` into the control pipeline, and
/// republishes the affected table's retained state.
pub struct CoreObserver {
    state: Arc<AppState>,
}

impl CoreObserver {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    fn maybe_update_mode(&self, value: i64) {
        if !oig_persist::ModeSnapshot::is_valid_mode(value) {
            return;
        }
        let device_id = match self.state.device_id() {
            Some(id) => id,
            None => return,
        };
        let mut current = self.state.mode_snapshot.lock().unwrap();
        if current.as_ref().map(|s| s.mode_value) == Some(value) {
            return;
        }
        let snapshot = oig_persist::ModeSnapshot { mode_value: value, device_id };
        if let Err(e) = self.state.snapshots.save_mode(&snapshot) {
            tracing::warn!(error = %e, "failed to persist mode snapshot");
        }
        *current = Some(snapshot);
    }

    fn publish_table_state(&self, table: &str) {
        let Some(device_id) = self.state.device_id() else { return };
        let row = match self.state.table_cache.lock().unwrap().get(table) {
            Some(row) => row.clone(),
            None => return,
        };
        let payload = match serde_json::to_vec(&row) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize table state");
                return;
            }
        };
        let topic = format!("{}/{}/{}/state", self.state.namespace, device_id, table);
        let bus = self.state.bus.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.publish(topic, payload, true).await {
                tracing::warn!(error = %e, "failed to publish table state");
            }
        });
    }
}

impl FrameObserver for CoreObserver {
    fn on_connect(&self, _conn_id: u64) {
        self.state.mark_box_connected();
    }

    fn on_disconnect(&self, _conn_id: u64, reason: DisconnectReason) {
        tracing::info!(?reason, "box listener reported disconnect");
        self.state.mark_box_disconnected();
    }

    fn on_parsed(&self, _conn_id: u64, record: &ParsedRecord) {
        self.state.mark_box_data_seen();

        if let Some(device_id) = &record.device_id {
            if self.state.device_id().as_deref() != Some(device_id.as_str()) {
                self.state.set_device_id(device_id.clone());
            }
        }

        if record.table.as_deref() == Some("IsNewSet") {
            self.state.record_isnewset_poll(record.dt.clone().unwrap_or_default());
        }
        if let Some(reason) = &record.reason {
            self.state.record_isnewset_response(reason.clone());
        }

        let Some(table) = record.table.clone() else { return };
        let fields: Vec<(String, String)> = record.fields.iter().map(|(k, v)| (k.clone(), v.to_string())).collect();
        self.state.merge_table_row(&table, fields.clone());

        if table == "tbl_box_prms" {
            if let Some(Value::Int(mode)) = record.get("MODE") {
                self.maybe_update_mode(*mode);
            }
        }

        if oig_persist::PrmsSnapshot::is_eligible_table(&table) {
            let mut prms = self.state.prms_snapshot.lock().unwrap();
            prms.merge(&table, fields);
            if let Err(e) = self.state.snapshots.save_prms(&prms) {
                tracing::warn!(error = %e, "failed to persist prms snapshot");
            }
        }

        if table == "tbl_events" {
            if let Some(Value::Text(content)) = record.get("Content") {
                if let Some(mode) = parse_mode_from_event(content) {
                    self.maybe_update_mode(mode);
                }
                let now = Instant::now();
                let events = {
                    let mut pipeline = self.state.control.lock().unwrap();
                    let mut out = pipeline.on_tbl_events(content, now);
                    pipeline.bump_quiet_window(now);
                    out.extend(pipeline.check_timers(now));
                    out
                };
                publish_control_events(&self.state, events);
            }
        }

        self.publish_table_state(&table);
    }
}

/// Publishes each `(tx_id, event)` on `control/result` and the matching
/// `control/status/{tx_id}` topic. The pipeline's events are keyed by
/// `tx_id` rather than `request_key`, so the status topic is likewise
/// keyed by `tx_id` here.
pub fn publish_control_events(state: &Arc<AppState>, events: Vec<(String, ControlEvent)>) {
    for (tx_id, event) in events {
        let (kind, detail) = describe_event(&event);
        let result_topic = format!("{}/control/result", state.namespace);
        let status_topic = format!("{}/control/status/{}", state.namespace, tx_id);
        let result_payload = serde_json::json!({ "tx_id": tx_id, "event": kind, "detail": detail });
        let terminal = matches!(kind.as_str(), "completed" | "error" | "superseded");
        let status_payload = if terminal { None } else { Some(serde_json::json!({ "tx_id": tx_id, "state": kind, "detail": detail })) };
        let bus = state.bus.clone();
        tokio::spawn(async move {
            if let Ok(bytes) = serde_json::to_vec(&result_payload) {
                let _ = bus.publish(result_topic, bytes, false).await;
            }
            match status_payload {
                Some(payload) => {
                    if let Ok(bytes) = serde_json::to_vec(&payload) {
                        let _ = bus.publish(status_topic, bytes, true).await;
                    }
                }
                // Terminal: clear the retained per-key status instead of leaving
                // a stale "sent"/"applied" value parked on the topic forever.
                None => {
                    let _ = bus.publish(status_topic, Vec::new(), true).await;
                }
            }
        });
    }
}

fn describe_event(event: &ControlEvent) -> (String, Option<String>) {
    match event {
        ControlEvent::Accepted => ("accepted".to_string(), None),
        ControlEvent::Superseded => ("superseded".to_string(), None),
        ControlEvent::SentToBox => ("sent_to_box".to_string(), None),
        ControlEvent::Applied => ("applied".to_string(), None),
        ControlEvent::Completed { reason } => ("completed".to_string(), Some(reason.to_string())),
        ControlEvent::Error { kind } => ("error".to_string(), Some(kind.clone())),
        ControlEvent::Deferred => ("deferred".to_string(), None),
    }
}

/// Subscribes to `NS/control/set` and drives inbound requests into the
/// control pipeline from a dedicated task (the bus's dispatch callback is
/// synchronous; this channel hands work to async context for the
/// resulting publishes).
pub async fn spawn_control_subscription(state: Arc<AppState>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let pattern = format!("{}/control/set", state.namespace);
    state
        .bus
        .subscribe(
            pattern,
            Arc::new(move |_topic: &str, payload: &[u8]| {
                let _ = tx.send(payload.to_vec());
            }),
        )
        .await?;

    let worker_state = Arc::clone(&state);
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            handle_inbound_set(&worker_state, &payload);
        }
    });
    Ok(())
}

#[derive(serde::Deserialize)]
struct InboundSet {
    tx_id: String,
    tbl_name: String,
    tbl_item: String,
    new_value: String,
    confirm: Option<String>,
}

fn handle_inbound_set(state: &Arc<AppState>, payload: &[u8]) {
    let Ok(inbound) = serde_json::from_slice::<InboundSet>(payload) else {
        tracing::warn!("dropping malformed control/set payload");
        return;
    };
    let confirm = match inbound.confirm.as_deref() {
        Some(s) if s.eq_ignore_ascii_case("saved") => oig_control::Confirm::Saved,
        _ => oig_control::Confirm::New,
    };
    let req = oig_control::SetRequest {
        tx_id: inbound.tx_id,
        table: inbound.tbl_name.clone(),
        item: inbound.tbl_item.clone(),
        raw_value: inbound.new_value,
        confirm,
        source: "bus".to_string(),
    };
    let cached = state.cached_value(&inbound.tbl_name, &inbound.tbl_item);
    let events = {
        let mut pipeline = state.control.lock().unwrap();
        pipeline.submit(req, cached.as_deref())
    };
    publish_control_events(state, events);
}

/// Periodically tries to advance the control pipeline's queue and checks
/// its timers against box readiness, independent of BOX traffic (so a
/// BOX that stops sending events doesn't strand a deferred attempt).
pub fn spawn_control_ticker(state: Arc<AppState>, period: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let readiness = state.readiness();
            let events = {
                let mut pipeline = state.control.lock().unwrap();
                let mut out = pipeline.try_advance(&readiness, now);
                out.extend(pipeline.check_timers(now));
                out
            };
            publish_control_events(&state, events);
        }
    });
}

/// Publishes one retained discovery config payload per entry in the
/// default sensor map. Call once after the device id is known.
pub async fn publish_discovery(state: &Arc<AppState>, bus_config: &BusConfig) {
    let Some(device_id) = state.device_id() else { return };
    for sensor in default_sensor_map() {
        let topic = discovery_topic(&device_id, &sensor.table, &sensor.item);
        let payload = discovery_payload(bus_config, &device_id, &sensor);
        if let Ok(bytes) = serde_json::to_vec(&payload) {
            if let Err(e) = state.bus.publish(topic, bytes, true).await {
                tracing::warn!(error = %e, "failed to publish discovery config");
            }
        }
    }
}

/// Builds the box listener and spawns its `serve` loop. `writer_handle`
/// must be the same handle already shared with the control pipeline (via
/// `AppState::box_writer`), so both sides observe the same live
/// connection.
pub fn spawn_box_listener(
    state: Arc<AppState>,
    hybrid: Arc<std::sync::Mutex<oig_hybrid::HybridState>>,
    cloud: Arc<oig_cloud::CloudSession>,
    config: BoxListenerConfig,
    writer_handle: oig_box::BoxWriterHandle,
) {
    let observer = Arc::new(CoreObserver::new(Arc::clone(&state)));
    let listener = Arc::new(BoxListener::new(config, hybrid, cloud, observer, writer_handle));
    tokio::spawn(async move {
        if let Err(e) = listener.serve().await {
            tracing::error!(error = %e, "box listener terminated");
            std::process::exit(1);
        }
    });
}

/// Periodic probe that just logs cloud/bus reachability; reconnects
/// themselves are handled inside `oig-cloud`/`oig-bus`.
pub fn spawn_bus_health_loop(state: Arc<AppState>, period: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let connected = state.bus.is_connected();
            if !connected {
                tracing::warn!("bus health check: not connected");
            }
        }
    });
}

/// Refreshes `AppState`'s synchronous stats cache from `CloudSession`'s and
/// `BusPublisher`'s async getters, so the status reporter's source closure
/// (a plain synchronous `Fn`) never has to block on IO to build a snapshot.
pub fn spawn_stats_cache_loop(state: Arc<AppState>, period: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let cloud_connected = state.cloud.is_connected().await;
            let cloud_stats = state.cloud.stats().await;
            let bus_queue_depth = state.bus.queue_depth().await.unwrap_or(0);
            state.refresh_remote_stats_cache(cloud_connected, cloud_stats, bus_queue_depth);
        }
    });
}

/// On startup, loads any prior mode/prms snapshots and marks them pending
/// republish once the device id and bus are ready. Returns immediately if
/// nothing was persisted.
pub fn load_snapshots(state: &Arc<AppState>) {
    if let Some(mode) = state.snapshots.load_mode() {
        tracing::info!(mode_value = mode.mode_value, "restored mode snapshot");
        *state.mode_snapshot.lock().unwrap() = Some(mode);
    }
    if let Some(prms) = state.snapshots.load_prms() {
        tracing::info!(tables = prms.tables.len(), "restored prms snapshot");
        *state.prms_snapshot.lock().unwrap() = prms;
    }
}

/// Republishes any restored mode/prms state once the device id and bus
/// are both known. Safe to call repeatedly; each call just re-publishes.
pub async fn republish_restored_state(state: &Arc<AppState>) {
    let Some(device_id) = state.device_id() else { return };
    if !state.bus.is_connected() {
        return;
    }
    let mode = state.mode_snapshot.lock().unwrap().clone();
    if let Some(mode) = mode {
        let topic = format!("{}/{}/tbl_box_prms/state", state.namespace, device_id);
        if let Ok(bytes) = serde_json::to_vec(&serde_json::json!({ "MODE": mode.mode_value })) {
            let _ = state.bus.publish(topic, bytes, true).await;
        }
    }
    let tables: Vec<(String, std::collections::BTreeMap<String, String>)> = {
        let prms = state.prms_snapshot.lock().unwrap();
        prms.tables.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    };
    for (table, row) in tables {
        state.merge_table_row(&table, row.clone());
        let topic = format!("{}/{}/{}/state", state.namespace, device_id, table);
        if let Ok(bytes) = serde_json::to_vec(&row) {
            let _ = state.bus.publish(topic, bytes, true).await;
        }
    }
}

/// Graceful shutdown: the listener and loop tasks are dropped with the
/// runtime; this closes the one resource that needs an explicit async
/// teardown. The bus's last-will publishes "offline" once its connection
/// drops.
pub async fn shutdown(state: &Arc<AppState>) {
    tracing::info!("shutting down");
    state.cloud.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use oig_box::BoxWriterHandle;
    use oig_bus::{BusConfig, BusPublisher};
    use oig_control::{ControlPipeline, ControlPipelineConfig, Whitelist};
    use oig_hybrid::{ConfiguredMode, HybridState};
    use oig_persist::{PrmsSnapshot, SnapshotStore};
    use oig_protocol::Value;
    use oig_queue::PersistentQueue;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64};
    use std::sync::Mutex;
    use std::time::Duration;

    async fn test_state() -> Arc<AppState> {
        let queue = PersistentQueue::open_in_memory(100).await.unwrap();
        let bus_config = BusConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            client_id: "test".to_string(),
            username: None,
            password: None,
            namespace: "oig_test".to_string(),
            qos: rumqttc::QoS::AtLeastOnce,
            device_id: "pending".to_string(),
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            replay_rate_per_sec: 5,
        };
        let bus = BusPublisher::spawn(bus_config, queue);
        let cloud = Arc::new(oig_cloud::CloudSession::new(
            "127.0.0.1",
            1,
            Duration::from_millis(50),
            Duration::from_millis(10),
            Duration::from_millis(100),
            4096,
        ));
        let hybrid = Arc::new(Mutex::new(HybridState::new(ConfiguredMode::Online, 3, Duration::from_secs(30))));
        let whitelist = Whitelist::new([("tbl_box_prms".to_string(), vec!["MODE".to_string(), "SA".to_string()])]);
        let control = ControlPipeline::new(
            ControlPipelineConfig {
                max_attempts: 3,
                retry_delay: Duration::from_secs(5),
                box_ready_s: Duration::from_secs(10),
                ack_timeout: Duration::from_secs(20),
                applied_timeout: Duration::from_secs(60),
                mode_quiet: Duration::from_secs(30),
            },
            whitelist,
            BoxWriterHandle::default(),
        );
        let dir = tempfile::tempdir().unwrap();
        Arc::new(AppState {
            session_id: "test-session".to_string(),
            started_at: std::time::Instant::now(),
            bus,
            cloud,
            hybrid,
            control: Arc::new(Mutex::new(control)),
            box_writer: BoxWriterHandle::default(),
            snapshots: Arc::new(SnapshotStore::new(dir.path())),
            device_id: Mutex::new(None),
            table_cache: Mutex::new(BTreeMap::new()),
            mode_snapshot: Mutex::new(None),
            prms_snapshot: Mutex::new(PrmsSnapshot::default()),
            box_connected: AtomicBool::new(false),
            box_connected_since: Mutex::new(None),
            last_box_data_at: Mutex::new(None),
            namespace: "oig_test".to_string(),
            isnewset_polls: AtomicU64::new(0),
            isnewset_last_poll: Mutex::new(None),
            isnewset_last_response: Mutex::new(None),
            seen_http_tx_ids: Mutex::new(Default::default()),
            cloud_connected_cache: AtomicBool::new(false),
            cloud_stats_cache: Mutex::new(oig_cloud::CloudStats::default()),
            bus_queue_depth_cache: AtomicI64::new(0),
        })
    }

    fn record(table: &str, fields: Vec<(&str, Value)>) -> ParsedRecord {
        ParsedRecord {
            fields: fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            table: Some(table.to_string()),
            device_id: None,
            dt: None,
            reason: None,
        }
    }

    #[test]
    fn describe_event_maps_every_variant() {
        assert_eq!(describe_event(&ControlEvent::Accepted), ("accepted".to_string(), None));
        assert_eq!(describe_event(&ControlEvent::Superseded), ("superseded".to_string(), None));
        assert_eq!(describe_event(&ControlEvent::SentToBox), ("sent_to_box".to_string(), None));
        assert_eq!(describe_event(&ControlEvent::Applied), ("applied".to_string(), None));
        assert_eq!(
            describe_event(&ControlEvent::Completed { reason: "noop_already_set" }),
            ("completed".to_string(), Some("noop_already_set".to_string()))
        );
        assert_eq!(
            describe_event(&ControlEvent::Error { kind: "bad_value".to_string() }),
            ("error".to_string(), Some("bad_value".to_string()))
        );
        assert_eq!(describe_event(&ControlEvent::Deferred), ("deferred".to_string(), None));
    }

    #[tokio::test]
    async fn on_connect_and_on_disconnect_flip_box_connected_state() {
        let state = test_state().await;
        let observer = CoreObserver::new(Arc::clone(&state));
        observer.on_connect(1);
        assert!(state.box_connected.load(std::sync::atomic::Ordering::SeqCst));
        observer.on_disconnect(1, DisconnectReason::Eof);
        assert!(!state.box_connected.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn on_parsed_learns_device_id_from_first_record() {
        let state = test_state().await;
        let observer = CoreObserver::new(Arc::clone(&state));
        let mut rec = record("tbl_box_prms", vec![("MODE", Value::Int(1))]);
        rec.device_id = Some("dev-123".to_string());
        observer.on_parsed(1, &rec);
        assert_eq!(state.device_id(), Some("dev-123".to_string()));
    }

    #[tokio::test]
    async fn on_parsed_merges_fields_into_table_cache() {
        let state = test_state().await;
        let observer = CoreObserver::new(Arc::clone(&state));
        let rec = record("tbl_box_prms", vec![("SA", Value::Text("hello".to_string()))]);
        observer.on_parsed(1, &rec);
        assert_eq!(state.cached_value("tbl_box_prms", "SA"), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn on_parsed_persists_mode_once_device_id_is_known() {
        let state = test_state().await;
        state.set_device_id("dev-1".to_string());
        let observer = CoreObserver::new(Arc::clone(&state));
        let rec = record("tbl_box_prms", vec![("MODE", Value::Int(3))]);
        observer.on_parsed(1, &rec);
        let snapshot = state.mode_snapshot.lock().unwrap().clone().unwrap();
        assert_eq!(snapshot.mode_value, 3);
        assert_eq!(snapshot.device_id, "dev-1");
    }

    #[tokio::test]
    async fn on_parsed_ignores_mode_without_a_known_device_id() {
        let state = test_state().await;
        let observer = CoreObserver::new(Arc::clone(&state));
        let rec = record("tbl_box_prms", vec![("MODE", Value::Int(3))]);
        observer.on_parsed(1, &rec);
        assert!(state.mode_snapshot.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn on_parsed_counts_isnewset_polls() {
        let state = test_state().await;
        let observer = CoreObserver::new(Arc::clone(&state));
        let mut rec = record("IsNewSet", vec![]);
        rec.dt = Some("2026-01-01T00:00:00Z".to_string());
        observer.on_parsed(1, &rec);
        assert_eq!(state.isnewset_polls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(state.isnewset_last_poll.lock().unwrap().clone(), Some("2026-01-01T00:00:00Z".to_string()));
    }
}
