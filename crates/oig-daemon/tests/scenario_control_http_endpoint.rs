//! In-process scenario tests for the control HTTP endpoint.
//!
//! These spin up the Axum router without binding a TCP socket and drive it
//! via `tower::ServiceExt::oneshot` — no network I/O required.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use oig_box::BoxWriterHandle;
use oig_bus::{BusConfig, BusPublisher};
use oig_control::{ControlPipeline, ControlPipelineConfig, Whitelist};
use oig_daemon::{routes, state::AppState};
use oig_hybrid::{ConfiguredMode, HybridState};
use oig_persist::{PrmsSnapshot, SnapshotStore};
use oig_queue::PersistentQueue;
use tower::ServiceExt;

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
    let whitelist = Whitelist::new([("tbl_box_prms".to_string(), vec!["MODE".to_string()])]);
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
        started_at: Instant::now(),
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

fn setting_body(tx_id: &str, table: &str, item: &str, value: &str) -> String {
    serde_json::json!({
        "tx_id": tx_id,
        "tbl_name": table,
        "tbl_item": item,
        "new_value": value,
    })
    .to_string()
}

async fn post(state: Arc<AppState>, body: String) -> (StatusCode, serde_json::Value) {
    let req = Request::builder()
        .method("POST")
        .uri("/api/setting")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let resp = routes::build_router(state).oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn health_reports_session_and_uptime() {
    let state = test_state().await;
    let req = Request::builder().method("GET").uri("/api/health").body(Body::empty()).unwrap();
    let resp = routes::build_router(state).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["box_connected"], false);
}

#[tokio::test]
async fn happy_path_accepts_a_whitelisted_setting() {
    let state = test_state().await;
    let (status, json) = post(state, setting_body("tx-1", "tbl_box_prms", "MODE", "3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "accepted");
    assert_eq!(json["tx_id"], "tx-1");
}

#[tokio::test]
async fn no_op_completes_immediately_when_value_already_cached() {
    let state = test_state().await;
    state.merge_table_row("tbl_box_prms", [("MODE".to_string(), "3".to_string())]);
    let (status, json) = post(state, setting_body("tx-1", "tbl_box_prms", "MODE", "3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "completed");
    assert_eq!(json["reason"], "noop_already_set");
}

#[tokio::test]
async fn duplicate_request_for_same_target_supersedes_the_queued_entry() {
    let state = test_state().await;
    let (status1, json1) = post(Arc::clone(&state), setting_body("tx-1", "tbl_box_prms", "MODE", "3")).await;
    assert_eq!(status1, StatusCode::OK);
    assert_eq!(json1["status"], "accepted");

    // Same table/item/canonical-value while tx-1 is still queued: tx-1 is
    // superseded, tx-2 becomes the new accepted entry.
    let (status2, json2) = post(Arc::clone(&state), setting_body("tx-2", "tbl_box_prms", "MODE", "3")).await;
    assert_eq!(status2, StatusCode::OK);
    assert_eq!(json2["status"], "accepted");
    assert_eq!(json2["tx_id"], "tx-2");
    assert_eq!(state.control.lock().unwrap().pending_request_keys(), vec!["tbl_box_prms/MODE/3".to_string()]);
}

#[tokio::test]
async fn setting_outside_the_whitelist_is_rejected() {
    let state = test_state().await;
    let (status, json) = post(state, setting_body("tx-1", "tbl_box_prms", "SA", "1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "not_allowed");
}

#[tokio::test]
async fn mode_outside_its_valid_range_is_rejected() {
    let state = test_state().await;
    let (status, json) = post(state, setting_body("tx-1", "tbl_box_prms", "MODE", "99")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "bad_value");
}

#[tokio::test]
async fn resubmitting_the_same_tx_id_is_a_conflict() {
    let state = test_state().await;
    let (status1, _) = post(Arc::clone(&state), setting_body("tx-1", "tbl_box_prms", "MODE", "3")).await;
    assert_eq!(status1, StatusCode::OK);

    let (status2, json2) = post(state, setting_body("tx-1", "tbl_box_prms", "MODE", "4")).await;
    assert_eq!(status2, StatusCode::CONFLICT);
    assert_eq!(json2["error"], "duplicate_tx_id");
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let state = test_state().await;
    let req = Request::builder().method("GET").uri("/api/does-not-exist").body(Body::empty()).unwrap();
    let resp = routes::build_router(state).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
