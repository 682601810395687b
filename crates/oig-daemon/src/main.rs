//! Entry point: loads configuration, builds every subsystem, runs the
//! orchestrator's start sequence, serves the control HTTP endpoint, and
//! waits for a shutdown signal.

use anyhow::{Context, Result};
use oig_box::{BoxListenerConfig, BoxWriterHandle};
use oig_bus::{BusConfig, BusPublisher};
use oig_cloud::CloudSession;
use oig_config::{Config, ProxyMode};
use oig_control::{ControlPipeline, ControlPipelineConfig, Whitelist};
use oig_daemon::{orchestrator, routes, state::AppState};
use oig_hybrid::{ConfiguredMode, HybridState};
use oig_persist::{PrmsSnapshot, SnapshotStore};
use oig_queue::PersistentQueue;
use rumqttc::QoS;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// `device_id` is only learned from the BOX's first live frame, but
/// `BusConfig` needs one at construction time for topic naming. Topics
/// scoped by device id are wrong until a restart picks up the real value
/// learned during this run; state/discovery topics published after the
/// device id is known use the real id directly instead of going through
/// `BusConfig`.
const PLACEHOLDER_DEVICE_ID: &str = "pending";

#[tokio::main]
async fn main() -> Result<()> {
    oig_config::init_tracing();
    let config = Config::load();
    let whitelist_raw = config.load_whitelist().context("loading control whitelist")?;

    std::fs::create_dir_all(&config.data_dir).context("creating data directory")?;

    let configured_mode = match config.proxy_mode {
        ProxyMode::Online => ConfiguredMode::Online,
        ProxyMode::Hybrid => ConfiguredMode::Hybrid,
        ProxyMode::Offline => ConfiguredMode::Offline,
    };

    let hybrid = Arc::new(Mutex::new(HybridState::new(
        configured_mode,
        config.hybrid_fail_threshold,
        Duration::from_secs(config.hybrid_retry_interval_s),
    )));

    let cloud = Arc::new(CloudSession::new(
        config.cloud_host.clone(),
        config.cloud_port,
        Duration::from_secs(config.connect_timeout_s),
        Duration::from_secs(config.min_reconnect_s),
        Duration::from_secs(config.max_reconnect_s),
        1 << 20,
    ));

    let queue = PersistentQueue::open(&config.mqtt_queue_db_path, config.mqtt_queue_max_size)
        .await
        .context("opening persistent queue")?;

    let bus_config = BusConfig {
        host: config.mqtt_host.clone(),
        port: config.mqtt_port,
        client_id: "oig-proxy".to_string(),
        username: config.mqtt_user.clone(),
        password: config.mqtt_pass.clone(),
        namespace: config.mqtt_namespace.clone(),
        qos: qos_from(config.mqtt_qos),
        device_id: PLACEHOLDER_DEVICE_ID.to_string(),
        min_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(60),
        replay_rate_per_sec: config.mqtt_replay_rate,
    };
    let bus = BusPublisher::spawn(bus_config.clone(), queue);

    let whitelist = Whitelist::new(whitelist_raw.into_iter().map(|(table, items)| (table, items)));
    let writer_handle = BoxWriterHandle::default();

    let control_config = ControlPipelineConfig {
        max_attempts: config.control_max_attempts,
        retry_delay: Duration::from_secs(config.control_retry_delay_s),
        box_ready_s: Duration::from_secs(config.control_box_ready_s),
        ack_timeout: Duration::from_secs(config.control_ack_timeout_s),
        applied_timeout: Duration::from_secs(config.control_applied_timeout_s),
        mode_quiet: Duration::from_secs(config.control_mode_quiet_s),
    };
    let control = ControlPipeline::new(control_config, whitelist, writer_handle.clone())
        .with_persistence(&config.data_dir);

    let snapshots = Arc::new(SnapshotStore::new(&config.data_dir));

    let state = Arc::new(AppState {
        session_id: Uuid::new_v4().to_string(),
        started_at: Instant::now(),
        bus: bus.clone(),
        cloud: Arc::clone(&cloud),
        hybrid: Arc::clone(&hybrid),
        control: Arc::new(Mutex::new(control)),
        box_writer: writer_handle.clone(),
        snapshots: Arc::clone(&snapshots),
        device_id: Mutex::new(None),
        table_cache: Mutex::new(BTreeMap::new()),
        mode_snapshot: Mutex::new(None),
        prms_snapshot: Mutex::new(PrmsSnapshot::default()),
        box_connected: AtomicBool::new(false),
        box_connected_since: Mutex::new(None),
        last_box_data_at: Mutex::new(None),
        namespace: config.mqtt_namespace.clone(),
        isnewset_polls: std::sync::atomic::AtomicU64::new(0),
        isnewset_last_poll: Mutex::new(None),
        isnewset_last_response: Mutex::new(None),
        seen_http_tx_ids: Mutex::new(Default::default()),
        cloud_connected_cache: AtomicBool::new(false),
        cloud_stats_cache: Mutex::new(oig_cloud::CloudStats::default()),
        bus_queue_depth_cache: AtomicI64::new(0),
    });

    orchestrator::load_snapshots(&state);
    orchestrator::spawn_control_subscription(Arc::clone(&state)).await.context("subscribing to control/set")?;

    let box_listener_config = BoxListenerConfig {
        bind_addr: format!("{}:{}", config.listen_host, config.listen_port),
        idle_timeout: Duration::from_secs(120),
        ack_timeout: Duration::from_secs(config.ack_timeout_s),
    };
    orchestrator::spawn_box_listener(
        Arc::clone(&state),
        Arc::clone(&hybrid),
        Arc::clone(&cloud),
        box_listener_config,
        writer_handle,
    );

    let status_interval =
        oig_status::effective_interval(Duration::from_secs(config.status_interval_s), config.status_interval_override);
    let status_state = Arc::clone(&state);
    oig_status::spawn(
        oig_status::StatusReporterConfig {
            interval: status_interval,
            topic: format!("{}/{}/proxy_status", config.mqtt_namespace, PLACEHOLDER_DEVICE_ID),
            attrs_topic: format!("{}/{}/proxy_status/attrs", config.mqtt_namespace, PLACEHOLDER_DEVICE_ID),
        },
        bus.clone(),
        Arc::new(move || build_status_snapshot(&status_state)),
    );

    orchestrator::spawn_control_ticker(Arc::clone(&state), Duration::from_secs(5));
    orchestrator::spawn_bus_health_loop(Arc::clone(&state), Duration::from_secs(30));
    orchestrator::spawn_stats_cache_loop(Arc::clone(&state), Duration::from_secs(5));
    spawn_discovery_once_device_known(Arc::clone(&state), bus_config.clone());

    let router = routes::build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", 8090)).await.context("binding control http endpoint")?;
    let serve_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "control http endpoint terminated");
        }
        let _ = &serve_state;
    });

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    orchestrator::shutdown(&state).await;
    Ok(())
}

/// Polls until the box listener learns a device id, then publishes the
/// discovery config payloads once. Discovery topics are keyed by the real
/// device id, unlike `proxy_status`'s topic which is fixed at startup.
fn spawn_discovery_once_device_known(state: Arc<AppState>, bus_config: BusConfig) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        loop {
            ticker.tick().await;
            if state.device_id().is_some() {
                orchestrator::publish_discovery(&state, &bus_config).await;
                orchestrator::republish_restored_state(&state).await;
                break;
            }
        }
    });
}

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn build_status_snapshot(state: &Arc<AppState>) -> oig_status::StatusSnapshot {
    let hybrid = state.hybrid.lock().unwrap();
    let control = state.control.lock().unwrap();
    let cloud_stats = *state.cloud_stats_cache.lock().unwrap();
    oig_status::StatusSnapshot {
        configured_mode: format!("{:?}", hybrid.configured_mode()).to_lowercase(),
        runtime_mode: format!("{:?}", hybrid.runtime_mode()).to_lowercase(),
        control_session_id: state.session_id.clone(),
        device_id: state.device_id(),
        box_connected: state.box_connected.load(std::sync::atomic::Ordering::SeqCst),
        cloud_connected: state.cloud_connected_cache.load(std::sync::atomic::Ordering::SeqCst),
        cloud_connects: cloud_stats.connects,
        cloud_disconnects: cloud_stats.disconnects,
        cloud_timeouts: cloud_stats.timeouts,
        cloud_errors: cloud_stats.errors,
        bus_queue_depth: state.bus_queue_depth_cache.load(std::sync::atomic::Ordering::SeqCst),
        last_data_recent: state
            .last_box_data_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed() < Duration::from_secs(30))
            .unwrap_or(false),
        control_queue_request_keys: control.pending_request_keys(),
        control_inflight: control.inflight_descriptor(),
        isnewset_polls: Some(state.isnewset_polls.load(std::sync::atomic::Ordering::SeqCst)),
        isnewset_last_poll: state.isnewset_last_poll.lock().unwrap().clone(),
        isnewset_last_response: state.isnewset_last_response.lock().unwrap().clone(),
    }
}
