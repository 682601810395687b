//! Status reporter (C11): periodic retained status snapshot plus a one-line
//! heartbeat. A plain serializable struct is built fresh each tick and
//! published over a cheap publish call rather than held behind a
//! long-lived lock.

use oig_bus::BusPublisher;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// The source's 60s floor appears arbitrary but is preserved for
/// compatibility; it only yields to an explicit operator override.
pub const DEFAULT_STATUS_FLOOR: Duration = Duration::from_secs(60);

pub fn effective_interval(requested: Duration, explicit_override: bool) -> Duration {
    if explicit_override {
        requested
    } else {
        requested.max(DEFAULT_STATUS_FLOOR)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub configured_mode: String,
    pub runtime_mode: String,
    pub control_session_id: String,
    pub device_id: Option<String>,
    pub box_connected: bool,
    pub cloud_connected: bool,
    pub cloud_connects: u64,
    pub cloud_disconnects: u64,
    pub cloud_timeouts: u64,
    pub cloud_errors: u64,
    pub bus_queue_depth: i64,
    pub last_data_recent: bool,
    pub control_queue_request_keys: Vec<String>,
    pub control_inflight: Option<String>,
    /// Diagnostic-only counters, not named by the minimum field list but
    /// not excluded by it either.
    pub isnewset_polls: Option<u64>,
    pub isnewset_last_poll: Option<String>,
    pub isnewset_last_response: Option<String>,
}

/// Compact companion payload (`proxy_status/attrs`) for cheap polling
/// without parsing the full snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatusAttrs {
    pub control_inflight_key: Option<String>,
    pub control_queue_keys: Vec<String>,
}

impl From<&StatusSnapshot> for StatusAttrs {
    fn from(snap: &StatusSnapshot) -> Self {
        Self {
            control_inflight_key: snap.control_inflight.clone(),
            control_queue_keys: snap.control_queue_request_keys.clone(),
        }
    }
}

pub struct StatusReporterConfig {
    pub interval: Duration,
    pub topic: String,
    pub attrs_topic: String,
}

/// Spawns the periodic loop. `source` is re-invoked every tick so the
/// snapshot always reflects current state rather than a captured copy.
pub fn spawn(
    config: StatusReporterConfig,
    bus: BusPublisher,
    source: Arc<dyn Fn() -> StatusSnapshot + Send + Sync>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        loop {
            ticker.tick().await;
            let snapshot = source();
            tracing::info!(
                runtime_mode = %snapshot.runtime_mode,
                box_connected = snapshot.box_connected,
                cloud_connected = snapshot.cloud_connected,
                bus_queue_depth = snapshot.bus_queue_depth,
                control_inflight = ?snapshot.control_inflight,
                "proxy heartbeat"
            );
            match serde_json::to_vec(&snapshot) {
                Ok(payload) => {
                    if let Err(e) = bus.publish(config.topic.clone(), payload, true).await {
                        tracing::warn!(error = %e, "failed to publish status snapshot");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize status snapshot"),
            }
            match serde_json::to_vec(&StatusAttrs::from(&snapshot)) {
                Ok(payload) => {
                    if let Err(e) = bus.publish(config.attrs_topic.clone(), payload, true).await {
                        tracing::warn!(error = %e, "failed to publish status attrs");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize status attrs"),
            }
        }
    })
}
