//! Ambient configuration: env vars with an `OIG_` prefix, `.env.local` for
//! dev convenience, and CLI overrides, via the `dotenvy::from_filename` +
//! `clap::Parser` combination.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Online,
    Hybrid,
    Offline,
}

/// Table -> allowed item list, loaded from a JSON file at `control_whitelist`.
pub type WhitelistConfig = BTreeMap<String, Vec<String>>;

#[derive(Parser, Debug, Clone)]
#[command(name = "oig-proxy", about = "BOX-to-cloud protocol proxy")]
pub struct Config {
    #[arg(long, env = "OIG_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,
    #[arg(long, env = "OIG_LISTEN_PORT", default_value_t = 5000)]
    pub listen_port: u16,

    #[arg(long, env = "OIG_CLOUD_HOST")]
    pub cloud_host: String,
    #[arg(long, env = "OIG_CLOUD_PORT", default_value_t = 5000)]
    pub cloud_port: u16,
    #[arg(long, env = "OIG_CONNECT_TIMEOUT_S", default_value_t = 10)]
    pub connect_timeout_s: u64,
    #[arg(long, env = "OIG_ACK_TIMEOUT_S", default_value_t = 15)]
    pub ack_timeout_s: u64,
    #[arg(long, env = "OIG_MIN_RECONNECT_S", default_value_t = 1)]
    pub min_reconnect_s: u64,
    #[arg(long, env = "OIG_MAX_RECONNECT_S", default_value_t = 60)]
    pub max_reconnect_s: u64,

    #[arg(long, env = "OIG_PROXY_MODE", value_enum, default_value_t = ProxyMode::Hybrid)]
    pub proxy_mode: ProxyMode,
    #[arg(long, env = "OIG_HYBRID_FAIL_THRESHOLD", default_value_t = 3)]
    pub hybrid_fail_threshold: u32,
    #[arg(long, env = "OIG_HYBRID_RETRY_INTERVAL_S", default_value_t = 60)]
    pub hybrid_retry_interval_s: u64,
    #[arg(long, env = "OIG_HYBRID_CONNECT_TIMEOUT_S", default_value_t = 10)]
    pub hybrid_connect_timeout_s: u64,

    #[arg(long, env = "OIG_MQTT_QUEUE_DB_PATH", default_value = "./data/queue.sqlite")]
    pub mqtt_queue_db_path: String,
    #[arg(long, env = "OIG_MQTT_QUEUE_MAX_SIZE", default_value_t = 1000)]
    pub mqtt_queue_max_size: i64,
    #[arg(long, env = "OIG_MQTT_REPLAY_RATE", default_value_t = 10)]
    pub mqtt_replay_rate: u32,

    #[arg(long, env = "OIG_MQTT_HOST", default_value = "localhost")]
    pub mqtt_host: String,
    #[arg(long, env = "OIG_MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,
    #[arg(long, env = "OIG_MQTT_USER")]
    pub mqtt_user: Option<String>,
    #[arg(long, env = "OIG_MQTT_PASS")]
    pub mqtt_pass: Option<String>,
    #[arg(long, env = "OIG_MQTT_NAMESPACE", default_value = "oig_local")]
    pub mqtt_namespace: String,
    #[arg(long, env = "OIG_MQTT_QOS", default_value_t = 1)]
    pub mqtt_qos: u8,

    #[arg(long, env = "OIG_STATUS_INTERVAL_S", default_value_t = 60)]
    pub status_interval_s: u64,
    /// Bypasses the 60s status-interval floor when explicitly set.
    #[arg(long, env = "OIG_STATUS_INTERVAL_OVERRIDE", default_value_t = false)]
    pub status_interval_override: bool,

    #[arg(long, env = "OIG_CONTROL_WHITELIST_PATH", default_value = "./config/control_whitelist.json")]
    pub control_whitelist_path: String,
    #[arg(long, env = "OIG_CONTROL_MAX_ATTEMPTS", default_value_t = 3)]
    pub control_max_attempts: u32,
    #[arg(long, env = "OIG_CONTROL_RETRY_DELAY_S", default_value_t = 10)]
    pub control_retry_delay_s: u64,
    #[arg(long, env = "OIG_CONTROL_BOX_READY_S", default_value_t = 30)]
    pub control_box_ready_s: u64,
    #[arg(long, env = "OIG_CONTROL_ACK_TIMEOUT_S", default_value_t = 20)]
    pub control_ack_timeout_s: u64,
    #[arg(long, env = "OIG_CONTROL_APPLIED_TIMEOUT_S", default_value_t = 60)]
    pub control_applied_timeout_s: u64,
    #[arg(long, env = "OIG_CONTROL_MODE_QUIET_S", default_value_t = 30)]
    pub control_mode_quiet_s: u64,

    #[arg(long, env = "OIG_DATA_DIR", default_value = "./data")]
    pub data_dir: String,
}

impl Config {
    /// Loads `.env.local` (if present, silently ignored otherwise) then
    /// parses CLI args merged with environment variables.
    pub fn load() -> Self {
        let _ = dotenvy::from_filename(".env.local");
        Config::parse()
    }

    pub fn load_whitelist(&self) -> Result<WhitelistConfig> {
        load_whitelist_file(&self.control_whitelist_path)
    }
}

fn load_whitelist_file(path: impl AsRef<Path>) -> Result<WhitelistConfig> {
    let bytes = std::fs::read(path.as_ref())
        .with_context(|| format!("reading control whitelist at {}", path.as_ref().display()))?;
    serde_json::from_slice(&bytes).context("parsing control whitelist json")
}

/// `tracing` + `EnvFilter`, defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
