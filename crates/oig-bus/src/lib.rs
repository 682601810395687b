//! Bus publisher (C4): the long-lived connection to the local message bus.
//!
//! Wraps `rumqttc`'s split client/event-loop so publish calls never block on
//! network IO: the event loop is driven by a single background task
//! ([`BusPublisher::spawn`]), and everything else talks to it through the
//! cloneable `AsyncClient` plus a small shared state block. Disconnection
//! handling (backoff, queue-on-disconnect, replay) lives in that task, not
//! scattered across callers: one owner mutates the connection, everyone
//! else reads a cheap snapshot.

use anyhow::{Context, Result};
use oig_queue::{PersistentQueue, QueueMeta};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One observed connection state, cheap to poll from any task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Disconnected,
    Connecting,
    Connected,
}

pub type TopicHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct Subscription {
    pattern: String,
    handler: TopicHandler,
}

/// Config for one bus connection.
#[derive(Clone)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub namespace: String,
    pub qos: QoS,
    pub device_id: String,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub replay_rate_per_sec: u32,
}

impl BusConfig {
    pub fn availability_topic(&self) -> String {
        format!("{}/{}/availability", self.namespace, self.device_id)
    }

    pub fn state_topic(&self, table_name: &str) -> String {
        format!("{}/{}/{}/state", self.namespace, self.device_id, table_name)
    }
}

struct Shared {
    state: Mutex<BusState>,
    last_payloads: Mutex<HashMap<String, Vec<u8>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    replaying: AtomicBool,
}

/// Handle shared by every caller; the background task owns the event loop.
#[derive(Clone)]
pub struct BusPublisher {
    client: AsyncClient,
    queue: PersistentQueue,
    config: Arc<BusConfig>,
    shared: Arc<Shared>,
}

impl BusPublisher {
    /// Builds the client, registers the last-will, and spawns the
    /// background event-loop task. Returns immediately; the connection
    /// itself happens asynchronously.
    pub fn spawn(config: BusConfig, queue: PersistentQueue) -> Self {
        let availability_topic = config.availability_topic();
        let mut opts = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }
        opts.set_last_will(LastWill::new(availability_topic, b"offline".to_vec(), config.qos, true));

        let (client, eventloop) = AsyncClient::new(opts, 256);
        let shared = Arc::new(Shared {
            state: Mutex::new(BusState::Connecting),
            last_payloads: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            replaying: AtomicBool::new(false),
        });

        let publisher = Self { client, queue, config: Arc::new(config), shared };
        publisher.clone().spawn_event_loop(eventloop);
        publisher
    }

    fn spawn_event_loop(self, mut eventloop: rumqttc::EventLoop) {
        tokio::spawn(async move {
            let mut backoff = self.config.min_backoff;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff = self.config.min_backoff;
                        *self.shared.state.lock().unwrap() = BusState::Connected;
                        let availability = self.config.availability_topic();
                        let _ = self.client.publish(availability, self.config.qos, true, b"online".to_vec()).await;
                        self.drain_replay().await;
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        self.dispatch(&p.topic, &p.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        *self.shared.state.lock().unwrap() = BusState::Disconnected;
                        tracing::warn!(error = %e, "bus connection lost");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.config.max_backoff);
                    }
                }
            }
        });
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let subs = self.shared.subscriptions.lock().unwrap();
        for sub in subs.iter() {
            if topic_matches(&sub.pattern, topic) {
                (sub.handler)(topic, payload);
            }
        }
    }

    pub fn state(&self) -> BusState {
        *self.shared.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == BusState::Connected
    }

    /// Registers a handler invoked for every incoming message whose topic
    /// matches `pattern` (literal, or using `+` for one wildcard segment).
    pub async fn subscribe(&self, pattern: impl Into<String>, handler: TopicHandler) -> Result<()> {
        let pattern = pattern.into();
        self.client
            .subscribe(&pattern, self.config.qos)
            .await
            .context("bus subscribe")?;
        self.shared.subscriptions.lock().unwrap().push(Subscription { pattern, handler });
        Ok(())
    }

    /// Publishes directly if connected; otherwise durably enqueues for
    /// replay on reconnect.
    pub async fn publish(&self, topic: impl Into<String>, payload: Vec<u8>, retain: bool) -> Result<()> {
        let topic = topic.into();
        if self.is_connected() {
            match self.client.publish(&topic, self.config.qos, retain, payload.clone()).await {
                Ok(()) => {
                    self.remember(&topic, &payload);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "publish failed, enqueueing for replay");
                }
            }
        }
        self.enqueue(&topic, &payload).await
    }

    async fn enqueue(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let envelope = serde_json::json!({ "topic": topic, "payload": payload, "retain": true });
        self.queue
            .enqueue(
                &serde_json::to_vec(&envelope).context("encoding queued publish")?,
                QueueMeta { table_name: "bus_outbox".to_string(), device_id: self.config.device_id.clone() },
            )
            .await
            .map(|_| ())
    }

    /// Remembers the last payload published to `topic`, for optimistic
    /// merges by other components (e.g. the control pipeline).
    fn remember(&self, topic: &str, payload: &[u8]) {
        self.shared.last_payloads.lock().unwrap().insert(topic.to_string(), payload.to_vec());
    }

    pub fn last_published(&self, topic: &str) -> Option<Vec<u8>> {
        self.shared.last_payloads.lock().unwrap().get(topic).cloned()
    }

    /// Drains the outbox oldest-first at the configured pace. A single
    /// publish failure requeues the item (by leaving it in place) and
    /// interrupts the drain; it resumes on the next reconnect.
    async fn drain_replay(&self) {
        if self.shared.replaying.swap(true, Ordering::SeqCst) {
            return;
        }
        let pace = Duration::from_millis(1000 / self.config.replay_rate_per_sec.max(1) as u64);
        loop {
            if !self.is_connected() {
                break;
            }
            let Ok(Some(entry)) = self.queue.peek_next_ready().await else { break };
            let Ok(envelope) = serde_json::from_slice::<serde_json::Value>(&entry.payload) else {
                let _ = self.queue.remove(entry.id).await;
                continue;
            };
            let topic = envelope.get("topic").and_then(|v| v.as_str()).unwrap_or_default();
            let payload: Vec<u8> = envelope
                .get("payload")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|b| b.as_u64()).map(|b| b as u8).collect())
                .unwrap_or_default();
            let retain = envelope.get("retain").and_then(|v| v.as_bool()).unwrap_or(true);

            match self.client.publish(topic, self.config.qos, retain, payload.clone()).await {
                Ok(()) => {
                    self.remember(topic, &payload);
                    let _ = self.queue.remove(entry.id).await;
                }
                Err(e) => {
                    tracing::warn!(topic, error = %e, "replay publish failed, pausing drain");
                    break;
                }
            }
            tokio::time::sleep(pace).await;
        }
        self.shared.replaying.store(false, Ordering::SeqCst);
    }

    pub async fn queue_depth(&self) -> Result<i64> {
        self.queue.size().await
    }
}

/// MQTT-style single-level wildcard match: `+` stands for exactly one
/// topic segment.
fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut p = pattern.split('/');
    let mut t = topic.split('/');
    loop {
        match (p.next(), t.next()) {
            (Some("+"), Some(_)) => continue,
            (Some(a), Some(b)) if a == b => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
