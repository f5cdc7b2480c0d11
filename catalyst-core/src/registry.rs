//! Node registry (component B): the authoritative local view of cluster
//! membership, per-node telemetry, and per-node stream maps.
//!
//! The whole registry sits behind one `parking_lot::Mutex`. Every operation
//! is `O(n)` in the node count and touches only in-memory maps — no I/O is
//! ever performed while the lock is held. `snapshot_fresh` copies out
//! everything a selection needs and releases the lock before the caller does
//! any scoring, sorting, or randomized choice, so telemetry publishers on
//! hundreds of peers never stall a redirect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A cluster member as last observed via membership (gossip join/leave).
/// `Serialize`/`Deserialize` are implemented by hand in `bus` for the
/// heartbeat wire format; this type has one shape, not two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub tags: HashMap<String, String>,
}

impl Node {
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Telemetry sample for one node. All percentages are in `[0, 100]`.
#[derive(Debug, Clone, Copy)]
pub struct NodeMetrics {
    pub cpu: f64,
    pub ram: f64,
    /// Reserved: the upstream source hints at but never computes this.
    /// Always `0.0` unless a future publisher actually supplies it.
    pub bandwidth: f64,
    pub load5: f64,
    pub geo_lat: f64,
    pub geo_lon: f64,
    pub received_at: Instant,
}

impl NodeMetrics {
    fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.received_at) > timeout
    }
}

/// One active stream as reported by a node's `nodeStreams` event.
#[derive(Debug, Clone)]
pub struct Stream {
    pub id: String,
    pub received_at: Instant,
}

impl Stream {
    fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.received_at) > timeout
    }
}

/// Snapshot of one node built for a single selection or lookup, carrying its
/// own copy of everything the selector or source resolver needs. Dropped at
/// the end of the request that built it.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub name: String,
    pub tags: HashMap<String, String>,
    pub metrics: NodeMetrics,
    /// Playback stream ids, normalized (prefix stripped).
    pub playback_streams: Vec<String>,
    /// Ingest stream keys, original (prefix kept).
    pub ingest_streams: Vec<String>,
    pub geo_score: u8,
    pub geo_distance_km: f64,
    pub load_score: u8,
    pub score: u8,
}

impl ScoredNode {
    #[must_use]
    pub fn has_playback_stream(&self, playback_id: &str) -> bool {
        self.playback_streams.iter().any(|s| s == playback_id)
    }
}

/// Strip a `prefix+id` stream key down to its bare playback id. Streams with
/// no `+` are returned unchanged.
#[must_use]
pub fn normalize_playback_key(key: &str) -> &str {
    key.split_once('+').map_or(key, |(_, id)| id)
}

struct Inner {
    nodes: HashMap<String, Node>,
    metrics: HashMap<String, NodeMetrics>,
    playback_streams: HashMap<String, HashMap<String, Stream>>,
    ingest_streams: HashMap<String, HashMap<String, Stream>>,
}

/// Timeouts governing staleness; mirrors `TimeoutConfig` in `config.rs`.
#[derive(Debug, Clone, Copy)]
pub struct RegistryTimeouts {
    pub metric_timeout: Duration,
    pub ingest_stream_timeout: Duration,
}

impl Default for RegistryTimeouts {
    fn default() -> Self {
        Self {
            metric_timeout: Duration::from_secs(16),
            ingest_stream_timeout: Duration::from_secs(16),
        }
    }
}

/// The single coarse-mutex-guarded registry. Cheap to clone (it's an `Arc`
/// around the lock); share one instance across the telemetry publisher, the
/// event intake dispatcher, and every HTTP handler.
#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<Mutex<Inner>>,
    timeouts: RegistryTimeouts,
}

impl NodeRegistry {
    #[must_use]
    pub fn new(timeouts: RegistryTimeouts) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                nodes: HashMap::new(),
                metrics: HashMap::new(),
                playback_streams: HashMap::new(),
                ingest_streams: HashMap::new(),
            })),
            timeouts,
        }
    }

    /// Rebuild the membership map from the gossip layer's current alive set,
    /// garbage-collecting metric and stream entries for names no longer
    /// present. Dropped entries cannot reappear until fresh telemetry
    /// arrives for that name again.
    pub fn replace_membership(&self, members: Vec<Node>) {
        let mut inner = self.inner.lock();
        let keep: std::collections::HashSet<String> =
            members.iter().map(|n| n.name.clone()).collect();

        inner.metrics.retain(|name, _| keep.contains(name));
        inner.playback_streams.retain(|name, _| keep.contains(name));
        inner.ingest_streams.retain(|name, _| keep.contains(name));

        inner.nodes = members.into_iter().map(|n| (n.name.clone(), n)).collect();
    }

    /// Upsert telemetry for `node_name`, creating a bare node entry if one
    /// isn't yet known (tolerates telemetry arriving before membership).
    pub fn record_metrics(&self, node_name: &str, metrics: NodeMetrics) {
        let mut inner = self.inner.lock();
        inner
            .nodes
            .entry(node_name.to_string())
            .or_insert_with(|| Node {
                name: node_name.to_string(),
                tags: HashMap::new(),
            });
        inner.metrics.insert(node_name.to_string(), metrics);
    }

    /// Replace a node's playback and ingest stream maps wholesale. Playback
    /// ids are normalized to their bare form; ingest keys keep any prefix.
    pub fn record_streams(
        &self,
        node_name: &str,
        playback_ids: &[String],
        ingest_ids: &[String],
        now: Instant,
    ) {
        let mut inner = self.inner.lock();

        let playback_map: HashMap<String, Stream> = playback_ids
            .iter()
            .map(|id| {
                let normalized = normalize_playback_key(id).to_string();
                (
                    normalized.clone(),
                    Stream {
                        id: normalized,
                        received_at: now,
                    },
                )
            })
            .collect();
        inner
            .playback_streams
            .insert(node_name.to_string(), playback_map);

        let ingest_map: HashMap<String, Stream> = ingest_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    Stream {
                        id: id.clone(),
                        received_at: now,
                    },
                )
            })
            .collect();
        inner
            .ingest_streams
            .insert(node_name.to_string(), ingest_map);
    }

    /// Snapshot every node with non-stale metrics. `load_score` is filled in
    /// here since it depends only on the metrics snapshot; `geo_score` is
    /// left at `0` and filled in by the selector once it knows the request
    /// coordinates.
    #[must_use]
    pub fn snapshot_fresh(&self) -> Vec<ScoredNode> {
        let inner = self.inner.lock();
        let now = Instant::now();

        inner
            .metrics
            .iter()
            .filter(|(_, m)| !m.is_stale(self.timeouts.metric_timeout, now))
            .filter_map(|(name, metrics)| {
                let node = inner.nodes.get(name)?;

                let playback_streams = inner
                    .playback_streams
                    .get(name)
                    .into_iter()
                    .flat_map(|m| m.iter())
                    .filter(|(_, s)| !s.is_stale(self.timeouts.metric_timeout, now))
                    .map(|(id, _)| id.clone())
                    .collect();

                let ingest_streams = inner
                    .ingest_streams
                    .get(name)
                    .into_iter()
                    .flat_map(|m| m.iter())
                    .filter(|(_, s)| !s.is_stale(self.timeouts.ingest_stream_timeout, now))
                    .map(|(id, _)| id.clone())
                    .collect();

                Some(ScoredNode {
                    name: node.name.clone(),
                    tags: node.tags.clone(),
                    metrics: *metrics,
                    playback_streams,
                    ingest_streams,
                    geo_score: 0,
                    geo_distance_km: 0.0,
                    load_score: load_score(metrics),
                    score: 0,
                })
            })
            .collect()
    }

    /// Find the first node whose fresh ingest map contains `stream_id`.
    /// Used by the source resolver (4.F) prior to entering pull arbitration.
    #[must_use]
    pub fn find_ingest_origin(&self, stream_id: &str) -> Option<String> {
        let inner = self.inner.lock();
        let now = Instant::now();

        inner.ingest_streams.iter().find_map(|(node_name, streams)| {
            streams.get(stream_id).and_then(|s| {
                if s.is_stale(self.timeouts.ingest_stream_timeout, now) {
                    None
                } else {
                    Some(node_name.clone())
                }
            })
        })
    }

    #[must_use]
    pub fn get_tags(&self, node_name: &str) -> Option<HashMap<String, String>> {
        self.inner.lock().nodes.get(node_name).map(|n| n.tags.clone())
    }

    /// Debug dump for `/admin/members`.
    #[must_use]
    pub fn dump_members(&self) -> Vec<Node> {
        self.inner.lock().nodes.values().cloned().collect()
    }
}

/// `0` if any of CPU/RAM/bandwidth is above 85%, `1` above 50%, else `2`.
#[must_use]
pub fn load_score(metrics: &NodeMetrics) -> u8 {
    let worst = metrics.cpu.max(metrics.ram).max(metrics.bandwidth);
    if worst > 85.0 {
        0
    } else if worst > 50.0 {
        1
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Node {
        Node {
            name: name.to_string(),
            tags: HashMap::new(),
        }
    }

    fn metrics(cpu: f64) -> NodeMetrics {
        NodeMetrics {
            cpu,
            ram: 10.0,
            bandwidth: 0.0,
            load5: 0.1,
            geo_lat: 0.0,
            geo_lon: 0.0,
            received_at: Instant::now(),
        }
    }

    #[test]
    fn replace_membership_gcs_dropped_nodes() {
        let reg = NodeRegistry::new(RegistryTimeouts::default());
        reg.replace_membership(vec![node("a"), node("b")]);
        reg.record_metrics("a", metrics(10.0));
        reg.record_metrics("b", metrics(10.0));

        reg.replace_membership(vec![node("a")]);

        let snap = reg.snapshot_fresh();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].name, "a");
    }

    #[test]
    fn stale_metrics_excluded_from_snapshot() {
        let timeouts = RegistryTimeouts {
            metric_timeout: Duration::from_millis(10),
            ingest_stream_timeout: Duration::from_secs(16),
        };
        let reg = NodeRegistry::new(timeouts);
        reg.replace_membership(vec![node("a")]);
        reg.record_metrics("a", metrics(10.0));

        std::thread::sleep(Duration::from_millis(30));

        assert!(reg.snapshot_fresh().is_empty());
    }

    #[test]
    fn record_metrics_idempotent() {
        let reg = NodeRegistry::new(RegistryTimeouts::default());
        let m = metrics(42.0);
        reg.record_metrics("a", m);
        reg.record_metrics("a", m);
        let snap = reg.snapshot_fresh();
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn record_metrics_creates_node_entry_from_late_telemetry() {
        let reg = NodeRegistry::new(RegistryTimeouts::default());
        reg.record_metrics("ghost", metrics(5.0));
        let snap = reg.snapshot_fresh();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].name, "ghost");
    }

    #[test]
    fn ghost_node_disappears_on_next_replace_membership() {
        // Resolution of the open question in SPEC_FULL.md 9: a
        // telemetry-only node is visible until the next replaceMembership,
        // then it is gone unless membership has caught up with it.
        let reg = NodeRegistry::new(RegistryTimeouts::default());
        reg.record_metrics("ghost", metrics(5.0));
        assert_eq!(reg.snapshot_fresh().len(), 1);

        reg.replace_membership(vec![]);
        assert!(reg.snapshot_fresh().is_empty());
    }

    #[test]
    fn normalize_playback_key_strips_prefix() {
        assert_eq!(normalize_playback_key("video+abc"), "abc");
        assert_eq!(normalize_playback_key("abc"), "abc");
    }

    #[test]
    fn record_streams_keeps_ingest_prefix_normalizes_playback() {
        let reg = NodeRegistry::new(RegistryTimeouts::default());
        reg.replace_membership(vec![node("a")]);
        reg.record_metrics("a", metrics(10.0));
        reg.record_streams(
            "a",
            &["video+abc".to_string()],
            &["video+abc".to_string()],
            Instant::now(),
        );

        let snap = reg.snapshot_fresh();
        assert!(snap[0].has_playback_stream("abc"));
        assert!(snap[0].ingest_streams.contains(&"video+abc".to_string()));

        assert_eq!(reg.find_ingest_origin("video+abc"), Some("a".to_string()));
        assert_eq!(reg.find_ingest_origin("abc"), None);
    }

    #[test]
    fn load_score_bands() {
        assert_eq!(load_score(&metrics(10.0)), 2);
        assert_eq!(load_score(&metrics(60.0)), 1);
        assert_eq!(load_score(&metrics(90.0)), 0);
    }
}
