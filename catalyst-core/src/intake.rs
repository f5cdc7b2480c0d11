//! Event intake (component D): drains the cluster bus and mutates the
//! registry. Runs as a single-threaded dispatcher per process; overflow is
//! dropped with a warning rather than buffered unbounded — `tokio::sync`'s
//! broadcast channel already gives us this for free via `Lagged`.

use std::time::Instant;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bus::{parse_streams_field, BusEvent};
use crate::registry::NodeRegistry;

/// A higher-level handler for the `stream`/`nuke` resources, which this
/// core forwards but does not interpret itself (SPEC_FULL.md 4.D).
pub trait ForwardedEventHandler: Send + Sync {
    fn on_stream(&self, playback_id: &str);
    fn on_nuke(&self, playback_id: &str);
}

pub struct NoopForwardedEventHandler;
impl ForwardedEventHandler for NoopForwardedEventHandler {
    fn on_stream(&self, _playback_id: &str) {}
    fn on_nuke(&self, _playback_id: &str) {}
}

/// Apply one bus event to the registry (or forward it). Exposed standalone
/// so tests and the dispatch loop share the exact same dispatch logic.
pub fn dispatch(registry: &NodeRegistry, handler: &dyn ForwardedEventHandler, event: BusEvent) {
    match event {
        BusEvent::NodeStats { node_id, node_metrics } => {
            registry.record_metrics(
                &node_id,
                crate::registry::NodeMetrics {
                    cpu: node_metrics.cpu,
                    ram: node_metrics.ram,
                    bandwidth: node_metrics.bandwidth,
                    load5: node_metrics.load5,
                    geo_lat: node_metrics.lat,
                    geo_lon: node_metrics.lon,
                    received_at: Instant::now(),
                },
            );
        }
        BusEvent::NodeStreams { node_id, streams } => {
            let (playback, ingest) = parse_streams_field(&streams);
            registry.record_streams(&node_id, &playback, &ingest, Instant::now());
        }
        BusEvent::Stream { playback_id } => handler.on_stream(&playback_id),
        BusEvent::Nuke { playback_id } => handler.on_nuke(&playback_id),
    }
}

/// Run the dispatcher loop until cancelled. A `Lagged` error from the
/// channel means events were dropped under overflow; log once per
/// occurrence and keep draining from where the channel resumes us.
pub fn spawn_dispatcher(
    registry: NodeRegistry,
    mut events: broadcast::Receiver<BusEvent>,
    handler: std::sync::Arc<dyn ForwardedEventHandler>,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => return,
                result = events.recv() => {
                    match result {
                        Ok(event) => dispatch(&registry, handler.as_ref(), event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event intake overflow, dropped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryTimeouts;

    #[test]
    fn node_stats_event_updates_registry() {
        let registry = NodeRegistry::new(RegistryTimeouts::default());
        dispatch(
            &registry,
            &NoopForwardedEventHandler,
            BusEvent::NodeStats {
                node_id: "a".to_string(),
                node_metrics: crate::bus::NodeStatsPayload {
                    cpu: 5.0,
                    ram: 5.0,
                    bandwidth: 0.0,
                    load5: 0.1,
                    lat: 1.0,
                    lon: 2.0,
                },
            },
        );
        let snap = registry.snapshot_fresh();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].name, "a");
    }

    #[test]
    fn node_streams_event_splits_playback_and_ingest() {
        let registry = NodeRegistry::new(RegistryTimeouts::default());
        dispatch(
            &registry,
            &NoopForwardedEventHandler,
            BusEvent::NodeStats {
                node_id: "a".to_string(),
                node_metrics: crate::bus::NodeStatsPayload {
                    cpu: 5.0,
                    ram: 5.0,
                    bandwidth: 0.0,
                    load5: 0.1,
                    lat: 0.0,
                    lon: 0.0,
                },
            },
        );
        dispatch(
            &registry,
            &NoopForwardedEventHandler,
            BusEvent::NodeStreams {
                node_id: "a".to_string(),
                streams: "abc|def~video+abc".to_string(),
            },
        );
        let snap = registry.snapshot_fresh();
        assert!(snap[0].has_playback_stream("abc"));
        assert!(snap[0].has_playback_stream("def"));
        assert!(snap[0].ingest_streams.contains(&"video+abc".to_string()));
    }
}
