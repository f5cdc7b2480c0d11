//! Telemetry publisher (component C): two independent periodic loops per
//! node, each broadcasting a snapshot of local state and swallowing its own
//! failures — the next tick supersedes the last, so nothing here retries.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bus::{format_streams_field, BusEvent, ClusterBus, NodeStatsPayload};

/// Samples local system usage. Implementations are free to use whatever
/// sampling window they like; the publisher only calls this once per tick.
#[async_trait::async_trait]
pub trait SystemStatsCollector: Send + Sync {
    async fn sample(&self) -> NodeStatsPayload;
}

/// Queries the local media server for its currently active streams,
/// already classified into playback vs ingest.
#[async_trait::async_trait]
pub trait StreamsCollector: Send + Sync {
    /// `(playback_ids, ingest_ids)`.
    async fn sample(&self) -> (Vec<String>, Vec<String>);
}

pub struct TelemetryPublisher<S, T> {
    node_id: String,
    bus: Arc<dyn ClusterBus>,
    stats_collector: S,
    streams_collector: T,
    stats_interval: Duration,
    streams_interval: Duration,
}

impl<S, T> TelemetryPublisher<S, T>
where
    S: SystemStatsCollector + 'static,
    T: StreamsCollector + 'static,
{
    #[must_use]
    pub fn new(
        node_id: String,
        bus: Arc<dyn ClusterBus>,
        stats_collector: S,
        streams_collector: T,
        stats_interval: Duration,
        streams_interval: Duration,
    ) -> Self {
        Self {
            node_id,
            bus,
            stats_collector,
            streams_collector,
            stats_interval,
            streams_interval,
        }
    }

    /// Spawn both loops; returns their `JoinHandle`s so `main` can await
    /// them during a graceful shutdown triggered by `cancel_token`.
    pub fn start(self, cancel_token: CancellationToken) -> Vec<tokio::task::JoinHandle<()>>
    where
        S: Send,
        T: Send,
    {
        let node_id = self.node_id;
        let bus = self.bus;
        let stats_collector = Arc::new(self.stats_collector);
        let streams_collector = Arc::new(self.streams_collector);

        let stats_handle = {
            let node_id = node_id.clone();
            let bus = bus.clone();
            let stats_collector = stats_collector.clone();
            let cancel_token = cancel_token.clone();
            let interval = self.stats_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        () = cancel_token.cancelled() => return,
                        _ = ticker.tick() => {
                            let metrics = stats_collector.sample().await;
                            if let Err(e) = bus
                                .broadcast(BusEvent::NodeStats {
                                    node_id: node_id.clone(),
                                    node_metrics: metrics,
                                })
                                .await
                            {
                                warn!(error = %e, "failed to broadcast node stats, will retry next tick");
                            }
                        }
                    }
                }
            })
        };

        let streams_handle = {
            let node_id = node_id.clone();
            let bus = bus.clone();
            let interval = self.streams_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        () = cancel_token.cancelled() => return,
                        _ = ticker.tick() => {
                            let (playback, ingest) = streams_collector.sample().await;
                            let streams = format_streams_field(&playback, &ingest);
                            if let Err(e) = bus
                                .broadcast(BusEvent::NodeStreams {
                                    node_id: node_id.clone(),
                                    streams,
                                })
                                .await
                            {
                                warn!(error = %e, "failed to broadcast node streams, will retry next tick");
                            }
                        }
                    }
                }
            })
        };

        vec![stats_handle, streams_handle]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::registry::Node;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedStats;
    #[async_trait::async_trait]
    impl SystemStatsCollector for FixedStats {
        async fn sample(&self) -> NodeStatsPayload {
            NodeStatsPayload {
                cpu: 1.0,
                ram: 2.0,
                bandwidth: 0.0,
                load5: 0.1,
                lat: 0.0,
                lon: 0.0,
            }
        }
    }

    struct FixedStreams(Arc<AtomicUsize>);
    #[async_trait::async_trait]
    impl StreamsCollector for FixedStreams {
        async fn sample(&self) -> (Vec<String>, Vec<String>) {
            self.0.fetch_add(1, Ordering::SeqCst);
            (vec!["abc".to_string()], vec![])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stats_loop_broadcasts_on_each_tick() {
        let (bus, mut rx) = InMemoryBus::new(Node {
            name: "self".to_string(),
            tags: HashMap::new(),
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let publisher = TelemetryPublisher::new(
            "self".to_string(),
            Arc::new(bus),
            FixedStats,
            FixedStreams(calls.clone()),
            Duration::from_millis(10),
            Duration::from_secs(3600),
        );
        let cancel = CancellationToken::new();
        let handles = publisher.start(cancel.clone());

        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.resource(), "nodeStats");

        cancel.cancel();
        for h in handles {
            let _ = h.await;
        }
    }
}
