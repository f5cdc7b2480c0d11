//! Source resolver (component F): finds the ingest-origin node for a
//! stream, or runs one attempt of the stream-pull arbitration when no
//! origin exists yet. The retry loop around this (component H) lives at the
//! HTTP edge, since it is the `STREAM_SOURCE` handler that owns the retry
//! budget and request cancellation.

use std::time::Duration;

use rand::seq::IteratorRandom;

use crate::bus::ClusterBus;
use crate::directory::{DirectoryStream, StreamDirectory};
use crate::error::{Error, Result};
use crate::registry::NodeRegistry;

/// `mistSource(streamID, lat, lon)`. `lat`/`lon` are accepted for interface
/// parity with the spec but unused by the lookup itself — ingest-origin
/// scanning is not geo-scored, only the pull-arbitration wakeup below picks
/// a peer by region.
///
/// Returns the owning node's *name*, not a DTSC URL: resolving an in-cluster
/// node name to its advertised `dtsc` tag is node-URL resolution, which the
/// HTTP edge (component H) applies uniformly to every non-error response
/// (SPEC_FULL.md 4.H), not a concern of the resolver itself.
#[must_use]
pub fn mist_source(registry: &NodeRegistry, stream_id: &str) -> Option<String> {
    registry.find_ingest_origin(stream_id)
}

/// Outcome of one pull-arbitration attempt, handed back to the 4.H retry
/// loop to interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// Stream truly has no source; instruct the media server to expect a
    /// push rather than retrying.
    Push,
    /// Lease granted; pull from this URL.
    Pull(String),
}

/// One attempt at resolving a stream with no current ingest origin.
///
/// `peers_in_region` and `wake_peer` let the caller supply how to discover
/// and poke a peer in the stream's pinned region without this module
/// depending on an HTTP client directly — `wake_peer` is fire-and-forget,
/// its result is not awaited for correctness.
pub async fn arbitrate_pull(
    directory: &dyn StreamDirectory,
    stream_id: &str,
    playback_id: &str,
    own_region: &str,
    own_node_name: &str,
    lease_dur: Duration,
    bus: &dyn ClusterBus,
    wake_peer: impl FnOnce(String),
) -> Result<PullOutcome> {
    let stream = directory.get_stream_by_playback_id(playback_id).await?;

    let Some(stream) = stream else {
        return Ok(PullOutcome::Push);
    };

    if stream.deleted {
        return Err(Error::StreamDeleted);
    }
    if stream.suspended {
        return Err(Error::StreamSuspended);
    }

    // No pull URL configured: whether the stream is active or not, this
    // resolves to the same response (SPEC_FULL.md 4.F) — "marked active"
    // instructs the media server to expect a push, and "viewer miss"
    // (not otherwise active) responds identically, since both mean there is
    // no pull source to arbitrate over. `stream.active` is kept on
    // `DirectoryStream` because directories report it independent of
    // `pull_url`; it carries no further branching here.
    let Some(pull_url) = stream.pull_url.clone() else {
        return Ok(PullOutcome::Push);
    };

    if let Some(pull_region) = stream.pull_region.as_deref() {
        if pull_region != own_region {
            if let Ok(members) = bus.members().await {
                if let Some(peer) = members
                    .iter()
                    .filter(|n| n.tag("region") == Some(pull_region) && n.name != own_node_name)
                    .map(|n| n.name.clone())
                    .choose(&mut rand::thread_rng())
                {
                    wake_peer(peer);
                }
            }
            return Err(Error::WrongRegion {
                pull_region: pull_region.to_string(),
                own_region: own_region.to_string(),
            });
        }
    }

    if directory.lock_pull(stream_id, lease_dur, own_node_name).await? {
        Ok(PullOutcome::Pull(pull_url))
    } else {
        Err(Error::LockDenied(stream_id.to_string()))
    }
}

/// `true` for the stream names the media server uses for VOD/transcoder
/// internals (SPEC_FULL.md 4.H) — these never enter pull arbitration, they
/// keep the media server's own configured input.
#[must_use]
pub fn is_internal_stream_name(stream_id: &str) -> bool {
    stream_id.starts_with("catalyst_vod_") || stream_id.starts_with("tr_src_")
}

/// Helper used by fixtures/tests to build a `DirectoryStream` quickly.
#[cfg(test)]
#[must_use]
pub fn fixture_stream(pull_url: Option<&str>, pull_region: Option<&str>) -> DirectoryStream {
    DirectoryStream {
        pull_url: pull_url.map(str::to_string),
        pull_region: pull_region.map(str::to_string),
        active: true,
        suspended: false,
        deleted: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::registry::{Node, NodeMetrics, RegistryTimeouts};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    struct FixtureDirectory {
        stream: Option<DirectoryStream>,
        lock_granted: bool,
    }

    #[async_trait]
    impl StreamDirectory for FixtureDirectory {
        async fn get_stream_by_playback_id(&self, _playback_id: &str) -> Result<Option<DirectoryStream>> {
            Ok(self.stream.clone())
        }

        async fn lock_pull(&self, _stream_id: &str, _lease_dur: Duration, _own_node_name: &str) -> Result<bool> {
            Ok(self.lock_granted)
        }
    }

    #[test]
    fn mist_source_hits_ingest_map() {
        let reg = NodeRegistry::new(RegistryTimeouts::default());
        reg.replace_membership(vec![Node {
            name: "D".to_string(),
            tags: HashMap::from([("dtsc".to_string(), "dtsc://d.int".to_string())]),
        }]);
        reg.record_metrics(
            "D",
            NodeMetrics {
                cpu: 1.0,
                ram: 1.0,
                bandwidth: 0.0,
                load5: 0.0,
                geo_lat: 0.0,
                geo_lon: 0.0,
                received_at: Instant::now(),
            },
        );
        reg.record_streams("D", &[], &["video+xyz".to_string()], Instant::now());

        assert_eq!(mist_source(&reg, "video+xyz"), Some("D".to_string()));
        assert_eq!(mist_source(&reg, "video+other"), None);
    }

    #[test]
    fn internal_stream_names_never_pulled() {
        assert!(is_internal_stream_name("catalyst_vod_123"));
        assert!(is_internal_stream_name("tr_src_abc"));
        assert!(!is_internal_stream_name("video+abc"));
    }

    #[tokio::test]
    async fn arbitrate_pull_not_found_is_push() {
        let directory = FixtureDirectory {
            stream: None,
            lock_granted: true,
        };
        let (bus, _rx) = InMemoryBus::new(Node {
            name: "self".to_string(),
            tags: HashMap::new(),
        });
        let outcome = arbitrate_pull(
            &directory,
            "video+xyz",
            "xyz",
            "us",
            "self",
            Duration::from_secs(30),
            &bus,
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(outcome, PullOutcome::Push);
    }

    #[tokio::test]
    async fn arbitrate_pull_wrong_region_wakes_a_peer() {
        let directory = FixtureDirectory {
            stream: Some(fixture_stream(Some("https://eu1/ingest"), Some("eu"))),
            lock_granted: true,
        };
        let (bus, _rx) = InMemoryBus::new(Node {
            name: "self".to_string(),
            tags: HashMap::new(),
        });
        let woken: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let woken_clone = woken.clone();

        let result = arbitrate_pull(
            &directory,
            "video+xyz",
            "xyz",
            "us",
            "self",
            Duration::from_secs(30),
            &bus,
            move |peer| woken_clone.lock().unwrap().push(peer),
        )
        .await;

        assert!(matches!(result, Err(Error::WrongRegion { .. })));
    }

    #[tokio::test]
    async fn arbitrate_pull_same_region_lock_denied_is_retryable() {
        let directory = FixtureDirectory {
            stream: Some(fixture_stream(Some("https://us1/ingest"), Some("us"))),
            lock_granted: false,
        };
        let (bus, _rx) = InMemoryBus::new(Node {
            name: "self".to_string(),
            tags: HashMap::new(),
        });
        let result = arbitrate_pull(
            &directory,
            "video+xyz",
            "xyz",
            "us",
            "self",
            Duration::from_secs(30),
            &bus,
            |_| {},
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.is_wrong_region());
    }

    #[tokio::test]
    async fn arbitrate_pull_granted_lease_returns_pull_url() {
        let directory = FixtureDirectory {
            stream: Some(fixture_stream(Some("https://us1/ingest"), Some("us"))),
            lock_granted: true,
        };
        let (bus, _rx) = InMemoryBus::new(Node {
            name: "self".to_string(),
            tags: HashMap::new(),
        });
        let outcome = arbitrate_pull(
            &directory,
            "video+xyz",
            "xyz",
            "us",
            "self",
            Duration::from_secs(30),
            &bus,
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(outcome, PullOutcome::Pull("https://us1/ingest".to_string()));
    }

    #[tokio::test]
    async fn arbitrate_pull_suspended_and_deleted_are_permanent_errors() {
        let (bus, _rx) = InMemoryBus::new(Node {
            name: "self".to_string(),
            tags: HashMap::new(),
        });

        let directory = FixtureDirectory {
            stream: Some(DirectoryStream {
                suspended: true,
                ..fixture_stream(None, None)
            }),
            lock_granted: true,
        };
        let result = arbitrate_pull(&directory, "a", "a", "us", "self", Duration::from_secs(1), &bus, |_| {}).await;
        assert!(matches!(result, Err(Error::StreamSuspended)));

        let directory = FixtureDirectory {
            stream: Some(DirectoryStream {
                deleted: true,
                ..fixture_stream(None, None)
            }),
            lock_granted: true,
        };
        let result = arbitrate_pull(&directory, "a", "a", "us", "self", Duration::from_secs(1), &bus, |_| {}).await;
        assert!(matches!(result, Err(Error::StreamDeleted)));
    }
}
