//! The external stream directory (SPEC_FULL.md 6): an optional collaborator
//! that knows where a stream's pull source lives and arbitrates pull leases
//! across the fleet. Modeled as a trait so tests can inject a fixture and so
//! deployments without a directory (fully push-fed fleets) can plug in
//! `NullDirectory`.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// What the directory knows about one stream.
#[derive(Debug, Clone)]
pub struct DirectoryStream {
    pub pull_url: Option<String>,
    pub pull_region: Option<String>,
    /// Marked active by the control plane independent of whether a pull URL
    /// is configured — a stream can be "active" purely as a push target.
    pub active: bool,
    pub suspended: bool,
    pub deleted: bool,
}

#[async_trait]
pub trait StreamDirectory: Send + Sync {
    async fn get_stream_by_playback_id(&self, playback_id: &str) -> Result<Option<DirectoryStream>>;

    /// Acquire a pull lease. `Ok(true)` = granted, `Ok(false)` = denied
    /// (someone else holds it) — not an error, just contention.
    async fn lock_pull(&self, stream_id: &str, lease_dur: Duration, own_node_name: &str) -> Result<bool>;
}

/// No directory configured: every lookup reports "not found", which the
/// arbitration logic in `source.rs` treats as a plain viewer miss
/// (`push://`), never an error.
pub struct NullDirectory;

#[async_trait]
impl StreamDirectory for NullDirectory {
    async fn get_stream_by_playback_id(&self, _playback_id: &str) -> Result<Option<DirectoryStream>> {
        Ok(None)
    }

    async fn lock_pull(&self, _stream_id: &str, _lease_dur: Duration, _own_node_name: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Redis-lease-backed directory wrapping a caller-supplied stream lookup.
/// The lookup itself is deployment-specific (it names an external system
/// this core does not own); the lease arbitration is the part this core
/// implements concretely per SPEC_FULL.md 10.7.
pub struct LeasedDirectory<L> {
    lookup: L,
    leases: crate::lease::LeaseManager,
}

/// The half of the directory contract this core does not own: resolving a
/// playback id to stream metadata from whatever control plane tracks it.
#[async_trait]
pub trait StreamLookup: Send + Sync {
    async fn lookup(&self, playback_id: &str) -> Result<Option<DirectoryStream>>;
}

impl<L: StreamLookup> LeasedDirectory<L> {
    #[must_use]
    pub fn new(lookup: L, leases: crate::lease::LeaseManager) -> Self {
        Self { lookup, leases }
    }
}

#[async_trait]
impl<L: StreamLookup> StreamDirectory for LeasedDirectory<L> {
    async fn get_stream_by_playback_id(&self, playback_id: &str) -> Result<Option<DirectoryStream>> {
        self.lookup.lookup(playback_id).await
    }

    async fn lock_pull(&self, stream_id: &str, lease_dur: Duration, own_node_name: &str) -> Result<bool> {
        let lease = self.leases.acquire(stream_id, lease_dur, own_node_name).await?;
        Ok(lease.is_some())
    }
}
