//! Distributed stream-pull lease (SPEC_FULL.md 10.7), backing the external
//! stream directory's `lockPull(streamID, leaseDur, ownNodeName)` capability
//! named in 4.F. Grounded on this workspace's existing Redis `SET NX EX` +
//! Lua-guarded-release distributed lock pattern, scoped down to the single
//! operation the source resolver needs.

use std::time::Duration;

use redis::AsyncCommands;

use crate::error::{Error, Result};

/// Releases only if the stored value still matches what we wrote, so a
/// lease that already expired and was re-acquired by someone else is never
/// clobbered by a late release from the original holder.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

pub struct LeaseManager {
    client: redis::Client,
}

/// A held lease; dropping it does not release it — call `release` (or let
/// the TTL expire) explicitly, since release requires an async round trip.
pub struct Lease {
    key: String,
    value: String,
}

impl LeaseManager {
    pub fn new(redis_url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url).map_err(Error::Redis)?,
        })
    }

    /// Attempt to acquire the pull lease for `stream_id`. Returns `None`
    /// (lock denied) rather than an error when someone else already holds
    /// it — this is the normal contention path, not a failure.
    pub async fn acquire(
        &self,
        stream_id: &str,
        lease_dur: Duration,
        own_node_name: &str,
    ) -> Result<Option<Lease>> {
        let key = lease_key(stream_id);
        let value = format!("{own_node_name}:{}", nanoid::nanoid!(8));
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(Error::Redis)?;

        let ttl_secs = lease_dur.as_secs().max(1);
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(Error::Redis)?;

        Ok(acquired.map(|_| Lease { key, value }))
    }

    pub async fn release(&self, lease: &Lease) -> Result<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(Error::Redis)?;

        let script = redis::Script::new(RELEASE_SCRIPT);
        let released: i32 = script
            .key(&lease.key)
            .arg(&lease.value)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::Redis)?;

        Ok(released == 1)
    }

    /// Extend the TTL of a lease we still hold, for long-running pulls.
    pub async fn extend(&self, lease: &Lease, extra: Duration) -> Result<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(Error::Redis)?;

        const EXTEND_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('EXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
";
        let script = redis::Script::new(EXTEND_SCRIPT);
        let extended: i32 = script
            .key(&lease.key)
            .arg(&lease.value)
            .arg(extra.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(Error::Redis)?;

        Ok(extended == 1)
    }
}

fn lease_key(stream_id: &str) -> String {
    format!("catalyst:pull_lease:{stream_id}")
}
