//! Per-playback-ID rate limit on stream-directory lookups (SPEC_FULL.md 5,
//! 4.F), preventing a flood of retrying viewers from storming an external
//! directory that is already struggling.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

pub struct DirectoryLookupLimiter {
    last_lookup: DashMap<String, Instant>,
    window: Duration,
}

impl DirectoryLookupLimiter {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            last_lookup: DashMap::new(),
            window,
        }
    }

    /// Returns `true` if a lookup for `playback_id` is allowed right now,
    /// and marks it as having happened. Returns `false` (rate-limited) if
    /// the last lookup was within `window`.
    pub fn check_and_mark(&self, playback_id: &str) -> bool {
        let now = Instant::now();
        match self.last_lookup.entry(playback_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.window {
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lookup_within_window_is_denied() {
        let limiter = DirectoryLookupLimiter::new(Duration::from_secs(5));
        assert!(limiter.check_and_mark("abc"));
        assert!(!limiter.check_and_mark("abc"));
    }

    #[test]
    fn different_playback_ids_are_independent() {
        let limiter = DirectoryLookupLimiter::new(Duration::from_secs(5));
        assert!(limiter.check_and_mark("abc"));
        assert!(limiter.check_and_mark("def"));
    }

    #[test]
    fn lookup_allowed_again_after_window_elapses() {
        let limiter = DirectoryLookupLimiter::new(Duration::from_millis(10));
        assert!(limiter.check_and_mark("abc"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.check_and_mark("abc"));
    }
}
