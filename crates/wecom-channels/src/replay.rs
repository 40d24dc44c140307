//! Replay protection for signed callbacks.
//!
//! A verified request is accepted once: its timestamp must sit inside the
//! freshness window and its `(account, timestamp, nonce)` triple must not have
//! been seen within that window.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;
use wecom_types::config::SecurityConfig;

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayVerdict {
    /// First sighting inside the window.
    Fresh,
    /// Timestamp missing, unparsable, or outside the window.
    Stale,
    /// Nonce already seen for this account and timestamp.
    Duplicate,
}

/// Bounded cache of recently seen nonces.
pub struct ReplayGuard {
    seen: DashMap<(String, String, String), Instant>,
    window: Duration,
    capacity: usize,
    enabled: bool,
}

impl ReplayGuard {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            seen: DashMap::new(),
            window: Duration::from_secs(config.replay_window_secs),
            capacity: config.replay_cache_capacity.max(1),
            enabled: config.reject_replays,
        }
    }

    /// Check a request and remember its nonce.
    ///
    /// `now_secs` is the local clock in seconds since the epoch.
    pub fn check(
        &self,
        account_id: &str,
        timestamp: &str,
        nonce: &str,
        now_secs: i64,
    ) -> ReplayVerdict {
        if !self.enabled {
            return ReplayVerdict::Fresh;
        }

        let Ok(ts) = timestamp.parse::<i64>() else {
            return ReplayVerdict::Stale;
        };
        if now_secs.abs_diff(ts) > self.window.as_secs() {
            return ReplayVerdict::Stale;
        }

        if self.seen.len() >= self.capacity {
            self.purge();
            if self.seen.len() >= self.capacity {
                warn!(
                    capacity = self.capacity,
                    "Replay cache full, refusing request"
                );
                return ReplayVerdict::Duplicate;
            }
        }

        let key = (account_id.to_string(), timestamp.to_string(), nonce.to_string());
        match self.seen.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => ReplayVerdict::Duplicate,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                ReplayVerdict::Fresh
            }
        }
    }

    /// Drop entries older than the window. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let before = self.seen.len();
        let window = self.window;
        self.seen.retain(|_, seen_at| seen_at.elapsed() <= window);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(capacity: usize) -> ReplayGuard {
        ReplayGuard::new(&SecurityConfig {
            replay_window_secs: 300,
            replay_cache_capacity: capacity,
            reject_replays: true,
        })
    }

    #[test]
    fn test_first_request_is_fresh() {
        let g = guard(10);
        assert_eq!(g.check("a", "1000", "n1", 1000), ReplayVerdict::Fresh);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_duplicate_nonce_rejected() {
        let g = guard(10);
        assert_eq!(g.check("a", "1000", "n1", 1000), ReplayVerdict::Fresh);
        assert_eq!(g.check("a", "1000", "n1", 1001), ReplayVerdict::Duplicate);
    }

    #[test]
    fn test_same_nonce_other_account_is_fresh() {
        let g = guard(10);
        assert_eq!(g.check("a", "1000", "n1", 1000), ReplayVerdict::Fresh);
        assert_eq!(g.check("b", "1000", "n1", 1000), ReplayVerdict::Fresh);
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let g = guard(10);
        assert_eq!(g.check("a", "1000", "n", 1000 + 301), ReplayVerdict::Stale);
        assert_eq!(g.check("a", "2000", "n", 1000), ReplayVerdict::Stale);
        assert_eq!(g.check("a", "abc", "n", 1000), ReplayVerdict::Stale);
        assert!(g.is_empty());
    }

    #[test]
    fn test_full_cache_refuses() {
        let g = guard(2);
        assert_eq!(g.check("a", "1000", "n1", 1000), ReplayVerdict::Fresh);
        assert_eq!(g.check("a", "1000", "n2", 1000), ReplayVerdict::Fresh);
        assert_eq!(g.check("a", "1000", "n3", 1000), ReplayVerdict::Duplicate);
    }

    #[test]
    fn test_disabled_accepts_everything() {
        let g = ReplayGuard::new(&SecurityConfig {
            reject_replays: false,
            ..SecurityConfig::default()
        });
        assert_eq!(g.check("a", "1", "n", 999_999), ReplayVerdict::Fresh);
        assert_eq!(g.check("a", "1", "n", 999_999), ReplayVerdict::Fresh);
    }
}
