use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

/// Short-lived bans written by the brute-force counter.
///
/// Expired entries are ignored on read and removed by [`BanCache::cleanup`].
pub struct BanCache {
    bans: DashMap<IpAddr, Instant>,
}

impl BanCache {
    pub fn new() -> Self {
        Self {
            bans: DashMap::with_capacity(1024),
        }
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.remaining(ip).is_some()
    }

    /// Time left on an active ban.
    pub fn remaining(&self, ip: &IpAddr) -> Option<Duration> {
        let until = *self.bans.get(ip)?;
        until.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
    }

    /// Ban `ip` for `duration`. An existing longer ban is kept.
    pub fn set_banned(&self, ip: IpAddr, duration: Duration) {
        let until = Instant::now() + duration;
        let mut entry = self.bans.entry(ip).or_insert(until);
        if *entry < until {
            *entry = until;
        }
        debug!(ip = %ip, duration_secs = duration.as_secs(), "Ban cached");
    }

    pub fn cleanup(&self) {
        let now = Instant::now();
        let before = self.bans.len();
        self.bans.retain(|_, until| *until > now);
        let removed = before.saturating_sub(self.bans.len());
        if removed > 0 {
            info!(removed = removed, remaining = self.bans.len(), "Expired bans evicted");
        }
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }
}

impl Default for BanCache {
    fn default() -> Self {
        Self::new()
    }
}
