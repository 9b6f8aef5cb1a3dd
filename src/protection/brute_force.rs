use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::admission::Denial;
use crate::models::rule::CountRule;
use crate::storage::ban_cache::BanCache;
use crate::storage::sqlite::SqliteStore;

/// Sliding-window attempt counter over SSH connection history.
pub struct BruteForceCounter {
    store: Arc<SqliteStore>,
    bans: Arc<BanCache>,
}

impl BruteForceCounter {
    pub fn new(store: Arc<SqliteStore>, bans: Arc<BanCache>) -> Self {
        Self { store, bans }
    }

    pub fn check_and_maybe_ban(&self, ip: IpAddr, backend: &str, rules: &[CountRule]) -> Result<(), Denial> {
        self.check_and_maybe_ban_at(ip, backend, rules, Utc::now())
    }

    /// The attempt being evaluated counts toward the window, so a rule with
    /// `try_count = 5` trips on the sixth attempt.
    ///
    /// Rules are evaluated strictest first; the first hit decides. A hit on
    /// a rule with `banned_seconds == 0` lets the attempt through.
    pub fn check_and_maybe_ban_at(
        &self,
        ip: IpAddr,
        backend: &str,
        rules: &[CountRule],
        now: DateTime<Utc>,
    ) -> Result<(), Denial> {
        if let Some(left) = self.bans.remaining(&ip) {
            return Err(Denial::BruteForce {
                seconds: left.as_secs().max(1),
                new_ban: false,
            });
        }

        let defaults = [CountRule::DEFAULT];
        let rules = if rules.is_empty() { &defaults[..] } else { rules };
        let from = ip.to_string();

        for rule in rules {
            let after = now - chrono::Duration::seconds(rule.memory_seconds as i64);
            let limit = rule.try_count as usize + 1;

            let prior = match self.store.find_recent_records(&from, backend, after, limit) {
                Ok(records) => records.len(),
                Err(e) => {
                    warn!(ip = %ip, backend = backend, error = %e, "Failed to read connection history");
                    return Err(Denial::HistoryUnavailable);
                }
            };

            if prior < rule.try_count as usize {
                continue;
            }

            if rule.banned_seconds == 0 {
                return Ok(());
            }

            self.bans.set_banned(ip, Duration::from_secs(rule.banned_seconds));
            info!(
                ip = %ip,
                backend = backend,
                attempts = prior + 1,
                window_secs = rule.memory_seconds,
                duration_secs = rule.banned_seconds,
                "Brute-force threshold reached, IP banned"
            );
            return Err(Denial::BruteForce {
                seconds: rule.banned_seconds,
                new_ban: true,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKEND: &str = "10.0.0.2:22";

    fn setup() -> (tempfile::TempDir, Arc<SqliteStore>, Arc<BanCache>, BruteForceCounter) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("bf.db").to_str().unwrap()).unwrap());
        let bans = Arc::new(BanCache::new());
        let counter = BruteForceCounter::new(store.clone(), bans.clone());
        (dir, store, bans, counter)
    }

    fn attempts(store: &SqliteStore, ip: &str, n: usize, at: DateTime<Utc>) {
        for _ in 0..n {
            store.add_connection_record(ip, BACKEND, true, at, "attempt").unwrap();
        }
    }

    #[test]
    fn test_default_rule_bans_sixth_attempt() {
        let (_dir, store, bans, counter) = setup();
        let ip: IpAddr = "198.51.100.20".parse().unwrap();
        let now = Utc::now();

        for i in 0..5 {
            assert!(counter.check_and_maybe_ban_at(ip, BACKEND, &[], now).is_ok(), "attempt {}", i + 1);
            attempts(&store, "198.51.100.20", 1, now - chrono::Duration::seconds(10));
        }

        let denial = counter.check_and_maybe_ban_at(ip, BACKEND, &[], now).unwrap_err();
        assert_eq!(denial, Denial::BruteForce { seconds: 600, new_ban: true });
        assert!(bans.is_banned(&ip));

        // Still banned, now served from the cache.
        assert!(matches!(
            counter.check_and_maybe_ban_at(ip, BACKEND, &[], now),
            Err(Denial::BruteForce { new_ban: false, .. })
        ));
    }

    #[test]
    fn test_records_outside_window_are_ignored() {
        let (_dir, store, _bans, counter) = setup();
        let ip: IpAddr = "198.51.100.21".parse().unwrap();
        let now = Utc::now();

        attempts(&store, "198.51.100.21", 20, now - chrono::Duration::seconds(181));
        assert!(counter.check_and_maybe_ban_at(ip, BACKEND, &[], now).is_ok());

        // Other backends do not count either.
        for _ in 0..10 {
            store.add_connection_record("198.51.100.21", "10.0.0.3:22", true, now, "x").unwrap();
        }
        assert!(counter.check_and_maybe_ban_at(ip, BACKEND, &[], now).is_ok());
    }

    #[test]
    fn test_strictest_rule_decides() {
        let (_dir, store, _bans, counter) = setup();
        let ip: IpAddr = "198.51.100.22".parse().unwrap();
        let now = Utc::now();
        let rules = [
            CountRule { try_count: 10, memory_seconds: 3600, banned_seconds: 86400 },
            CountRule { try_count: 3, memory_seconds: 60, banned_seconds: 300 },
        ];

        attempts(&store, "198.51.100.22", 12, now - chrono::Duration::seconds(30));
        let denial = counter.check_and_maybe_ban_at(ip, BACKEND, &rules, now).unwrap_err();
        assert_eq!(denial, Denial::BruteForce { seconds: 86400, new_ban: true });
    }

    #[test]
    fn test_looser_rule_applies_when_strict_not_hit() {
        let (_dir, store, _bans, counter) = setup();
        let ip: IpAddr = "198.51.100.23".parse().unwrap();
        let now = Utc::now();
        let rules = [
            CountRule { try_count: 10, memory_seconds: 3600, banned_seconds: 86400 },
            CountRule { try_count: 3, memory_seconds: 60, banned_seconds: 300 },
        ];

        attempts(&store, "198.51.100.23", 4, now - chrono::Duration::seconds(30));
        let denial = counter.check_and_maybe_ban_at(ip, BACKEND, &rules, now).unwrap_err();
        assert_eq!(denial, Denial::BruteForce { seconds: 300, new_ban: true });
    }

    #[test]
    fn test_zero_duration_rule_passes_through() {
        let (_dir, store, bans, counter) = setup();
        let ip: IpAddr = "198.51.100.24".parse().unwrap();
        let now = Utc::now();
        let rules = [
            CountRule { try_count: 5, memory_seconds: 60, banned_seconds: 0 },
            CountRule { try_count: 2, memory_seconds: 60, banned_seconds: 600 },
        ];

        attempts(&store, "198.51.100.24", 8, now - chrono::Duration::seconds(5));
        assert!(counter.check_and_maybe_ban_at(ip, BACKEND, &rules, now).is_ok());
        assert!(!bans.is_banned(&ip));
    }
}
