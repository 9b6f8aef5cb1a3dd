use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::brute_force::BruteForceCounter;
use super::geoip::GeoLookup;
use super::rules;
use crate::models::location::Location;
use crate::models::protocol::Protocol;
use crate::models::record::LocationDimension;
use crate::models::rule::{CountRule, Rule};
use crate::storage::sqlite::SqliteStore;

/// Why a connection was refused. Denials are decisions, not failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("IP is banned")]
    IpBanned,
    #[error("too many attempts, banned for {seconds} seconds")]
    BruteForce { seconds: u64, new_ban: bool },
    #[error("{dimension} '{subject}' is banned")]
    LocationBanned {
        dimension: LocationDimension,
        subject: String,
    },
    #[error("denied by access rule")]
    RuleDenied,
    #[error("denied by default policy")]
    DefaultDenied,
    #[error("connection history unavailable")]
    HistoryUnavailable,
    #[error("attempt could not be recorded")]
    RecordUnavailable,
}

/// Which check let a connection through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allowed {
    Loopback,
    Intranet,
    Rule,
    Default,
}

impl fmt::Display for Allowed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Allowed::Loopback => "loopback source always allowed",
            Allowed::Intranet => "intranet source always allowed",
            Allowed::Rule => "allowed by access rule",
            Allowed::Default => "allowed by default policy",
        };
        f.write_str(s)
    }
}

/// Per-protocol access policy built from configuration.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    pub rules: Vec<Rule>,
    pub default_banned: bool,
    pub always_allow_intranet: bool,
    pub always_allow_loopback: bool,
}

/// Outcome of [`AdmissionGate::check_recorded`].
#[derive(Debug)]
pub struct Admission {
    pub decision: Result<Allowed, Denial>,
    /// Row written for this attempt; `None` only when the store refused it.
    pub record_id: Option<i64>,
}

/// Single allow/deny decision point for one protocol.
pub struct AdmissionGate {
    protocol: Protocol,
    policy: AccessPolicy,
    store: Arc<SqliteStore>,
    geo: Arc<dyn GeoLookup>,
    brute_force: Option<BruteForceCounter>,
    unresolved_isp_markers: Vec<String>,
    /// Held from decision to record write.
    audit: Mutex<()>,
}

impl AdmissionGate {
    /// `brute_force` is only wired for SSH.
    pub fn new(
        protocol: Protocol,
        policy: AccessPolicy,
        store: Arc<SqliteStore>,
        geo: Arc<dyn GeoLookup>,
        brute_force: Option<BruteForceCounter>,
        unresolved_isp_markers: Vec<String>,
    ) -> Self {
        Self {
            protocol,
            policy,
            store,
            geo,
            brute_force,
            unresolved_isp_markers,
            audit: Mutex::new(()),
        }
    }

    pub fn check(&self, remote: IpAddr, backend: &str, count_rules: &[CountRule]) -> Result<Allowed, Denial> {
        self.check_at(remote, backend, count_rules, Utc::now())
    }

    /// Decide and write the attempt record in one step.
    ///
    /// Decisions are serialised per gate, so every attempt from a source sees
    /// the records of the attempts before it. Denials are recorded as
    /// `rejected: <reason>`, admissions with the allow reason. An admission
    /// whose record cannot be written turns into `RecordUnavailable`.
    pub fn check_recorded(&self, remote: IpAddr, backend: &str, count_rules: &[CountRule]) -> Admission {
        self.check_recorded_at(remote, backend, count_rules, Utc::now())
    }

    pub fn check_recorded_at(
        &self,
        remote: IpAddr,
        backend: &str,
        count_rules: &[CountRule],
        now: DateTime<Utc>,
    ) -> Admission {
        let _audit = self.audit.lock();
        let ip = remote.to_canonical().to_string();
        let decision = self.check_at(remote, backend, count_rules, now);
        let mark = match &decision {
            Ok(allowed) => allowed.to_string(),
            Err(denial) => format!("rejected: {}", denial),
        };

        match self
            .store
            .add_connection_record(&ip, backend, decision.is_ok(), now, &mark)
        {
            Ok(id) => Admission {
                decision,
                record_id: Some(id),
            },
            Err(e) if decision.is_ok() => {
                error!(ip = %ip, error = %e, "Failed to record admitted attempt, refusing it");
                Admission {
                    decision: Err(Denial::RecordUnavailable),
                    record_id: None,
                }
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "Failed to record rejected attempt");
                Admission {
                    decision,
                    record_id: None,
                }
            }
        }
    }

    /// Short-circuits on the first deny. Ban lookups that hit a storage
    /// error are logged and treated as "not banned".
    pub fn check_at(
        &self,
        remote: IpAddr,
        backend: &str,
        count_rules: &[CountRule],
        now: DateTime<Utc>,
    ) -> Result<Allowed, Denial> {
        let ip = remote.to_canonical();
        let policy = &self.policy;
        let loopback = ip.is_loopback();
        let private = is_private(ip);

        if loopback && (policy.always_allow_loopback || policy.always_allow_intranet) {
            return Ok(Allowed::Loopback);
        }

        match self.store.is_ip_banned(self.protocol, &ip.to_string(), now) {
            Ok(true) => return Err(Denial::IpBanned),
            Ok(false) => {}
            Err(e) => warn!(ip = %ip, error = %e, "IP ban lookup failed, treating as not banned"),
        }

        if private && policy.always_allow_intranet {
            return Ok(Allowed::Intranet);
        }

        if let Some(counter) = &self.brute_force {
            counter.check_and_maybe_ban_at(ip, backend, count_rules, now)?;
        }

        let location = if loopback || private {
            None
        } else {
            self.resolve_location(ip)
        };

        if let Some(loc) = &location {
            self.check_location_bans(ip, loc, now)?;
        }

        match rules::matching_rule(ip, location.as_ref(), &policy.rules) {
            Some(rule) if rule.banned => Err(Denial::RuleDenied),
            Some(_) => Ok(Allowed::Rule),
            None if policy.default_banned => Err(Denial::DefaultDenied),
            None => Ok(Allowed::Default),
        }
    }

    /// Lookup errors and ISP names containing a configured marker yield no location.
    fn resolve_location(&self, ip: IpAddr) -> Option<Location> {
        let loc = match self.geo.query_location(ip) {
            Ok(loc) => loc?,
            Err(e) => {
                warn!(ip = %ip, error = %e, "Geo lookup failed, continuing without location");
                return None;
            }
        };
        if self.unresolved_isp_markers.iter().any(|m| loc.isp.contains(m.as_str())) {
            debug!(ip = %ip, isp = %loc.isp, "Geo lookup returned an unplaceable marker");
            return None;
        }
        Some(loc)
    }

    fn check_location_bans(&self, ip: IpAddr, loc: &Location, now: DateTime<Utc>) -> Result<(), Denial> {
        let dimensions = [
            (LocationDimension::Nation, &loc.nation),
            (LocationDimension::Province, &loc.province),
            (LocationDimension::City, &loc.city),
            (LocationDimension::Isp, &loc.isp),
        ];
        for (dimension, subject) in dimensions {
            match self.store.is_location_banned(self.protocol, dimension, subject, now) {
                Ok(true) => {
                    return Err(Denial::LocationBanned {
                        dimension,
                        subject: subject.clone(),
                    })
                }
                Ok(false) => {}
                Err(e) => warn!(
                    ip = %ip,
                    dimension = %dimension,
                    error = %e,
                    "Location ban lookup failed, treating as not banned"
                ),
            }
        }
        Ok(())
    }
}

/// RFC 1918 for IPv4, unique-local (fc00::/7) for IPv6.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protection::geoip::GeoError;
    use crate::models::rule::{FieldMatcher, LocationMatcher, RuleKind};
    use crate::storage::ban_cache::BanCache;

    struct FixedGeo(Option<Location>);

    impl GeoLookup for FixedGeo {
        fn query_location(&self, _ip: IpAddr) -> Result<Option<Location>, GeoError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenGeo;

    impl GeoLookup for BrokenGeo {
        fn query_location(&self, _ip: IpAddr) -> Result<Option<Location>, GeoError> {
            Err(GeoError::MaxMind(maxminddb::MaxMindDBError::InvalidDatabaseError("corrupt".into())))
        }
    }

    fn store() -> (tempfile::TempDir, Arc<SqliteStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("gate.db").to_str().unwrap()).unwrap());
        (dir, store)
    }

    fn berlin() -> Location {
        Location {
            nation: "Germany".into(),
            province: "Land Berlin".into(),
            city: "Berlin".into(),
            isp: "Deutsche Telekom AG".into(),
        }
    }

    fn gate(
        protocol: Protocol,
        policy: AccessPolicy,
        store: Arc<SqliteStore>,
        geo: Arc<dyn GeoLookup>,
    ) -> AdmissionGate {
        let brute_force = (protocol == Protocol::Ssh)
            .then(|| BruteForceCounter::new(store.clone(), Arc::new(BanCache::new())));
        AdmissionGate::new(
            protocol,
            policy,
            store,
            geo,
            brute_force,
            vec!["Private Network".into()],
        )
    }

    fn nation_rule(nation: &str, banned: bool) -> Rule {
        Rule {
            kind: RuleKind::Cidr,
            location: LocationMatcher {
                nation: FieldMatcher::new(nation, ""),
                ..Default::default()
            },
            ipv4: None,
            ipv6: None,
            ipv4_cidr: None,
            ipv6_cidr: None,
            catch_all: true,
            banned,
        }
    }

    #[test]
    fn test_loopback_bypasses_persistent_ban() {
        let (_dir, store) = store();
        store.add_ip_ban(Protocol::Ssh, "127.0.0.1", None, None, None).unwrap();
        let policy = AccessPolicy {
            default_banned: true,
            always_allow_loopback: true,
            ..Default::default()
        };
        let gate = gate(Protocol::Ssh, policy, store, Arc::new(FixedGeo(None)));
        assert_eq!(
            gate.check("127.0.0.1".parse().unwrap(), "10.0.0.2:22", &[]),
            Ok(Allowed::Loopback)
        );
    }

    #[test]
    fn test_persistent_ban_precedes_intranet_exception() {
        let (_dir, store) = store();
        store.add_ip_ban(Protocol::Tcp, "192.168.1.50", None, None, None).unwrap();
        let policy = AccessPolicy {
            always_allow_intranet: true,
            ..Default::default()
        };
        let gate = gate(Protocol::Tcp, policy, store, Arc::new(FixedGeo(None)));

        assert_eq!(
            gate.check("192.168.1.50".parse().unwrap(), "10.0.0.2:80", &[]),
            Err(Denial::IpBanned)
        );
        assert_eq!(
            gate.check("192.168.1.51".parse().unwrap(), "10.0.0.2:80", &[]),
            Ok(Allowed::Intranet)
        );
    }

    #[test]
    fn test_location_ban_denies() {
        let (_dir, store) = store();
        store
            .add_location_ban(Protocol::Tcp, LocationDimension::City, "Berlin", None, None, None)
            .unwrap();
        let gate = gate(Protocol::Tcp, AccessPolicy::default(), store, Arc::new(FixedGeo(Some(berlin()))));

        let denial = gate.check("203.0.113.5".parse().unwrap(), "10.0.0.2:80", &[]).unwrap_err();
        assert_eq!(
            denial,
            Denial::LocationBanned {
                dimension: LocationDimension::City,
                subject: "Berlin".into()
            }
        );
    }

    #[test]
    fn test_geo_rule_and_fail_open() {
        let (_dir, store) = store();
        let policy = AccessPolicy {
            rules: vec![nation_rule("Germany", true)],
            ..Default::default()
        };

        let resolved = gate(Protocol::Tcp, policy.clone(), store.clone(), Arc::new(FixedGeo(Some(berlin()))));
        assert_eq!(
            resolved.check("203.0.113.5".parse().unwrap(), "10.0.0.2:80", &[]),
            Err(Denial::RuleDenied)
        );

        let broken = gate(Protocol::Tcp, policy.clone(), store.clone(), Arc::new(BrokenGeo));
        assert_eq!(
            broken.check("203.0.113.5".parse().unwrap(), "10.0.0.2:80", &[]),
            Ok(Allowed::Default)
        );

        let marked = Location {
            isp: "IANA Private Network Range".into(),
            ..berlin()
        };
        let marker = gate(Protocol::Tcp, policy, store, Arc::new(FixedGeo(Some(marked))));
        assert_eq!(
            marker.check("203.0.113.5".parse().unwrap(), "10.0.0.2:80", &[]),
            Ok(Allowed::Default)
        );
    }

    #[test]
    fn test_default_banned_without_match() {
        let (_dir, store) = store();
        let policy = AccessPolicy {
            rules: vec![nation_rule("France", false)],
            default_banned: true,
            ..Default::default()
        };
        let gate = gate(Protocol::Tcp, policy, store, Arc::new(FixedGeo(Some(berlin()))));
        assert_eq!(
            gate.check("203.0.113.5".parse().unwrap(), "10.0.0.2:80", &[]),
            Err(Denial::DefaultDenied)
        );
    }

    #[test]
    fn test_ssh_brute_force_runs_before_rules() {
        let (_dir, store) = store();
        let now = Utc::now();
        for _ in 0..5 {
            store
                .add_connection_record("203.0.113.9", "10.0.0.2:22", false, now, "rejected")
                .unwrap();
        }
        let policy = AccessPolicy {
            rules: vec![nation_rule("Germany", false)],
            ..Default::default()
        };
        let gate = gate(Protocol::Ssh, policy, store, Arc::new(FixedGeo(Some(berlin()))));
        assert_eq!(
            gate.check_at("203.0.113.9".parse().unwrap(), "10.0.0.2:22", &[], now),
            Err(Denial::BruteForce { seconds: 600, new_ban: true })
        );
    }

    #[test]
    fn test_check_recorded_counts_each_attempt() {
        let (_dir, store) = store();
        let gate = gate(Protocol::Ssh, AccessPolicy::default(), store.clone(), Arc::new(FixedGeo(None)));
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let now = Utc::now();

        for i in 0..5 {
            let admission = gate.check_recorded_at(ip, "10.0.0.2:22", &[], now + chrono::Duration::milliseconds(i));
            assert_eq!(admission.decision, Ok(Allowed::Default));
            assert!(admission.record_id.is_some());
        }
        let sixth = gate.check_recorded_at(ip, "10.0.0.2:22", &[], now + chrono::Duration::milliseconds(5));
        assert_eq!(sixth.decision, Err(Denial::BruteForce { seconds: 600, new_ban: true }));

        let records = store
            .find_recent_records("203.0.113.9", "10.0.0.2:22", now - chrono::Duration::seconds(1), 100)
            .unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records.iter().filter(|r| r.accepted).count(), 5);
        assert_eq!(records[5].mark, "rejected: too many attempts, banned for 600 seconds");
    }

    #[test]
    fn test_check_recorded_concurrent_attempts_are_bounded() {
        let (_dir, store) = store();
        let gate = Arc::new(gate(Protocol::Ssh, AccessPolicy::default(), store.clone(), Arc::new(FixedGeo(None))));
        let ip: IpAddr = "203.0.113.10".parse().unwrap();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.check_recorded(ip, "10.0.0.2:22", &[]).decision.is_ok())
            })
            .collect();
        let admitted = handles.into_iter().filter_map(|h| h.join().ok()).filter(|ok| *ok).count();
        assert_eq!(admitted, 5);

        let records = store
            .find_recent_records("203.0.113.10", "10.0.0.2:22", Utc::now() - chrono::Duration::seconds(60), 100)
            .unwrap();
        assert_eq!(records.len(), 20);
    }
}
