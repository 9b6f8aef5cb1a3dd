use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

use super::location::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Ip,
    Cidr,
}

/// Exact and/or substring constraint on one location field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMatcher {
    pub exact: Option<String>,
    pub vague: Option<String>,
}

impl FieldMatcher {
    pub fn new(exact: &str, vague: &str) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            exact: non_empty(exact),
            vague: non_empty(vague),
        }
    }

    pub fn is_set(&self) -> bool {
        self.exact.is_some() || self.vague.is_some()
    }

    /// Vague matching is case-sensitive substring containment.
    pub fn matches(&self, value: &str) -> bool {
        let exact_ok = self.exact.as_deref().map_or(true, |e| e == value);
        let vague_ok = self.vague.as_deref().map_or(true, |v| value.contains(v));
        exact_ok && vague_ok
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationMatcher {
    pub nation: FieldMatcher,
    pub province: FieldMatcher,
    pub city: FieldMatcher,
    pub isp: FieldMatcher,
}

impl LocationMatcher {
    /// True when the rule carries no geographic constraint at all.
    pub fn is_empty(&self) -> bool {
        !(self.nation.is_set() || self.province.is_set() || self.city.is_set() || self.isp.is_set())
    }

    pub fn matches(&self, loc: &Location) -> bool {
        self.nation.matches(&loc.nation)
            && self.province.matches(&loc.province)
            && self.city.matches(&loc.city)
            && self.isp.matches(&loc.isp)
    }
}

/// A validated access rule. Built once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub kind: RuleKind,
    pub location: LocationMatcher,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub ipv4_cidr: Option<Ipv4Net>,
    pub ipv6_cidr: Option<Ipv6Net>,
    /// `0.0.0.0/0` written on a CIDR rule matches every address family.
    pub catch_all: bool,
    pub banned: bool,
}

impl Rule {
    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        match self.kind {
            RuleKind::Ip => match ip {
                IpAddr::V4(v4) => self.ipv4 == Some(v4),
                IpAddr::V6(v6) => self.ipv6 == Some(v6),
            },
            RuleKind::Cidr => {
                if self.catch_all {
                    return true;
                }
                match ip {
                    IpAddr::V4(v4) => self.ipv4_cidr.map_or(false, |net| net.contains(&v4)),
                    IpAddr::V6(v6) => self.ipv6_cidr.map_or(false, |net| net.contains(&v6)),
                }
            }
        }
    }
}

/// Brute-force threshold: more than `try_count` attempts inside
/// `memory_seconds` earns a `banned_seconds` ban (0 = pass through).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountRule {
    pub try_count: u32,
    pub memory_seconds: u64,
    pub banned_seconds: u64,
}

impl CountRule {
    /// Applied when no count rules are configured.
    pub const DEFAULT: CountRule = CountRule {
        try_count: 5,
        memory_seconds: 180,
        banned_seconds: 600,
    };
}
