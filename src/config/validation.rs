//! Turns raw config sections into validated runtime types.
//!
//! Everything here runs once at startup; any error aborts the service.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use thiserror::Error;

use super::settings::{BandwidthConfig, CountRuleConfig, ForwardConfig, RuleConfig};
use crate::models::forward::{ProxyVersion, ResolvedForward};
use crate::models::rule::{CountRule, FieldMatcher, LocationMatcher, Rule, RuleKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("rule #{index}: unknown kind '{kind}' (expected \"ip\" or \"cidr\")")]
    UnknownRuleKind { index: usize, kind: String },
    #[error("rule #{index}: {field} '{value}' is not valid")]
    InvalidRuleAddress {
        index: usize,
        field: &'static str,
        value: String,
    },
    #[error("rule #{index}: no address field set for a {kind} rule")]
    MissingRuleAddress { index: usize, kind: &'static str },
    #[error("count rule #{index}: memory_seconds must be positive, got {value}")]
    InvalidMemorySeconds { index: usize, value: i64 },
    #[error("count rules must be sorted by descending try_count then memory_seconds (at #{index})")]
    UnsortedCountRules { index: usize },
    #[error("forward: listen_port {0} is out of range 1-65535")]
    InvalidListenPort(u32),
    #[error("forward :{port}: {field} '{value}' cannot be resolved")]
    UnresolvableAddress {
        port: u16,
        field: &'static str,
        value: String,
    },
    #[error("forward :{port}: {field} '{value}' is not a valid bind address")]
    InvalidBindAddress {
        port: u16,
        field: &'static str,
        value: String,
    },
    #[error("forward :{0}: no destination configured")]
    MissingDestination(u16),
    #[error("forward :{port}: dest_proxy_version {version} is not supported")]
    InvalidProxyVersion { port: u16, version: i32 },
    #[error("bandwidth.{0} must be positive")]
    ZeroTiming(&'static str),
}

/// Build the ordered rule list for one protocol.
pub fn build_rules(configs: &[RuleConfig]) -> Result<Vec<Rule>, ConfigError> {
    configs
        .iter()
        .enumerate()
        .map(|(index, cfg)| build_rule(index, cfg))
        .collect()
}

fn build_rule(index: usize, cfg: &RuleConfig) -> Result<Rule, ConfigError> {
    let kind = match cfg.kind.to_ascii_lowercase().as_str() {
        "ip" => RuleKind::Ip,
        "cidr" => RuleKind::Cidr,
        other => {
            return Err(ConfigError::UnknownRuleKind {
                index,
                kind: other.to_string(),
            })
        }
    };

    fn parse_opt<T: std::str::FromStr>(
        index: usize,
        field: &'static str,
        value: &str,
    ) -> Result<Option<T>, ConfigError> {
        if value.is_empty() {
            return Ok(None);
        }
        value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidRuleAddress {
                index,
                field,
                value: value.to_string(),
            })
    }

    let location = LocationMatcher {
        nation: FieldMatcher::new(&cfg.nation, &cfg.nation_vague),
        province: FieldMatcher::new(&cfg.province, &cfg.province_vague),
        city: FieldMatcher::new(&cfg.city, &cfg.city_vague),
        isp: FieldMatcher::new(&cfg.isp, &cfg.isp_vague),
    };

    let mut rule = Rule {
        kind,
        location,
        ipv4: None,
        ipv6: None,
        ipv4_cidr: None,
        ipv6_cidr: None,
        catch_all: false,
        banned: cfg.banned,
    };

    match kind {
        RuleKind::Ip => {
            rule.ipv4 = parse_opt(index, "ipv4", &cfg.ipv4)?;
            rule.ipv6 = parse_opt(index, "ipv6", &cfg.ipv6)?;
            if rule.ipv4.is_none() && rule.ipv6.is_none() {
                return Err(ConfigError::MissingRuleAddress { index, kind: "ip" });
            }
        }
        RuleKind::Cidr => {
            rule.catch_all = cfg.ipv4 == "0.0.0.0/0" || cfg.ipv4_cidr == "0.0.0.0/0";
            rule.ipv4_cidr = parse_opt(index, "ipv4_cidr", &cfg.ipv4_cidr)?;
            rule.ipv6_cidr = parse_opt(index, "ipv6_cidr", &cfg.ipv6_cidr)?;
            if !rule.catch_all && rule.ipv4_cidr.is_none() && rule.ipv6_cidr.is_none() {
                return Err(ConfigError::MissingRuleAddress { index, kind: "cidr" });
            }
        }
    }

    Ok(rule)
}

/// Validate count rules. The list must already be in strictest-first order.
pub fn build_count_rules(configs: &[CountRuleConfig]) -> Result<Vec<CountRule>, ConfigError> {
    let mut rules = Vec::with_capacity(configs.len());

    for (index, cfg) in configs.iter().enumerate() {
        if cfg.memory_seconds <= 0 {
            return Err(ConfigError::InvalidMemorySeconds {
                index,
                value: cfg.memory_seconds,
            });
        }
        rules.push(CountRule {
            try_count: cfg.try_count.clamp(0, u32::MAX as i64) as u32,
            memory_seconds: cfg.memory_seconds as u64,
            banned_seconds: cfg.banned_seconds.max(0) as u64,
        });
    }

    for (index, pair) in rules.windows(2).enumerate() {
        let (a, b) = (pair[0], pair[1]);
        let ordered = a.try_count > b.try_count
            || (a.try_count == b.try_count && a.memory_seconds >= b.memory_seconds);
        if !ordered {
            return Err(ConfigError::UnsortedCountRules { index: index + 1 });
        }
    }

    Ok(rules)
}

/// Resolve one forward entry into concrete socket addresses.
pub fn resolve_forward(cfg: &ForwardConfig) -> Result<ResolvedForward, ConfigError> {
    let port = u16::try_from(cfg.listen_port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(ConfigError::InvalidListenPort(cfg.listen_port))?;

    let ipv4_bind: Ipv4Addr = cfg.ipv4_bind.parse().map_err(|_| ConfigError::InvalidBindAddress {
        port,
        field: "ipv4_bind",
        value: cfg.ipv4_bind.clone(),
    })?;
    let ipv6_bind: Ipv6Addr = cfg.ipv6_bind.parse().map_err(|_| ConfigError::InvalidBindAddress {
        port,
        field: "ipv6_bind",
        value: cfg.ipv6_bind.clone(),
    })?;

    let general = if cfg.dest.is_empty() {
        Vec::new()
    } else {
        resolve_all(port, "dest", &cfg.dest)?
    };

    let ipv4_target = if cfg.ipv4_dest.is_empty() {
        general.iter().copied().find(SocketAddr::is_ipv4)
    } else {
        let found = resolve_all(port, "ipv4_dest", &cfg.ipv4_dest)?.into_iter().find(SocketAddr::is_ipv4);
        Some(found.ok_or_else(|| ConfigError::UnresolvableAddress {
            port,
            field: "ipv4_dest",
            value: cfg.ipv4_dest.clone(),
        })?)
    };

    let ipv6_target = if cfg.ipv6_dest.is_empty() {
        general.iter().copied().find(SocketAddr::is_ipv6)
    } else {
        let found = resolve_all(port, "ipv6_dest", &cfg.ipv6_dest)?.into_iter().find(SocketAddr::is_ipv6);
        Some(found.ok_or_else(|| ConfigError::UnresolvableAddress {
            port,
            field: "ipv6_dest",
            value: cfg.ipv6_dest.clone(),
        })?)
    };

    if ipv4_target.is_none() && ipv6_target.is_none() {
        return Err(ConfigError::MissingDestination(port));
    }

    let dest_proxy_version = match cfg.dest_proxy_version {
        1 => ProxyVersion::V1,
        2 | -1 => ProxyVersion::V2,
        version => return Err(ConfigError::InvalidProxyVersion { port, version }),
    };

    Ok(ResolvedForward {
        listen_port: port,
        ipv4_bind,
        ipv6_bind,
        ipv4_target,
        ipv6_target,
        allow_cross: cfg.allow_cross,
        ipv4_src_proxy: cfg.ipv4_src_proxy,
        ipv6_src_proxy: cfg.ipv6_src_proxy,
        ipv4_dest_proxy: cfg.ipv4_dest_proxy,
        ipv6_dest_proxy: cfg.ipv6_dest_proxy,
        dest_proxy_version,
        count_rules: build_count_rules(&cfg.count_rules)?,
    })
}

fn resolve_all(port: u16, field: &'static str, value: &str) -> Result<Vec<SocketAddr>, ConfigError> {
    let unresolvable = || ConfigError::UnresolvableAddress {
        port,
        field,
        value: value.to_string(),
    };

    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(vec![normalize(addr)]);
    }
    let addrs: Vec<SocketAddr> = value
        .to_socket_addrs()
        .map_err(|_| unresolvable())?
        .map(normalize)
        .collect();
    if addrs.is_empty() {
        return Err(unresolvable());
    }
    Ok(addrs)
}

fn normalize(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// Timing sanity for the bandwidth monitor. Only checked when an interface is set.
pub fn validate_bandwidth(cfg: &BandwidthConfig) -> Result<(), ConfigError> {
    if cfg.interface_name.is_empty() {
        return Ok(());
    }
    if cfg.data_collection_cycle_secs == 0 {
        return Err(ConfigError::ZeroTiming("data_collection_cycle_secs"));
    }
    if cfg.statistical_period_secs == 0 {
        return Err(ConfigError::ZeroTiming("statistical_period_secs"));
    }
    if cfg.statistical_time_span_secs == 0 {
        return Err(ConfigError::ZeroTiming("statistical_time_span_secs"));
    }
    Ok(())
}
