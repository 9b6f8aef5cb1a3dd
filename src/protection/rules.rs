use std::net::IpAddr;

use crate::models::location::Location;
use crate::models::rule::Rule;

/// First-match-wins rule evaluation. Returns true when the address is allowed.
///
/// A rule carrying location constraints is skipped when no location was
/// resolved. Location-agnostic rules always reach the address check.
pub fn evaluate(ip: IpAddr, location: Option<&Location>, rules: &[Rule], default_banned: bool) -> bool {
    matching_rule(ip, location, rules).map_or(!default_banned, |rule| !rule.banned)
}

/// The first rule whose location and address predicates both hold.
pub fn matching_rule<'a>(ip: IpAddr, location: Option<&Location>, rules: &'a [Rule]) -> Option<&'a Rule> {
    let ip = ip.to_canonical();
    rules.iter().find(|rule| {
        if !rule.location.is_empty() {
            match location {
                Some(loc) if rule.location.matches(loc) => {}
                _ => return false,
            }
        }
        rule.matches_ip(ip)
    })
}
