use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::location::Location;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("maxmind lookup failed: {0}")]
    MaxMind(#[from] maxminddb::MaxMindDBError),
}

/// Resolves an address to a location. `Ok(None)` means "not placeable".
pub trait GeoLookup: Send + Sync {
    fn query_location(&self, ip: IpAddr) -> Result<Option<Location>, GeoError>;
}

/// Lookup backed by MaxMind City and ASN databases.
///
/// Either database may be missing; the corresponding fields then stay empty.
pub struct MaxMindGeo {
    city_reader: Option<maxminddb::Reader<Vec<u8>>>,
    asn_reader: Option<maxminddb::Reader<Vec<u8>>>,
}

#[derive(serde::Deserialize, Debug)]
struct Named {
    names: Option<HashMap<String, String>>,
}

impl Named {
    fn english(self) -> Option<String> {
        self.names.and_then(|mut names| names.remove("en"))
    }
}

#[derive(serde::Deserialize, Debug)]
struct GeoIpCity {
    country: Option<Named>,
    subdivisions: Option<Vec<Named>>,
    city: Option<Named>,
}

#[derive(serde::Deserialize, Debug)]
struct GeoIpAsn {
    autonomous_system_organization: Option<String>,
}

impl MaxMindGeo {
    pub fn new(city_db: &str, asn_db: &str) -> Self {
        Self {
            city_reader: open_reader("city", city_db),
            asn_reader: open_reader("ASN", asn_db),
        }
    }
}

fn open_reader(kind: &str, path: &str) -> Option<maxminddb::Reader<Vec<u8>>> {
    if !Path::new(path).exists() {
        warn!(path = path, kind = kind, "GeoIP database file not found");
        return None;
    }
    match maxminddb::Reader::open_readfile(path) {
        Ok(reader) => {
            info!(path = path, kind = kind, "GeoIP database loaded");
            Some(reader)
        }
        Err(e) => {
            warn!(path = path, kind = kind, error = %e, "Failed to load GeoIP database");
            None
        }
    }
}

fn not_found<T>(result: Result<T, maxminddb::MaxMindDBError>) -> Result<Option<T>, GeoError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(maxminddb::MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl GeoLookup for MaxMindGeo {
    fn query_location(&self, ip: IpAddr) -> Result<Option<Location>, GeoError> {
        let mut loc = Location::default();

        if let Some(reader) = &self.city_reader {
            if let Some(city) = not_found(reader.lookup::<GeoIpCity>(ip))? {
                loc.nation = city.country.and_then(Named::english).unwrap_or_default();
                loc.province = city
                    .subdivisions
                    .and_then(|subs| subs.into_iter().next())
                    .and_then(Named::english)
                    .unwrap_or_default();
                loc.city = city.city.and_then(Named::english).unwrap_or_default();
            }
        }

        if let Some(reader) = &self.asn_reader {
            if let Some(asn) = not_found(reader.lookup::<GeoIpAsn>(ip))? {
                loc.isp = asn.autonomous_system_organization.unwrap_or_default();
            }
        }

        Ok((!loc.is_empty()).then_some(loc))
    }
}

/// TTL cache in front of any [`GeoLookup`]. Errors are not cached.
pub struct CachedGeo {
    inner: Arc<dyn GeoLookup>,
    ttl: Duration,
    entries: DashMap<IpAddr, (Instant, Option<Location>)>,
}

impl CachedGeo {
    pub fn new(inner: Arc<dyn GeoLookup>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn cleanup(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (at, _)| at.elapsed() < ttl);
    }
}

impl GeoLookup for CachedGeo {
    fn query_location(&self, ip: IpAddr) -> Result<Option<Location>, GeoError> {
        if let Some(hit) = self.entries.get(&ip) {
            if hit.0.elapsed() < self.ttl {
                return Ok(hit.1.clone());
            }
        }
        let loc = self.inner.query_location(ip)?;
        self.entries.insert(ip, (Instant::now(), loc.clone()));
        Ok(loc)
    }
}
