use std::net::IpAddr;

use maxminddb::geoip2;
use tracing::{debug, warn};

/// Geographic classification of an IP address. Fields are empty strings when
/// the database has no answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoLocation {
    pub country: String,
    pub state: String,
    pub city: String,
}

/// Read-only city-level GeoIP oracle backed by a MaxMind database.
///
/// Lookups never fail: an unknown IP, a missing database file, or an empty
/// configured path all degrade to empty strings, and the relay keeps running
/// without geo matching.
pub struct GeoIp {
    inner: Backend,
}

enum Backend {
    Mmdb(maxminddb::Reader<Vec<u8>>),
    #[cfg(test)]
    Table(std::collections::HashMap<IpAddr, GeoLocation>),
    Empty,
}

impl GeoIp {
    pub fn open(path: &str) -> Self {
        if path.trim().is_empty() {
            return Self::empty();
        }
        match maxminddb::Reader::open_readfile(path) {
            Ok(reader) => Self {
                inner: Backend::Mmdb(reader),
            },
            Err(e) => {
                warn!("can't open geoip db at {}: {}, geo matching disabled", path, e);
                Self::empty()
            }
        }
    }

    pub fn empty() -> Self {
        Self {
            inner: Backend::Empty,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_table(
        entries: impl IntoIterator<Item = (IpAddr, GeoLocation)>,
    ) -> Self {
        Self {
            inner: Backend::Table(entries.into_iter().collect()),
        }
    }

    pub fn lookup(&self, ip: IpAddr) -> GeoLocation {
        match &self.inner {
            Backend::Mmdb(reader) => match reader.lookup::<geoip2::City>(ip) {
                Ok(record) => {
                    let country = record
                        .country
                        .as_ref()
                        .and_then(|c| c.iso_code)
                        .unwrap_or_default()
                        .to_string();
                    let state = record
                        .subdivisions
                        .as_ref()
                        .and_then(|subs| subs.first())
                        .and_then(|s| s.names.as_ref())
                        .and_then(|names| names.get("en").copied())
                        .unwrap_or_default()
                        .to_string();
                    let city = record
                        .city
                        .as_ref()
                        .and_then(|c| c.names.as_ref())
                        .and_then(|names| names.get("en").copied())
                        .unwrap_or_default()
                        .to_string();
                    GeoLocation {
                        country,
                        state,
                        city,
                    }
                }
                Err(e) => {
                    debug!("geoip lookup failed for {}: {}", ip, e);
                    GeoLocation::default()
                }
            },
            #[cfg(test)]
            Backend::Table(table) => table.get(&ip).cloned().unwrap_or_default(),
            Backend::Empty => GeoLocation::default(),
        }
    }

    /// ISO-3166 alpha-2 country code, or an empty string.
    pub fn country(&self, ip: IpAddr) -> String {
        self.lookup(ip).country
    }
}
