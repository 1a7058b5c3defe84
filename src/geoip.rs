//! GeoIP lookup module using MaxMind GeoLite2 databases

use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// GeoIP lookup result
#[derive(Debug, Clone, Default)]
pub struct GeoInfo {
    pub country: String,
    pub province: String,
    pub city: String,
    pub isp: String,
}

/// GeoIP reader wrapper
///
/// Either database may be absent; enrichment then degrades to empty fields
/// instead of failing ingestion.
pub struct GeoIp {
    city: Option<Reader<Vec<u8>>>,
    asn: Option<Reader<Vec<u8>>>,
}

impl GeoIp {
    /// Create a new GeoIP instance, loading the databases if available
    pub fn new(city_path: &str, asn_path: &str) -> Self {
        Self {
            city: open_reader(city_path, "GeoLite2-City"),
            asn: if asn_path.is_empty() {
                None
            } else {
                open_reader(asn_path, "GeoLite2-ASN")
            },
        }
    }

    /// Look up an IP address and return location info
    pub fn lookup(&self, ip: &str) -> Option<GeoInfo> {
        let reader = self.city.as_ref()?;

        let ip_addr: IpAddr = ip.parse().ok()?;

        // Private/local addresses carry no useful location
        if is_private_ip(&ip_addr) {
            return None;
        }

        let city: geoip2::City = reader.lookup(ip_addr).ok()?;

        let country = city
            .country
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|n| n.get("en").copied())
            .or_else(|| city.country.as_ref().and_then(|c| c.iso_code))
            .unwrap_or("")
            .to_string();

        let province = city
            .subdivisions
            .as_ref()
            .and_then(|s| s.first())
            .and_then(|s| s.names.as_ref())
            .and_then(|n| n.get("en").copied())
            .unwrap_or("")
            .to_string();

        let city_name = city
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|n| n.get("en").copied())
            .unwrap_or("")
            .to_string();

        let isp = self
            .asn
            .as_ref()
            .and_then(|r| r.lookup::<geoip2::Asn>(ip_addr).ok())
            .and_then(|a| a.autonomous_system_organization)
            .unwrap_or("")
            .to_string();

        Some(GeoInfo {
            country,
            province,
            city: city_name,
            isp,
        })
    }

    /// Check if the city database is loaded
    pub fn is_available(&self) -> bool {
        self.city.is_some()
    }
}

fn open_reader(path: &str, kind: &str) -> Option<Reader<Vec<u8>>> {
    if !Path::new(path).exists() {
        warn!("{} database not found at: {}", kind, path);
        return None;
    }

    match Reader::open_readfile(path) {
        Ok(reader) => {
            info!("{} database loaded: {}", kind, path);
            Some(reader)
        }
        Err(e) => {
            warn!("Failed to load {} database: {}", kind, e);
            None
        }
    }
}

/// Check if an IP address is private/local
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_documentation()
                || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => ipv6.is_loopback() || ipv6.is_unspecified(),
    }
}

/// Thread-safe GeoIP wrapper
pub type SharedGeoIp = Arc<GeoIp>;
