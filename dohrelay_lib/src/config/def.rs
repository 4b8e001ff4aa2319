use std::net::SocketAddr;
use std::path::Path;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::Error;

pub const DEFAULT_DOH_LISTEN: &str = "127.0.0.1:15353";
pub const DEFAULT_DNS53_LISTEN: &str = "udp://:53,tcp://:53";
pub const DEFAULT_DOH_PATH: &str = "/dns-query";

/// Built-in upstream endpoint sets, used when a listener enables a protocol
/// without naming its own endpoints.
pub const QUAD9_DOH_ENDPOINTS: &[&str] = &[
    "https://149.112.112.11/dns-query",
    "https://9.9.9.11/dns-query",
];
pub const QUAD9_JSON_ENDPOINTS: &[&str] = &[
    "https://149.112.112.11:5053/dns-query",
    "https://9.9.9.11:5053/dns-query",
];
pub const QUAD9_DNS53_ENDPOINTS: &[&str] = &["tcp://149.112.112.11:53", "tcp://9.9.9.11:53"];

/// Wire protocol spoken towards upstream resolvers.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpstreamProto {
    #[default]
    #[serde(rename = "doh")]
    Doh,
    #[serde(rename = "doh_json")]
    DohJson,
    #[serde(rename = "dns53")]
    Dns53,
}

impl UpstreamProto {
    pub fn default_endpoints(&self) -> Vec<String> {
        let endpoints = match self {
            UpstreamProto::Doh => QUAD9_DOH_ENDPOINTS,
            UpstreamProto::DohJson => QUAD9_JSON_ENDPOINTS,
            UpstreamProto::Dns53 => QUAD9_DNS53_ENDPOINTS,
        };
        endpoints.iter().map(|s| s.to_string()).collect()
    }
}

/// One name-pattern-to-server pin.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct FixedResolving {
    #[serde(default)]
    pub name_regex: String,
    #[serde(default)]
    pub server: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Dns53Config {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_dns53_listen")]
    pub listen: String,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub upstream_fallback: String,
    #[serde(default)]
    pub upstream_proto: UpstreamProto,
    #[serde(default)]
    pub ecs_ip: String,
    #[serde(rename = "2nd_ecs_ip", default)]
    pub ecs_ip_2nd: String,
    #[serde(default)]
    pub use_client_ip: bool,
    #[serde(default)]
    pub fixed_resolving: Vec<FixedResolving>,
}

impl Default for Dns53Config {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: DEFAULT_DNS53_LISTEN.to_string(),
            upstream: String::new(),
            upstream_fallback: String::new(),
            upstream_proto: UpstreamProto::Doh,
            ecs_ip: String::new(),
            ecs_ip_2nd: String::new(),
            use_client_ip: false,
            fixed_resolving: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DohConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_doh_listen")]
    pub listen: String,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub upstream_fallback: String,
    #[serde(default)]
    pub upstream_proto: UpstreamProto,
    #[serde(default = "default_doh_path")]
    pub path: String,
    #[serde(default)]
    pub ecs_ip: String,
    #[serde(rename = "2nd_ecs_ip", default)]
    pub ecs_ip_2nd: String,
    #[serde(default)]
    pub use_client_ip: bool,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub tls_cert_file: String,
    #[serde(default)]
    pub tls_key_file: String,
    #[serde(default)]
    pub fixed_resolving: Vec<FixedResolving>,
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: DEFAULT_DOH_LISTEN.to_string(),
            upstream: String::new(),
            upstream_fallback: String::new(),
            upstream_proto: UpstreamProto::Doh,
            path: DEFAULT_DOH_PATH.to_string(),
            ecs_ip: String::new(),
            ecs_ip_2nd: String::new(),
            use_client_ip: false,
            use_tls: false,
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            fixed_resolving: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheBackend {
    #[default]
    #[serde(rename = "internal")]
    Internal,
    #[serde(rename = "redis")]
    Redis,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct NameInJail {
    #[serde(default)]
    pub name_regex: String,
    #[serde(default)]
    pub country_codes: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub dns53: Dns53Config,
    #[serde(default)]
    pub doh: DohConfig,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default)]
    pub cache_backend: CacheBackend,
    #[serde(default)]
    pub redis_uri: String,
    #[serde(default)]
    pub geoip_city_db_path: String,
    #[serde(default)]
    pub ipv6_answer: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub names_in_jail: Vec<NameInJail>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dns53: Dns53Config::default(),
            doh: DohConfig::default(),
            cache_enabled: true,
            cache_backend: CacheBackend::Internal,
            redis_uri: String::new(),
            geoip_city_db_path: String::new(),
            ipv6_answer: false,
            log_level: "info".to_string(),
            names_in_jail: Vec::new(),
        }
    }
}

fn default_dns53_listen() -> String {
    DEFAULT_DNS53_LISTEN.to_string()
}

fn default_doh_listen() -> String {
    DEFAULT_DOH_LISTEN.to_string()
}

fn default_doh_path() -> String {
    DEFAULT_DOH_PATH.to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Protocol accepted on a dns53 listen entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenProto {
    Udp,
    Tcp,
}

/// Parses one `udp://host:port` / `tcp://host:port` listen entry. A missing
/// host binds the wildcard address.
pub fn parse_dns53_listen_entry(entry: &str) -> Result<(ListenProto, SocketAddr), Error> {
    let entry = entry.trim();
    let invalid =
        || Error::InvalidConfig(format!("dns53 listen entry not usable: {}", entry));
    let (scheme, rest) = entry.split_once("://").ok_or_else(invalid)?;
    let proto = match scheme.to_lowercase().as_str() {
        "udp" => ListenProto::Udp,
        "tcp" => ListenProto::Tcp,
        _ => return Err(invalid()),
    };
    let addr = parse_listen_addr(rest).ok_or_else(invalid)?;
    Ok((proto, addr))
}

/// Parses `host:port` or `:port` (wildcard host) into a socket address.
pub fn parse_listen_addr(addr: &str) -> Option<SocketAddr> {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port.parse().ok()?;
        if port == 0 {
            return None;
        }
        return Some(SocketAddr::new("0.0.0.0".parse().ok()?, port));
    }
    addr.parse().ok()
}

impl Config {
    /// Startup validation; any failure here is fatal.
    pub fn validate(&self) -> Result<(), Error> {
        if self.dns53.enabled {
            let entries: Vec<&str> = self
                .dns53
                .listen
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .collect();
            if entries.is_empty() {
                return Err(Error::InvalidConfig("dns53 listen spec is empty".into()));
            }
            for entry in entries {
                parse_dns53_listen_entry(entry)?;
            }
            validate_fixed_resolving(&self.dns53.fixed_resolving)?;
        }
        if self.doh.enabled {
            parse_listen_addr(&self.doh.listen).ok_or_else(|| {
                Error::InvalidConfig(format!("doh listen config invalid: {}", self.doh.listen))
            })?;
            if !self.doh.path.starts_with('/') {
                return Err(Error::InvalidConfig(format!(
                    "doh path must start with '/': {}",
                    self.doh.path
                )));
            }
            if self.doh.use_tls {
                for file in [&self.doh.tls_cert_file, &self.doh.tls_key_file] {
                    if !Path::new(file).exists() {
                        return Err(Error::InvalidConfig(format!(
                            "missing tls cert or key: {}",
                            file
                        )));
                    }
                }
            }
            validate_fixed_resolving(&self.doh.fixed_resolving)?;
        }
        for jail in &self.names_in_jail {
            RegexBuilder::new(&jail.name_regex)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    Error::InvalidConfig(format!("bad names_in_jail regex: {}", e))
                })?;
        }
        Ok(())
    }
}

fn validate_fixed_resolving(entries: &[FixedResolving]) -> Result<(), Error> {
    for entry in entries {
        RegexBuilder::new(&entry.name_regex)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("bad fixed_resolving regex: {}", e)))?;
        let server = entry.server.trim();
        if !server.starts_with("https://") && !server.starts_with("tcp://") {
            return Err(Error::InvalidConfig(format!(
                "fixed_resolving server must be https:// or tcp://: {}",
                server
            )));
        }
    }
    Ok(())
}
