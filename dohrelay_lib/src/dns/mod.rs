use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

mod answerer;
mod cache;
mod dns53;
mod doh;
mod doh_json;
pub mod ecs;
mod endpoints;
mod pool;
mod resolver;
mod response;

pub use answerer::{DnsMsgAnswerer, FixedResolver};
pub use cache::{CacheEntry, CacheStore, InternalCache, RedisCache, ResponseCache};
pub use dns53::Dns53Resolver;
pub use doh::DohResolver;
pub use doh_json::DohJsonResolver;
pub use endpoints::EndpointRing;
pub use resolver::{query, UpstreamResolver};
pub use response::DnsResponse;

/// Errors raised inside the resolver pipeline.
#[derive(Error, Debug)]
pub enum DnsError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("upstream http error: status {0}")]
    UpstreamHttp(u16),

    #[error("upstream decode error: {0}")]
    UpstreamDecode(String),

    #[error("connection pool dial failed: {0}")]
    PoolDial(String),

    #[error("no result from any upstream: {0}")]
    NoResult(String),

    #[error("cache backend error: {0}")]
    CacheBackend(String),

    #[error("upstream io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<hickory_proto::ProtoError> for DnsError {
    fn from(e: hickory_proto::ProtoError) -> Self {
        DnsError::UpstreamDecode(e.to_string())
    }
}

/// Wall-clock seconds since the unix epoch. Response arrival and cache set
/// times are kept in this unit so TTL arithmetic is plain integer math.
pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
