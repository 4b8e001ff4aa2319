use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};
use url::Url;

use crate::common::geoip::GeoIp;

use super::cache::ResponseCache;
use super::doh::build_query_msg;
use super::pool::{PooledConn, TcpConnPool};
use super::resolver::UpstreamResolver;
use super::response::DnsResponse;
use super::DnsError;

/// Classic DNS upstream over TCP port 53, with a bounded connection pool.
/// Only `tcp://host:port` endpoints are accepted.
pub struct Dns53Resolver {
    pool: TcpConnPool,
    cache: Option<ResponseCache>,
    geoip: Arc<GeoIp>,
}

impl Dns53Resolver {
    pub fn new(
        endpoints: Vec<String>,
        cache: Option<ResponseCache>,
        geoip: Arc<GeoIp>,
    ) -> Result<Self, crate::Error> {
        let mut addrs = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            addrs.push(validate_endpoint(endpoint)?);
        }
        if addrs.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "dns53 resolver needs at least one tcp:// endpoint".into(),
            ));
        }
        Ok(Self {
            pool: TcpConnPool::new(addrs),
            cache,
            geoip,
        })
    }

    /// One length-prefixed exchange on a pooled connection. A failed
    /// exchange poisons the connection so it is closed instead of reused.
    async fn exchange(&self, msg: &Message) -> Result<Message, DnsError> {
        let wire = msg.to_vec()?;
        let mut conn = self.pool.get().await?;
        match Self::exchange_on(&mut conn, &wire).await {
            Ok(rsp) => Ok(rsp),
            Err(e) => {
                conn.mark_unusable();
                Err(e)
            }
        }
    }

    async fn exchange_on(conn: &mut PooledConn, wire: &[u8]) -> Result<Message, DnsError> {
        conn.write_u16(wire.len() as u16).await?;
        conn.write_all(wire).await?;
        conn.flush().await?;

        let len = conn.read_u16().await? as usize;
        let mut buf = vec![0u8; len];
        conn.read_exact(&mut buf).await?;
        Ok(Message::from_vec(&buf)?)
    }
}

fn validate_endpoint(endpoint: &str) -> Result<String, crate::Error> {
    let invalid = || {
        crate::Error::InvalidConfig(format!(
            "dns53 endpoint not usable, should be like tcp://8.8.8.8:53: {}",
            endpoint
        ))
    };
    let url = Url::parse(endpoint.trim()).map_err(|_| invalid())?;
    if url.scheme().to_lowercase() != "tcp" {
        return Err(invalid());
    }
    let host = url.host_str().ok_or_else(invalid)?;
    let port = url.port().ok_or_else(invalid)?;
    Ok(format!("{}:{}", host, port))
}

#[async_trait]
impl UpstreamResolver for Dns53Resolver {
    async fn resolve(
        &self,
        qname: &str,
        qtype: RecordType,
        ecs_ip: Option<IpAddr>,
    ) -> Result<DnsResponse, DnsError> {
        let msg = build_query_msg(qname, qtype, ecs_ip)?;
        debug!("dns53 query {} {}", qname, qtype);
        let msg_rsp = self.exchange(&msg).await?;
        trace!("dns53 reply from upstream: {:?}", msg_rsp);
        Ok(DnsResponse::from_message(&msg_rsp))
    }

    fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    fn geoip(&self) -> &Arc<GeoIp> {
        &self.geoip
    }
}
