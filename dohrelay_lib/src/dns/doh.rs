use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use tracing::{debug, trace};

use crate::common::geoip::GeoIp;

use super::cache::ResponseCache;
use super::ecs;
use super::endpoints::EndpointRing;
use super::resolver::UpstreamResolver;
use super::response::DnsResponse;
use super::DnsError;

/// RFC 8484 upstream: the query is packed to wire format, base64url-encoded
/// without padding, and fetched with `GET {endpoint}?dns=...`.
pub struct DohResolver {
    http_client: reqwest::Client,
    endpoints: EndpointRing,
    cache: Option<ResponseCache>,
    geoip: Arc<GeoIp>,
}

impl DohResolver {
    pub fn new(
        endpoints: Vec<String>,
        cache: Option<ResponseCache>,
        geoip: Arc<GeoIp>,
    ) -> Result<Self, crate::Error> {
        if endpoints.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "doh resolver needs at least one endpoint".into(),
            ));
        }
        let http_client = crate::common::http::new_http_client()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        Ok(Self {
            http_client,
            endpoints: EndpointRing::new(endpoints),
            cache,
            geoip,
        })
    }
}

/// Builds the outgoing wire query: random id, RD set, optional ECS.
pub(crate) fn build_query_msg(
    qname: &str,
    qtype: RecordType,
    ecs_ip: Option<IpAddr>,
) -> Result<Message, DnsError> {
    let name = Name::from_str_relaxed(qname)
        .map_err(|e| DnsError::MalformedRequest(format!("invalid name {}: {}", qname, e)))?;
    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, qtype));
    if let Some(ip) = ecs_ip {
        ecs::change_ecs(&mut msg, ip);
    }
    Ok(msg)
}

#[async_trait]
impl UpstreamResolver for DohResolver {
    async fn resolve(
        &self,
        qname: &str,
        qtype: RecordType,
        ecs_ip: Option<IpAddr>,
    ) -> Result<DnsResponse, DnsError> {
        let msg = build_query_msg(qname, qtype, ecs_ip)?;
        let wire = msg.to_vec()?;
        let dns_param = URL_SAFE_NO_PAD.encode(&wire);

        let endpoint = self.endpoints.next();
        let url = format!("{}?dns={}", endpoint, dns_param);
        debug!("doh query {} {} via {}", qname, qtype, endpoint);

        let http_rsp = self
            .http_client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/dns-message")
            .send()
            .await?;
        let status = http_rsp.status();
        if status.as_u16() >= 400 {
            return Err(DnsError::UpstreamHttp(status.as_u16()));
        }
        let body = http_rsp.bytes().await?;
        let msg_rsp = Message::from_vec(&body)?;
        trace!("doh reply from upstream: {:?}", msg_rsp);
        Ok(DnsResponse::from_message(&msg_rsp))
    }

    fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    fn geoip(&self) -> &Arc<GeoIp> {
        &self.geoip
    }
}
