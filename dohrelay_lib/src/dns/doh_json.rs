use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Name, Record, RecordType};
use hickory_proto::serialize::txt::Parser;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::common::geoip::GeoIp;

use super::cache::ResponseCache;
use super::endpoints::EndpointRing;
use super::resolver::UpstreamResolver;
use super::response::DnsResponse;
use super::{now_unix, DnsError};

/// Google/Cloudflare JSON-schema DoH upstream.
pub struct DohJsonResolver {
    http_client: reqwest::Client,
    endpoints: EndpointRing,
    cache: Option<ResponseCache>,
    geoip: Arc<GeoIp>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct JsonQuestion {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub qtype: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct JsonRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub rtype: u16,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct JsonResponse {
    #[serde(rename = "Status", default)]
    pub status: u32,
    #[serde(rename = "TC", default)]
    pub truncated: bool,
    // carried by the schema; the reply's RD comes from the client request
    #[allow(dead_code)]
    #[serde(rename = "RD", default)]
    pub recursion_desired: bool,
    #[serde(rename = "RA", default)]
    pub recursion_available: bool,
    #[serde(rename = "AD", default)]
    pub authentic_data: bool,
    #[serde(rename = "CD", default)]
    pub checking_disabled: bool,
    #[serde(rename = "Question", default)]
    pub question: Vec<JsonQuestion>,
    #[serde(rename = "Answer", default)]
    pub answer: Vec<JsonRecord>,
    #[serde(rename = "Authority", default)]
    pub authority: Vec<JsonRecord>,
    #[serde(rename = "Additional", default)]
    pub additional: Vec<JsonRecord>,
    #[serde(rename = "edns_client_subnet", default)]
    pub edns_client_subnet: String,
    #[serde(rename = "Comment", default)]
    pub comment: String,
}

impl DohJsonResolver {
    pub fn new(
        endpoints: Vec<String>,
        cache: Option<ResponseCache>,
        geoip: Arc<GeoIp>,
    ) -> Result<Self, crate::Error> {
        if endpoints.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "doh_json resolver needs at least one endpoint".into(),
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

/// Converts one JSON RR to a wire record by composing a zone-file line and
/// running it through the standard RR parser.
pub(crate) fn json_rr_to_record(rr: &JsonRecord) -> Result<Record, DnsError> {
    let mut name = rr.name.trim().to_string();
    if !name.ends_with('.') {
        name.push('.');
    }
    let rtype = RecordType::from(rr.rtype);
    let line = format!("{} {} IN {} {}", name, rr.ttl, rtype, rr.data);
    let (_, sets) = Parser::new(line.as_str(), None, Some(Name::root()))
        .parse()
        .map_err(|e| DnsError::UpstreamDecode(format!("bad json rr {:?}: {}", rr, e)))?;
    sets.into_iter()
        .flat_map(|(_, set)| set.records_without_rrsigs().cloned().collect::<Vec<_>>())
        .next()
        .ok_or_else(|| DnsError::UpstreamDecode(format!("json rr {:?} produced no record", rr)))
}

/// Maps the JSON body to the transport-neutral response. A conversion
/// failure on an answer record fails the resolve; failures on authority or
/// additional records drop the record.
pub(crate) fn json_to_response(json: &JsonResponse) -> Result<DnsResponse, DnsError> {
    let mut answer = Vec::with_capacity(json.answer.len());
    for rr in &json.answer {
        answer.push(json_rr_to_record(rr)?);
    }
    let lossy_convert = |records: &[JsonRecord], section: &str| {
        records
            .iter()
            .filter_map(|rr| match json_rr_to_record(rr) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("dropping unparsable {} record: {}", section, e);
                    None
                }
            })
            .collect::<Vec<_>>()
    };
    Ok(DnsResponse {
        status: ResponseCode::from(0, json.status as u8),
        truncated: json.truncated,
        recursion_available: json.recursion_available,
        authentic_data: json.authentic_data,
        checking_disabled: json.checking_disabled,
        answer,
        authority: lossy_convert(&json.authority, "authority"),
        additional: lossy_convert(&json.additional, "additional"),
        arrival_unix: now_unix(),
    })
}

#[async_trait]
impl UpstreamResolver for DohJsonResolver {
    async fn resolve(
        &self,
        qname: &str,
        qtype: RecordType,
        ecs_ip: Option<IpAddr>,
    ) -> Result<DnsResponse, DnsError> {
        let ecs_param = ecs_ip
            .map(|ip| format!("&edns_client_subnet={}", ip))
            .unwrap_or_default();
        // The padding value only exists to make on-path HTTP caching useless.
        let random_padding = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let endpoint = self.endpoints.next();
        let url = format!(
            "{}?name={}&type={}&do=1{}&random_padding={}",
            endpoint,
            qname,
            u16::from(qtype),
            ecs_param,
            random_padding
        );
        debug!("doh json query {} {} via {}", qname, qtype, endpoint);

        let http_rsp = self
            .http_client
            .get(&url)
            .header(
                reqwest::header::ACCEPT,
                "application/x-javascript,application/json",
            )
            .send()
            .await?;
        let status = http_rsp.status();
        if status.as_u16() >= 400 {
            return Err(DnsError::UpstreamHttp(status.as_u16()));
        }
        let json: JsonResponse = http_rsp
            .json()
            .await
            .map_err(|e| DnsError::UpstreamDecode(e.to_string()))?;
        if json.status != 0 {
            debug!(
                "json upstream answered status {} (subnet {:?}, comment {:?})",
                json.status, json.edns_client_subnet, json.comment
            );
        }
        if let Some(q) = json.question.first() {
            trace!("json reply to question {} type {}", q.name, q.qtype);
        }
        json_to_response(&json)
    }

    fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    fn geoip(&self) -> &Arc<GeoIp> {
        &self.geoip
    }
}
