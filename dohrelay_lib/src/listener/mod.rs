pub mod dns53;
pub mod doh;

use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, ResponseCode};

use crate::dns::{ecs, DnsMsgAnswerer};

/// Per-listener request plumbing shared by the dns53 and DoH front ends.
pub struct ListenerContext {
    pub answerer: Arc<DnsMsgAnswerer>,
    pub ipv6_answer: bool,
    pub use_client_ip: bool,
    /// Statically configured ECS IPs, primary list before secondary.
    pub default_ecs: Vec<String>,
}

/// Assembles the ECS candidate csv for one request, in priority order:
/// the client message's own subnet, listener-supplied overrides, the client
/// transport IP (only when opted in and not private), then the configured
/// defaults. First occurrence wins on duplicates.
pub fn assemble_ecs_csv(
    msg_ecs: Option<IpAddr>,
    overrides: &[String],
    client_ip: Option<IpAddr>,
    ctx: &ListenerContext,
) -> String {
    let mut entries: Vec<String> = Vec::new();
    let mut push = |entry: String| {
        let entry = entry.trim().to_string();
        if !entry.is_empty() && !entries.contains(&entry) {
            entries.push(entry);
        }
    };

    if let Some(ip) = msg_ecs {
        push(ip.to_string());
    }
    for entry in overrides {
        push(entry.clone());
    }
    if ctx.use_client_ip {
        if let Some(ip) = client_ip {
            if !ecs::is_private_ip(&ip) {
                push(ip.to_string());
            }
        }
    }
    for entry in &ctx.default_ecs {
        push(entry.clone());
    }

    entries.join(",")
}

/// Builds a minimal reply carrying only a response code, echoing the
/// client's id and question. Used for REFUSED and SERVFAIL paths.
pub fn status_reply(req: &Message, code: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply.set_id(req.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(req.op_code());
    reply.set_recursion_desired(req.recursion_desired());
    if let Some(q) = req.queries().first() {
        reply.add_query(q.clone());
    }
    reply.set_response_code(code);
    reply
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::common::geoip::GeoIp;
    use crate::dns::DnsMsgAnswerer;

    fn ctx(use_client_ip: bool, defaults: &[&str]) -> ListenerContext {
        use crate::dns::{ResponseCache, UpstreamResolver};

        // the answerer is unused by csv assembly; a dummy satisfies the type
        struct Dummy(Arc<GeoIp>);
        #[async_trait::async_trait]
        impl UpstreamResolver for Dummy {
            async fn resolve(
                &self,
                _: &str,
                _: hickory_proto::rr::RecordType,
                _: Option<IpAddr>,
            ) -> Result<crate::dns::DnsResponse, crate::dns::DnsError> {
                Err(crate::dns::DnsError::NoResult("dummy".into()))
            }
            fn cache(&self) -> Option<&ResponseCache> {
                None
            }
            fn geoip(&self) -> &Arc<GeoIp> {
                &self.0
            }
        }

        ListenerContext {
            answerer: Arc::new(DnsMsgAnswerer::new(
                Arc::new(Dummy(Arc::new(GeoIp::empty()))),
                None,
                Vec::new(),
            )),
            ipv6_answer: false,
            use_client_ip,
            default_ecs: defaults.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn ordering_is_msg_then_overrides_then_client_then_defaults() {
        let ctx = ctx(true, &["9.9.9.9"]);
        let csv = assemble_ecs_csv(
            Some("203.0.113.7".parse().unwrap()),
            &["1.1.1.1".to_string()],
            Some("198.51.100.4".parse().unwrap()),
            &ctx,
        );
        assert_eq!(csv, "203.0.113.7,1.1.1.1,198.51.100.4,9.9.9.9");
    }

    #[test]
    fn private_client_ip_is_dropped() {
        let ctx = ctx(true, &[]);
        let csv = assemble_ecs_csv(None, &[], Some("192.168.1.20".parse().unwrap()), &ctx);
        assert_eq!(csv, "");
    }

    #[test]
    fn client_ip_requires_opt_in() {
        let ctx = ctx(false, &[]);
        let csv = assemble_ecs_csv(None, &[], Some("198.51.100.4".parse().unwrap()), &ctx);
        assert_eq!(csv, "");
    }

    #[test]
    fn duplicates_keep_first_occurrence() {
        let ctx = ctx(false, &["1.1.1.1", "8.8.8.8"]);
        let csv = assemble_ecs_csv(
            Some("1.1.1.1".parse().unwrap()),
            &["8.8.8.8".to_string()],
            None,
            &ctx,
        );
        assert_eq!(csv, "1.1.1.1,8.8.8.8");
    }

    #[test]
    fn status_reply_echoes_question() {
        use hickory_proto::op::Query;
        use hickory_proto::rr::{Name, RecordType};

        let mut req = Message::new();
        req.set_id(99);
        req.add_query(Query::query(
            Name::from_str_relaxed("example.com.").unwrap(),
            RecordType::AAAA,
        ));
        let reply = status_reply(&req, ResponseCode::Refused);
        assert_eq!(reply.id(), 99);
        assert_eq!(reply.response_code(), ResponseCode::Refused);
        assert_eq!(reply.queries().len(), 1);
        assert_eq!(reply.message_type(), MessageType::Response);
    }
}
