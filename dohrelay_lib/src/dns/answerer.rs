use std::sync::Arc;

use hickory_proto::op::{Message, MessageType};
use regex::Regex;
use tracing::{debug, warn};

use super::ecs;
use super::resolver::{self, UpstreamResolver};
use super::response::DnsResponse;
use super::{now_unix, DnsError};

/// Minimum elapsed seconds before reply TTLs are rewritten; fresher
/// responses go out untouched.
const TTL_ADJUST_THRESHOLD: i64 = 2;

/// A name-pattern-pinned resolver. Matching names always resolve through it,
/// with no ECS fan-out and no fallback.
pub struct FixedResolver {
    pub pattern: Regex,
    pub resolver: Arc<dyn UpstreamResolver>,
}

/// Turns decoded client questions into reply messages: picks the resolver
/// (fixed pattern, primary, fallback), runs the query pipeline, then repacks
/// the answer for the client with the original transaction id, question and
/// ECS.
pub struct DnsMsgAnswerer {
    primary: Arc<dyn UpstreamResolver>,
    fallback: Option<Arc<dyn UpstreamResolver>>,
    fixed: Vec<FixedResolver>,
}

impl DnsMsgAnswerer {
    pub fn new(
        primary: Arc<dyn UpstreamResolver>,
        fallback: Option<Arc<dyn UpstreamResolver>>,
        fixed: Vec<FixedResolver>,
    ) -> Self {
        Self {
            primary,
            fallback,
            fixed,
        }
    }

    pub async fn answer(&self, req: &Message, ecs_csv: &str) -> Result<Message, DnsError> {
        let question = req
            .queries()
            .first()
            .cloned()
            .ok_or_else(|| DnsError::MalformedRequest("no question in request".into()))?;
        let qname = question.name().to_string().to_lowercase();
        let qtype = question.query_type();

        let rsp = match self.fixed_for(&qname) {
            Some(fixed) => {
                debug!("fixed resolver answers {}", qname);
                resolver::query(fixed, &qname, qtype, "").await?
            }
            None => match resolver::query(self.primary.clone(), &qname, qtype, ecs_csv).await {
                Ok(rsp) => rsp,
                Err(e) => match &self.fallback {
                    Some(fallback) => {
                        warn!("primary resolver failed for {}: {}, trying fallback", qname, e);
                        resolver::query(fallback.clone(), &qname, qtype, ecs_csv).await?
                    }
                    None => return Err(e),
                },
            },
        };

        let mut reply = Message::new();
        reply.set_id(req.id());
        reply.set_message_type(MessageType::Response);
        reply.set_op_code(req.op_code());
        reply.set_recursion_desired(req.recursion_desired());
        reply.add_query(question);

        reply.set_response_code(rsp.status);
        reply.set_truncated(rsp.truncated);
        reply.set_recursion_available(rsp.recursion_available);
        reply.set_authentic_data(rsp.authentic_data);
        reply.set_checking_disabled(rsp.checking_disabled);

        let rsp = age_adjusted(rsp);
        reply.insert_answers(rsp.answer);
        reply.insert_name_servers(rsp.authority);
        reply.insert_additionals(rsp.additional);

        // The relay's ECS substitution must stay invisible: echo the
        // client's own subnet back, or none at all.
        match ecs::obtain_ecs(req) {
            Some(subnet) => ecs::change_ecs(&mut reply, subnet.addr()),
            None => ecs::remove_ecs(&mut reply),
        }

        Ok(reply)
    }

    fn fixed_for(&self, qname: &str) -> Option<Arc<dyn UpstreamResolver>> {
        self.fixed
            .iter()
            .find(|f| f.pattern.is_match(qname))
            .map(|f| f.resolver.clone())
    }
}

/// Ages the record TTLs by the time the response sat in flight or in cache,
/// skipping responses fresher than the threshold.
fn age_adjusted(rsp: DnsResponse) -> DnsResponse {
    let now = now_unix();
    if now - rsp.arrival_unix < TTL_ADJUST_THRESHOLD {
        return rsp;
    }
    rsp.ttl_adjusted(now)
}
