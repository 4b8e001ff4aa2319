use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, error, info, warn};

use crate::config::def::{parse_dns53_listen_entry, ListenProto};
use crate::dns::ecs;
use crate::Error;

use super::{assemble_ecs_csv, status_reply, ListenerContext};

const MAX_UDP_PAYLOAD: usize = 65535;

/// Classic port-53 front end: one UDP datagram loop and one TCP
/// length-prefixed loop per configured listen entry, a task per request.
pub struct Dns53Listener {
    ctx: Arc<ListenerContext>,
    entries: Vec<(ListenProto, SocketAddr)>,
}

impl Dns53Listener {
    pub fn new(ctx: Arc<ListenerContext>, listen_spec: &str) -> Result<Self, Error> {
        let mut entries = Vec::new();
        for entry in listen_spec.split(',') {
            if entry.trim().is_empty() {
                continue;
            }
            entries.push(parse_dns53_listen_entry(entry)?);
        }
        if entries.is_empty() {
            return Err(Error::InvalidConfig("dns53 listen spec is empty".into()));
        }
        Ok(Self { ctx, entries })
    }

    pub async fn serve(self) -> Result<(), Error> {
        let mut handles = Vec::new();
        for (proto, addr) in self.entries {
            let ctx = self.ctx.clone();
            match proto {
                ListenProto::Udp => {
                    let socket = Arc::new(UdpSocket::bind(addr).await?);
                    info!("dns53 listening on udp://{}", addr);
                    handles.push(tokio::spawn(serve_udp(socket, ctx)));
                }
                ListenProto::Tcp => {
                    let listener = TcpListener::bind(addr).await?;
                    info!("dns53 listening on tcp://{}", addr);
                    handles.push(tokio::spawn(serve_tcp(listener, ctx)));
                }
            }
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| Error::Operation(e.to_string()))??;
        }
        Ok(())
    }
}

async fn serve_udp(socket: Arc<UdpSocket>, ctx: Arc<ListenerContext>) -> Result<(), Error> {
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let packet = buf[..len].to_vec();
        let socket = socket.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Some(reply) = handle_packet(&ctx, &packet, peer).await {
                if let Err(e) = socket.send_to(&reply, peer).await {
                    warn!("can't send dns53 reply to {}: {}", peer, e);
                }
            }
        });
    }
}

async fn serve_tcp(listener: TcpListener, ctx: Arc<ListenerContext>) -> Result<(), Error> {
    loop {
        let (mut stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                let len = match stream.read_u16().await {
                    Ok(len) => len as usize,
                    Err(_) => return,
                };
                let mut packet = vec![0u8; len];
                if stream.read_exact(&mut packet).await.is_err() {
                    return;
                }
                let Some(reply) = handle_packet(&ctx, &packet, peer).await else {
                    return;
                };
                if stream.write_u16(reply.len() as u16).await.is_err() {
                    return;
                }
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
        });
    }
}

/// Decodes one client message and produces reply bytes. `None` means the
/// request was unreadable and is dropped.
async fn handle_packet(
    ctx: &ListenerContext,
    packet: &[u8],
    peer: SocketAddr,
) -> Option<Vec<u8>> {
    let req = match Message::from_vec(packet) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("dropping undecodable dns53 request from {}: {}", peer, e);
            return None;
        }
    };
    let reply = answer_request(ctx, &req, peer).await;
    match reply.to_vec() {
        Ok(wire) => Some(wire),
        Err(e) => {
            error!("can't encode dns53 reply: {}", e);
            None
        }
    }
}

async fn answer_request(ctx: &ListenerContext, req: &Message, peer: SocketAddr) -> Message {
    let qtype = req.queries().first().map(|q| q.query_type());
    if qtype == Some(RecordType::AAAA) && !ctx.ipv6_answer {
        return status_reply(req, ResponseCode::Refused);
    }

    let msg_ecs = ecs::obtain_ecs(req).map(|subnet| subnet.addr());
    let csv = assemble_ecs_csv(msg_ecs, &[], Some(peer.ip()), ctx);

    match ctx.answerer.answer(req, &csv).await {
        Ok(reply) => reply,
        Err(crate::dns::DnsError::MalformedRequest(e)) => {
            debug!("refusing malformed dns53 request: {}", e);
            status_reply(req, ResponseCode::Refused)
        }
        Err(e) => {
            warn!("dns53 answer failed: {}", e);
            status_reply(req, ResponseCode::ServFail)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;

    use super::*;
    use crate::dns::{DnsMsgAnswerer, DnsResponse, ResponseCache, UpstreamResolver};
    use crate::common::geoip::GeoIp;

    struct Fixed {
        geoip: Arc<GeoIp>,
    }

    #[async_trait::async_trait]
    impl UpstreamResolver for Fixed {
        async fn resolve(
            &self,
            qname: &str,
            _qtype: RecordType,
            _ecs_ip: Option<IpAddr>,
        ) -> Result<DnsResponse, crate::dns::DnsError> {
            use crate::dns::DnsError;
            use hickory_proto::rr::rdata::A;
            use hickory_proto::rr::{RData, Record};
            if qname.starts_with("down.") {
                return Err(DnsError::UpstreamHttp(500));
            }
            let mut rsp = DnsResponse::from_message(&Message::new());
            rsp.status = ResponseCode::NoError;
            rsp.answer = vec![Record::from_rdata(
                Name::from_str_relaxed(qname).unwrap(),
                60,
                RData::A(A("93.184.216.34".parse().unwrap())),
            )];
            Ok(rsp)
        }

        fn cache(&self) -> Option<&ResponseCache> {
            None
        }

        fn geoip(&self) -> &Arc<GeoIp> {
            &self.geoip
        }
    }

    fn test_ctx(ipv6_answer: bool) -> Arc<ListenerContext> {
        let geoip = Arc::new(GeoIp::empty());
        Arc::new(ListenerContext {
            answerer: Arc::new(DnsMsgAnswerer::new(
                Arc::new(Fixed { geoip }),
                None,
                Vec::new(),
            )),
            ipv6_answer,
            use_client_ip: false,
            default_ecs: Vec::new(),
        })
    }

    fn request(qname: &str, qtype: RecordType) -> Message {
        let mut req = Message::new();
        req.set_id(7);
        req.add_query(Query::query(Name::from_str_relaxed(qname).unwrap(), qtype));
        req
    }

    #[tokio::test]
    async fn aaaa_is_refused_when_ipv6_disabled() {
        let ctx = test_ctx(false);
        let reply = answer_request(
            &ctx,
            &request("example.com.", RecordType::AAAA),
            "127.0.0.1:5555".parse().unwrap(),
        )
        .await;
        assert_eq!(reply.response_code(), ResponseCode::Refused);
        assert_eq!(reply.id(), 7);
    }

    #[tokio::test]
    async fn answer_error_maps_to_servfail() {
        let ctx = test_ctx(true);
        let reply = answer_request(
            &ctx,
            &request("down.example.com.", RecordType::A),
            "127.0.0.1:5555".parse().unwrap(),
        )
        .await;
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
    }

    #[tokio::test]
    async fn a_query_is_answered() {
        let ctx = test_ctx(false);
        let reply = answer_request(
            &ctx,
            &request("example.com.", RecordType::A),
            "127.0.0.1:5555".parse().unwrap(),
        )
        .await;
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 1);
    }

    #[tokio::test]
    async fn listener_rejects_empty_spec() {
        assert!(Dns53Listener::new(test_ctx(false), " , ").is_err());
    }
}
