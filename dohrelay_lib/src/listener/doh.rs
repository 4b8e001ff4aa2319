use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Query};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use hyper::server::conn::Http;
use serde::Deserialize;
use tokio::net::TcpListener;
use rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::dns::ecs;
use crate::Error;

use super::{assemble_ecs_csv, status_reply, ListenerContext};

const DNS_MESSAGE_MIME: &str = "application/dns-message";
const ECS_HEADER: &str = "x-edns-client-subnet";
const REAL_IP_HEADER: &str = "x-real-ip";

/// DoH front end: RFC 8484 GET/POST on the configured path plus a /checkip
/// helper, optionally behind TLS.
pub struct DohListener {
    ctx: Arc<ListenerContext>,
    listen: SocketAddr,
    path: String,
    tls: Option<TlsAcceptor>,
}

/// Socket peer of the current connection, injected per accepted stream.
#[derive(Clone, Copy)]
struct ClientAddr(SocketAddr);

#[derive(Debug, Deserialize, Default)]
struct DnsQueryParams {
    #[serde(default)]
    dns: String,
}

impl DohListener {
    pub fn new(
        ctx: Arc<ListenerContext>,
        listen: SocketAddr,
        path: String,
        tls_files: Option<(String, String)>,
    ) -> Result<Self, Error> {
        let tls = match tls_files {
            Some((cert_file, key_file)) => Some(tls_acceptor(&cert_file, &key_file)?),
            None => None,
        };
        Ok(Self {
            ctx,
            listen,
            path,
            tls,
        })
    }

    fn router(&self) -> Router {
        Router::new()
            .route(&self.path, get(doh_get).post(doh_post))
            .route("/checkip", get(checkip))
            .layer(Extension(self.ctx.clone()))
    }

    pub async fn serve(self) -> Result<(), Error> {
        let listener = TcpListener::bind(self.listen).await?;
        info!(
            "doh listening on {}{} (tls: {})",
            self.listen,
            self.path,
            self.tls.is_some()
        );
        let base = self.router();
        loop {
            let (stream, peer) = listener.accept().await?;
            let app = base.clone().layer(Extension(ClientAddr(peer)));
            let tls = self.tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(e) =
                                Http::new().serve_connection(tls_stream, app).await
                            {
                                debug!("doh tls connection from {} ended: {}", peer, e);
                            }
                        }
                        Err(e) => debug!("tls handshake with {} failed: {}", peer, e),
                    },
                    None => {
                        if let Err(e) = Http::new().serve_connection(stream, app).await {
                            debug!("doh connection from {} ended: {}", peer, e);
                        }
                    }
                }
            });
        }
    }
}

fn tls_acceptor(cert_file: &str, key_file: &str) -> Result<TlsAcceptor, Error> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))?
        .into_iter()
        .map(Certificate)
        .collect::<Vec<_>>();
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(key_file)?))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(File::open(key_file)?))?;
    }
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| Error::InvalidConfig(format!("no private key in {}", key_file)))?;
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKey(key))
        .map_err(|e| Error::InvalidConfig(format!("bad tls cert/key: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn doh_get(
    Extension(ctx): Extension<Arc<ListenerContext>>,
    Extension(peer): Extension<ClientAddr>,
    Query(params): Query<DnsQueryParams>,
    headers: HeaderMap,
) -> Response {
    if params.dns.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "missing dns parameter").into_response();
    }
    let wire = match URL_SAFE_NO_PAD.decode(params.dns.trim().as_bytes()) {
        Ok(wire) => wire,
        Err(e) => {
            debug!("bad dns parameter: {}", e);
            return (StatusCode::BAD_REQUEST, "bad dns parameter").into_response();
        }
    };
    respond(ctx, peer, headers, &wire).await
}

async fn doh_post(
    Extension(ctx): Extension<Arc<ListenerContext>>,
    Extension(peer): Extension<ClientAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    respond(ctx, peer, headers, &body).await
}

async fn checkip(
    Extension(peer): Extension<ClientAddr>,
    headers: HeaderMap,
) -> String {
    client_ip(&headers, peer).to_string()
}

async fn respond(
    ctx: Arc<ListenerContext>,
    peer: ClientAddr,
    headers: HeaderMap,
    wire: &[u8],
) -> Response {
    let req = match Message::from_vec(wire) {
        Ok(req) => req,
        Err(e) => {
            debug!("undecodable doh request: {}", e);
            return (StatusCode::BAD_REQUEST, "bad dns message").into_response();
        }
    };

    // AAAA answering disabled: empty NOERROR, upstream untouched.
    let qtype = req.queries().first().map(|q| q.query_type());
    if qtype == Some(RecordType::AAAA) && !ctx.ipv6_answer {
        return wire_response(&status_reply(&req, ResponseCode::NoError));
    }

    let msg_ecs = ecs::obtain_ecs(&req).map(|subnet| subnet.addr());
    let overrides = subnet_overrides(&headers);
    let csv = assemble_ecs_csv(msg_ecs, &overrides, Some(client_ip(&headers, peer)), &ctx);
    debug!("doh request ecs candidates: {}", csv);

    match ctx.answerer.answer(&req, &csv).await {
        Ok(reply) => wire_response(&reply),
        Err(e) => {
            warn!("doh answer failed: {}", e);
            wire_response(&status_reply(&req, ResponseCode::ServFail))
        }
    }
}

/// Entries of the `X-EDNS-Client-Subnet` header, comma-separated IPs or
/// CIDRs supplied by a trusted front proxy.
fn subnet_overrides(headers: &HeaderMap) -> Vec<String> {
    headers
        .get(ECS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Trusted client address: `X-Real-IP` when a front proxy supplies it, the
/// socket peer otherwise.
fn client_ip(headers: &HeaderMap, peer: ClientAddr) -> IpAddr {
    headers
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or_else(|| peer.0.ip())
}

/// Serialises a reply as `application/dns-message`. Failures degrade to an
/// HTTP 500 with no body.
fn wire_response(reply: &Message) -> Response {
    match reply.to_vec() {
        Ok(wire) => (
            StatusCode::OK,
            [(CONTENT_TYPE, DNS_MESSAGE_MIME)],
            wire,
        )
            .into_response(),
        Err(e) => {
            warn!("can't encode doh reply: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn subnet_overrides_split_and_trim() {
        let mut headers = HeaderMap::new();
        headers.insert(
            ECS_HEADER,
            HeaderValue::from_static(" 1.1.1.1 , 8.8.8.0/24 ,,"),
        );
        assert_eq!(subnet_overrides(&headers), vec!["1.1.1.1", "8.8.8.0/24"]);
        assert!(subnet_overrides(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn client_ip_prefers_real_ip_header() {
        let peer = ClientAddr("127.0.0.1:9999".parse().unwrap());
        let mut headers = HeaderMap::new();
        headers.insert(REAL_IP_HEADER, HeaderValue::from_static("203.0.113.9"));
        assert_eq!(
            client_ip(&headers, peer),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            client_ip(&HeaderMap::new(), peer),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn dns_param_round_trip() {
        use hickory_proto::op::Query as DnsQuery;
        use hickory_proto::rr::Name;

        let mut msg = Message::new();
        msg.set_id(1234);
        msg.add_query(DnsQuery::query(
            Name::from_str_relaxed("example.com.").unwrap(),
            RecordType::A,
        ));
        let encoded = URL_SAFE_NO_PAD.encode(msg.to_vec().unwrap());
        let decoded = URL_SAFE_NO_PAD.decode(encoded.as_bytes()).unwrap();
        assert_eq!(Message::from_vec(&decoded).unwrap().id(), 1234);
    }
}
