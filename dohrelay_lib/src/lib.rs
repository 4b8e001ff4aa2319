use std::io;
use std::sync::Arc;

use regex::RegexBuilder;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::common::geoip::GeoIp;
use crate::config::def::{self, CacheBackend, FixedResolving, UpstreamProto};
use crate::config::jail::NamesInJail;
use crate::dns::{
    Dns53Resolver, DnsError, DnsMsgAnswerer, DohJsonResolver, DohResolver, FixedResolver,
    RedisCache, ResponseCache, UpstreamResolver,
};
use crate::listener::dns53::Dns53Listener;
use crate::listener::doh::DohListener;
use crate::listener::ListenerContext;

pub mod common;
pub mod config;
pub mod dns;
pub mod listener;

pub use config::def::Config as RelayConfigDef;
pub use config::def::Dns53Config as RelayDns53ConfigDef;
pub use config::def::DohConfig as RelayDohConfigDef;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("dns error: {0}")]
    DNSError(#[from] DnsError),
    #[error("operation error: {0}")]
    Operation(String),
}

pub struct Options {
    pub config: Config,
    pub rt: Option<TokioRuntime>,
}

pub enum TokioRuntime {
    MultiThread,
    SingleThread,
}

pub enum Config {
    Def(def::Config),
    File(String),
    Str(String),
}

impl Config {
    fn try_parse(self) -> Result<def::Config, Error> {
        match self {
            Config::Def(config) => Ok(config),
            Config::File(path) => config::read_config_from_file(&path),
            Config::Str(raw) => config::parse_config(&raw),
        }
    }
}

/// Everything the listeners consume, built once at startup. No mutable
/// process-wide state exists beyond this.
pub struct AppContext {
    pub config: def::Config,
    pub geoip: Arc<GeoIp>,
    pub jail: NamesInJail,
}

impl AppContext {
    pub fn new(config: def::Config) -> Result<Self, Error> {
        config.validate()?;
        let geoip = Arc::new(GeoIp::open(&config.geoip_city_db_path));
        let jail = NamesInJail::compile(&config.names_in_jail);
        Ok(Self {
            config,
            geoip,
            jail,
        })
    }
}

pub fn start(opts: Options) -> Result<(), Error> {
    let rt = match opts.rt.as_ref().unwrap_or(&TokioRuntime::MultiThread) {
        TokioRuntime::MultiThread => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?,
        TokioRuntime::SingleThread => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?,
    };

    let config = opts.config.try_parse()?;
    setup_logging(&config.log_level);

    rt.block_on(app_runner(config))
}

fn setup_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("static fallback filter");
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

async fn app_runner(config: def::Config) -> Result<(), Error> {
    let ctx = Arc::new(AppContext::new(config)?);
    let mut handles: Vec<JoinHandle<Result<(), Error>>> = Vec::new();

    if ctx.config.dns53.enabled {
        let listener_cfg = &ctx.config.dns53;
        let answerer = build_answerer(
            &ctx,
            listener_cfg.upstream_proto,
            &listener_cfg.upstream,
            &listener_cfg.upstream_fallback,
            &listener_cfg.fixed_resolving,
        )?;
        let mut default_ecs = default_ecs_list(&listener_cfg.ecs_ip, &listener_cfg.ecs_ip_2nd);
        // HTTP upstreams report the relay's exit ip via /checkip; that ip
        // leads the default subnet list.
        if listener_cfg.upstream_proto != UpstreamProto::Dns53 {
            let endpoints = endpoints_or_default(listener_cfg.upstream_proto, &listener_cfg.upstream);
            if let Some(ip) = discover_egress_ip(&endpoints).await {
                default_ecs.insert(0, ip);
            }
        }
        let listener_ctx = Arc::new(ListenerContext {
            answerer,
            ipv6_answer: ctx.config.ipv6_answer,
            use_client_ip: listener_cfg.use_client_ip,
            default_ecs,
        });
        let listener = Dns53Listener::new(listener_ctx, &listener_cfg.listen)?;
        handles.push(tokio::spawn(listener.serve()));
    }

    if ctx.config.doh.enabled {
        let listener_cfg = &ctx.config.doh;
        let answerer = build_answerer(
            &ctx,
            listener_cfg.upstream_proto,
            &listener_cfg.upstream,
            &listener_cfg.upstream_fallback,
            &listener_cfg.fixed_resolving,
        )?;
        let listener_ctx = Arc::new(ListenerContext {
            answerer,
            ipv6_answer: ctx.config.ipv6_answer,
            use_client_ip: listener_cfg.use_client_ip,
            default_ecs: default_ecs_list(&listener_cfg.ecs_ip, &listener_cfg.ecs_ip_2nd),
        });
        let listen = def::parse_listen_addr(&listener_cfg.listen).ok_or_else(|| {
            Error::InvalidConfig(format!("doh listen config invalid: {}", listener_cfg.listen))
        })?;
        let tls_files = listener_cfg.use_tls.then(|| {
            (
                listener_cfg.tls_cert_file.clone(),
                listener_cfg.tls_key_file.clone(),
            )
        });
        let listener = DohListener::new(listener_ctx, listen, listener_cfg.path.clone(), tls_files)?;
        handles.push(tokio::spawn(listener.serve()));
    }

    if handles.is_empty() {
        return Err(Error::InvalidConfig(
            "no listener enabled, nothing to do".into(),
        ));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
        (result, _, _) = futures::future::select_all(handles) => {
            result.map_err(|e| Error::Operation(e.to_string()))?
        }
    }
}

/// One answerer per listener: primary resolver, optional fallback of the
/// same protocol, plus the name-pinned fixed resolvers.
fn build_answerer(
    ctx: &AppContext,
    proto: UpstreamProto,
    upstream_csv: &str,
    fallback_csv: &str,
    fixed: &[FixedResolving],
) -> Result<Arc<DnsMsgAnswerer>, Error> {
    let primary = make_resolver(ctx, proto, endpoints_or_default(proto, upstream_csv), true)?;
    let fallback_endpoints = split_csv(fallback_csv);
    let fallback = if fallback_endpoints.is_empty() {
        None
    } else {
        Some(make_resolver(ctx, proto, fallback_endpoints, true)?)
    };

    let mut fixed_resolvers = Vec::with_capacity(fixed.len());
    for entry in fixed {
        let pattern = RegexBuilder::new(&entry.name_regex)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("bad fixed_resolving regex: {}", e)))?;
        let proto = if entry.server.trim().starts_with("tcp://") {
            UpstreamProto::Dns53
        } else {
            UpstreamProto::Doh
        };
        // fixed answers are policy, not geography: no cache, no ECS
        let resolver = make_resolver(ctx, proto, vec![entry.server.trim().to_string()], false)?;
        fixed_resolvers.push(FixedResolver { pattern, resolver });
    }

    Ok(Arc::new(DnsMsgAnswerer::new(
        primary,
        fallback,
        fixed_resolvers,
    )))
}

fn make_resolver(
    ctx: &AppContext,
    proto: UpstreamProto,
    endpoints: Vec<String>,
    cached: bool,
) -> Result<Arc<dyn UpstreamResolver>, Error> {
    let cache = (cached && ctx.config.cache_enabled).then(|| match ctx.config.cache_backend {
        CacheBackend::Internal => ResponseCache::internal(),
        CacheBackend::Redis => {
            ResponseCache::new(Arc::new(RedisCache::new(ctx.config.redis_uri.clone())))
        }
    });
    let geoip = ctx.geoip.clone();
    Ok(match proto {
        UpstreamProto::Doh => Arc::new(DohResolver::new(endpoints, cache, geoip)?),
        UpstreamProto::DohJson => Arc::new(DohJsonResolver::new(endpoints, cache, geoip)?),
        UpstreamProto::Dns53 => Arc::new(Dns53Resolver::new(endpoints, cache, geoip)?),
    })
}

/// Asks the first HTTP upstream which egress IP it sees for us, via its
/// `/checkip` endpoint. Best effort: any failure just means no discovered
/// default subnet.
async fn discover_egress_ip(endpoints: &[String]) -> Option<String> {
    let url = checkip_url(endpoints.first()?)?;
    match common::http::http_get_string(&url).await {
        Ok(body) => {
            let ip = body.trim();
            if ip.parse::<std::net::IpAddr>().is_ok() {
                info!("upstream egress ip: {}", ip);
                Some(ip.to_string())
            } else {
                warn!("{} did not answer with an ip: {:?}", url, ip);
                None
            }
        }
        Err(e) => {
            warn!("can't discover egress ip via {}: {}", url, e);
            None
        }
    }
}

fn checkip_url(endpoint: &str) -> Option<String> {
    let url = url::Url::parse(endpoint.trim()).ok()?;
    let host = url.host_str()?;
    match url.port() {
        Some(port) => Some(format!("{}://{}:{}/checkip", url.scheme(), host, port)),
        None => Some(format!("{}://{}/checkip", url.scheme(), host)),
    }
}

fn endpoints_or_default(proto: UpstreamProto, csv: &str) -> Vec<String> {
    let endpoints = split_csv(csv);
    if endpoints.is_empty() {
        proto.default_endpoints()
    } else {
        endpoints
    }
}

fn default_ecs_list(primary_csv: &str, secondary_csv: &str) -> Vec<String> {
    let mut list = split_csv(primary_csv);
    list.extend(split_csv(secondary_csv));
    list
}

fn split_csv(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
