use std::path::Path;

use anyhow::{bail, Context as _};
use clap::Parser;

use dohrelay_lib::config::def::{self, UpstreamProto};
use dohrelay_lib::{start, Config, Options};

/// DNS relay bridging dns53/DoH clients to DoH, DoH-JSON or DNS-over-TCP
/// upstreams, with GeoIP-aware EDNS Client Subnet multiplexing.
#[derive(Parser)]
#[command(name = "dohrelay", version, about, long_about = None)]
struct Cli {
    /// Use config file (yaml format); flags are ignored when set
    #[arg(long)]
    config: Option<String>,

    /// Enable dns53 relay service
    #[arg(long)]
    dns53: bool,

    /// dns53 service listen spec
    #[arg(long, default_value = def::DEFAULT_DNS53_LISTEN)]
    dns53_listen: String,

    /// Upstream resolver csv for the dns53 service,
    /// e.g. https://149.112.112.11/dns-query,https://9.9.9.11/dns-query
    #[arg(long, default_value = "")]
    dns53_upstream: String,

    /// Fallback upstream resolver csv for the dns53 service
    #[arg(long, default_value = "")]
    dns53_upstream_fallback: String,

    /// Relay dns53 queries to upstream endpoints in json format
    #[arg(long)]
    dns53_upstream_json: bool,

    /// Relay dns53 queries to upstream endpoints over dns53 (tcp)
    #[arg(long)]
    dns53_upstream_dns53: bool,

    /// dns53 primary EDNS-Client-Subnet ip csv, e.g. 12.34.56.78
    #[arg(long, default_value = "")]
    dns53_ecs_ip: String,

    /// dns53 secondary EDNS-Client-Subnet ip csv
    #[arg(long = "dns53-2nd-ecs-ip", default_value = "")]
    dns53_ecs_ip_2nd: String,

    /// Use the client transport ip as an ECS candidate on dns53
    #[arg(long)]
    dns53_use_client_ip: bool,

    /// Enable DoH relay service
    #[arg(long)]
    doh: bool,

    /// DoH relay service listen address
    #[arg(long, default_value = def::DEFAULT_DOH_LISTEN)]
    doh_listen: String,

    /// DNS-over-HTTPS endpoint path
    #[arg(long, default_value = def::DEFAULT_DOH_PATH)]
    doh_path: String,

    /// Upstream resolver csv for the DoH service
    #[arg(long, default_value = "")]
    doh_upstream: String,

    /// Fallback upstream resolver csv for the DoH service
    #[arg(long, default_value = "")]
    doh_upstream_fallback: String,

    /// Relay DoH queries to upstream endpoints in json format
    #[arg(long)]
    doh_upstream_json: bool,

    /// Relay DoH queries to upstream endpoints over dns53 (tcp)
    #[arg(long)]
    doh_upstream_dns53: bool,

    /// DoH primary EDNS-Client-Subnet ip csv
    #[arg(long, default_value = "")]
    doh_ecs_ip: String,

    /// DoH secondary EDNS-Client-Subnet ip csv
    #[arg(long = "doh-2nd-ecs-ip", default_value = "")]
    doh_ecs_ip_2nd: String,

    /// Use the client transport ip as an ECS candidate on DoH
    #[arg(long)]
    doh_use_client_ip: bool,

    /// Serve DoH over TLS instead of clear http
    #[arg(long)]
    doh_tls: bool,

    /// TLS cert path for the DoH service
    #[arg(long, default_value = "")]
    doh_tls_cert: String,

    /// TLS key path for the DoH service
    #[arg(long, default_value = "")]
    doh_tls_key: String,

    /// Cache DNS answers
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    cache: bool,

    /// Cache backend, internal or redis
    #[arg(long, default_value = "internal")]
    cache_backend: String,

    /// Redis uri for caching
    #[arg(long, default_value = "")]
    redis_uri: String,

    /// Maxmind city db file path
    #[arg(long, default_value = "")]
    maxmind_citydb_file: String,

    /// Answer AAAA questions (refused/empty otherwise)
    #[arg(long)]
    ipv6_answer: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    loglevel: String,
}

fn upstream_proto(json: bool, dns53: bool) -> UpstreamProto {
    if json {
        UpstreamProto::DohJson
    } else if dns53 {
        UpstreamProto::Dns53
    } else {
        UpstreamProto::Doh
    }
}

fn config_from_flags(cli: &Cli) -> anyhow::Result<def::Config> {
    let mut config = def::Config::default();

    config.dns53.enabled = cli.dns53;
    config.dns53.listen = cli.dns53_listen.clone();
    config.dns53.upstream = cli.dns53_upstream.clone();
    config.dns53.upstream_fallback = cli.dns53_upstream_fallback.clone();
    config.dns53.upstream_proto = upstream_proto(cli.dns53_upstream_json, cli.dns53_upstream_dns53);
    config.dns53.ecs_ip = cli.dns53_ecs_ip.clone();
    config.dns53.ecs_ip_2nd = cli.dns53_ecs_ip_2nd.clone();
    config.dns53.use_client_ip = cli.dns53_use_client_ip;

    config.doh.enabled = cli.doh;
    config.doh.listen = cli.doh_listen.clone();
    config.doh.path = cli.doh_path.clone();
    config.doh.upstream = cli.doh_upstream.clone();
    config.doh.upstream_fallback = cli.doh_upstream_fallback.clone();
    config.doh.upstream_proto = upstream_proto(cli.doh_upstream_json, cli.doh_upstream_dns53);
    config.doh.ecs_ip = cli.doh_ecs_ip.clone();
    config.doh.ecs_ip_2nd = cli.doh_ecs_ip_2nd.clone();
    config.doh.use_client_ip = cli.doh_use_client_ip;
    config.doh.use_tls = cli.doh_tls;
    config.doh.tls_cert_file = cli.doh_tls_cert.clone();
    config.doh.tls_key_file = cli.doh_tls_key.clone();

    config.cache_enabled = cli.cache;
    config.cache_backend = match cli.cache_backend.as_str() {
        "internal" => def::CacheBackend::Internal,
        "redis" => def::CacheBackend::Redis,
        other => bail!("unknown cache backend: {}", other),
    };
    config.redis_uri = cli.redis_uri.clone();
    config.geoip_city_db_path = cli.maxmind_citydb_file.clone();
    config.ipv6_answer = cli.ipv6_answer;
    config.log_level = cli.loglevel.clone();

    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) if Path::new(path).exists() => Config::File(path.clone()),
        Some(path) => bail!("config file not found: {}", path),
        None => Config::Def(config_from_flags(&cli)?),
    };

    start(Options { config, rt: None }).context("dohrelay exited with error")
}
