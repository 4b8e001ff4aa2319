use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::rr::{RData, RecordType};
use tracing::{debug, info, warn};

use crate::common::geoip::GeoIp;

use super::cache::{ResponseCache, MAX_BACKEND_TTL};
use super::ecs;
use super::response::DnsResponse;
use super::DnsError;

/// The contract every upstream transport variant implements. `resolve` is a
/// single uncached exchange; caching, ECS fan-out and winner selection live
/// in [`query`], which all call sites go through.
#[async_trait]
pub trait UpstreamResolver: Send + Sync {
    async fn resolve(
        &self,
        qname: &str,
        qtype: RecordType,
        ecs_ip: Option<IpAddr>,
    ) -> Result<DnsResponse, DnsError>;

    fn cache(&self) -> Option<&ResponseCache>;

    fn geoip(&self) -> &Arc<GeoIp>;
}

/// One ECS fan-out candidate: the subnet IP to advertise and the country the
/// answer is expected to geolocate to.
#[derive(Debug, Clone)]
struct EcsCandidate {
    ip: IpAddr,
    country: String,
    state: String,
}

/// Resolves a question through the shared cache + fan-out pipeline.
///
/// The ECS csv is classified through GeoIP into one candidate per country
/// (first-seen order). A cache hit short-circuits; a miss fans out one
/// resolve per candidate and the earliest candidate whose answer geolocates
/// to its own country wins. Successful responses with a minimal TTL above
/// one second are written back to the cache.
pub async fn query(
    rsv: Arc<dyn UpstreamResolver>,
    qname: &str,
    qtype: RecordType,
    ecs_csv: &str,
) -> Result<DnsResponse, DnsError> {
    let qname = normalize_qname(qname);
    let candidates = geo_candidates(rsv.geoip(), ecs_csv);
    let key = fingerprint(&qname, qtype, &candidates);

    if let Some(cache) = rsv.cache() {
        if let Some(hit) = cache.get(&key).await {
            info!("cache hit for {} {}", qname, qtype);
            return Ok(hit);
        }
    }

    let result = resolve_with_ecs_ips(rsv.clone(), &qname, qtype, &candidates).await;

    if let Some(cache) = rsv.cache() {
        match &result {
            Ok(rsp) => {
                let min_ttl = rsp.min_ttl();
                if min_ttl > 1 {
                    cache
                        .set(key, Arc::new(rsp.clone()), min_ttl.min(MAX_BACKEND_TTL))
                        .await;
                }
            }
            Err(e) => debug!("not caching failed resolve for {}: {}", qname, e),
        }
    }

    result
}

/// Fan-out of one question across the ECS candidates. Non-address queries
/// and empty candidate lists collapse to a single resolve with no ECS.
async fn resolve_with_ecs_ips(
    rsv: Arc<dyn UpstreamResolver>,
    qname: &str,
    qtype: RecordType,
    candidates: &[EcsCandidate],
) -> Result<DnsResponse, DnsError> {
    if candidates.is_empty() || !matches!(qtype, RecordType::A | RecordType::AAAA) {
        return rsv.resolve(qname, qtype, None).await;
    }

    let mut tasks = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let rsv = rsv.clone();
        let qname = qname.to_string();
        let candidate = candidate.clone();
        tasks.push(tokio::spawn(async move {
            let geoip = rsv.geoip().clone();
            rsv.resolve(&qname, qtype, Some(candidate.ip))
                .await
                .map(|rsp| {
                    let matched = answer_matches_country(&rsp, qtype, &candidate.country, &geoip);
                    (rsp, matched)
                })
        }));
    }

    // Selection is strictly candidate order: the first listed subnet is the
    // preferred view. Later tasks keep running detached once a winner is
    // found; their results are dropped.
    let mut last_ok: Option<DnsResponse> = None;
    let mut last_err: Option<DnsError> = None;
    for task in tasks {
        match task.await {
            Ok(Ok((rsp, true))) => return Ok(rsp),
            Ok(Ok((rsp, false))) => last_ok = Some(rsp),
            Ok(Err(e)) => {
                warn!("fan-out resolve for {} failed: {}", qname, e);
                last_err = Some(e);
            }
            Err(e) => last_err = Some(DnsError::NoResult(e.to_string())),
        }
    }

    match last_ok {
        Some(rsp) => Ok(rsp),
        None => Err(last_err.unwrap_or_else(|| DnsError::NoResult(qname.to_string()))),
    }
}

/// True iff at least one address record of the queried family geolocates to
/// the expected country.
fn answer_matches_country(
    rsp: &DnsResponse,
    qtype: RecordType,
    expected_country: &str,
    geoip: &GeoIp,
) -> bool {
    rsp.answer.iter().any(|record| {
        let ip = match (qtype, record.data()) {
            (RecordType::A, RData::A(v4)) => IpAddr::V4(**v4),
            (RecordType::AAAA, RData::AAAA(v6)) => IpAddr::V6(**v6),
            _ => return false,
        };
        geoip.country(ip) == expected_country
    })
}

/// Classifies the csv into fan-out candidates: parse, geo-locate, drop
/// unknown countries, keep one representative IP per country in first-seen
/// order.
fn geo_candidates(geoip: &GeoIp, ecs_csv: &str) -> Vec<EcsCandidate> {
    let mut candidates: Vec<EcsCandidate> = Vec::new();
    for ip in ecs::candidate_ips(ecs_csv) {
        let loc = geoip.lookup(ip);
        if loc.country.is_empty() {
            continue;
        }
        if candidates.iter().any(|c| c.country == loc.country) {
            continue;
        }
        candidates.push(EcsCandidate {
            ip,
            country: loc.country,
            state: loc.state,
        });
    }
    candidates
}

/// Stable cache key: `NAME[<qname>]TYPE[<qtype>]LOC[<cc,state>|…]`, the LOC
/// segment omitted without candidates. City is intentionally not part of the
/// key.
fn fingerprint(qname: &str, qtype: RecordType, candidates: &[EcsCandidate]) -> String {
    let mut key = format!("NAME[{}]TYPE[{}]", qname, u16::from(qtype));
    if !candidates.is_empty() {
        let locs: Vec<String> = candidates
            .iter()
            .map(|c| format!("{},{}", c.country, c.state))
            .collect();
        key.push_str(&format!("LOC[{}]", locs.join("|")));
    }
    key
}

/// Lower-cases and FQDN-normalises a query name.
fn normalize_qname(qname: &str) -> String {
    let mut name = qname.trim().to_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::response::testutil::*;
    use super::testutil::*;
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_country_deduped() {
        let geoip = geo_table();
        // 1.1.1.1 and 8.8.8.8 are both US: the second is dropped.
        let a = geo_candidates(&geoip, "1.1.1.1,8.8.8.8,114.114.114.114");
        let b = geo_candidates(&geoip, "1.1.1.1,114.114.114.114");
        assert_eq!(
            fingerprint("example.com.", RecordType::A, &a),
            fingerprint("example.com.", RecordType::A, &b),
        );
        assert_eq!(
            fingerprint("example.com.", RecordType::A, &a),
            "NAME[example.com.]TYPE[1]LOC[US,|CN,]"
        );
    }

    #[test]
    fn fingerprint_omits_loc_without_candidates() {
        assert_eq!(
            fingerprint("example.com.", RecordType::AAAA, &[]),
            "NAME[example.com.]TYPE[28]"
        );
    }

    #[test]
    fn fingerprint_carries_state() {
        let geoip = geo_table();
        let c = geo_candidates(&geoip, "31.13.24.1");
        assert_eq!(
            fingerprint("example.com.", RecordType::A, &c),
            "NAME[example.com.]TYPE[1]LOC[DE,Hessen]"
        );
    }

    #[test]
    fn unknown_geo_candidates_are_dropped() {
        let geoip = geo_table();
        let c = geo_candidates(&geoip, "203.0.113.9,1.1.1.1");
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].country, "US");
    }

    #[tokio::test]
    async fn miss_then_hit_issues_one_upstream_request() {
        let geoip = geo_table();
        let rsv = Arc::new(
            FixtureResolver::new(geoip)
                .with_cache()
                .respond(None, answer_response(vec![a_record(
                    "example.com.",
                    300,
                    "93.184.216.34".parse().unwrap(),
                )])),
        );

        let first = query(rsv.clone(), "example.com", RecordType::A, "")
            .await
            .unwrap();
        assert_eq!(first.answer[0].ttl(), 300);
        assert_eq!(rsv.call_count(), 1);

        let second = query(rsv.clone(), "example.com", RecordType::A, "")
            .await
            .unwrap();
        // a second may tick between set and read
        assert!(second.answer[0].ttl() >= 299);
        assert_eq!(rsv.call_count(), 1, "second query must come from cache");
    }

    #[tokio::test]
    async fn fan_out_selects_first_country_match() {
        let geoip = geo_table();
        // 1.1.1.1 (US) answers with a JP address, 114.114.114.114 (CN) with a
        // CN address; 8.8.8.8 is deduplicated away as a second US candidate.
        let rsv = Arc::new(
            FixtureResolver::new(geoip)
                .respond(
                    Some("1.1.1.1"),
                    answer_response(vec![a_record(
                        "cdn.example.com.",
                        60,
                        "1.2.3.4".parse().unwrap(),
                    )]),
                )
                .respond(
                    Some("114.114.114.114"),
                    answer_response(vec![a_record(
                        "cdn.example.com.",
                        60,
                        "9.10.11.12".parse().unwrap(),
                    )]),
                ),
        );

        let rsp = query(
            rsv.clone(),
            "cdn.example.com",
            RecordType::A,
            "1.1.1.1,8.8.8.8,114.114.114.114",
        )
        .await
        .unwrap();

        let got = match rsp.answer[0].data() {
            RData::A(a) => IpAddr::V4(**a),
            other => panic!("unexpected rdata {:?}", other),
        };
        assert_eq!(got, "9.10.11.12".parse::<IpAddr>().unwrap());
        // two candidates after dedup, both resolved
        assert_eq!(rsv.call_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn selection_ignores_completion_order() {
        let geoip = geo_table();
        // The first candidate matches its country but finishes last.
        let rsv = Arc::new(
            FixtureResolver::new(geoip)
                .respond(
                    Some("1.1.1.1"),
                    answer_response(vec![a_record(
                        "slow.example.com.",
                        60,
                        "5.6.7.8".parse().unwrap(),
                    )]),
                )
                .delay(Some("1.1.1.1"), Duration::from_millis(80))
                .respond(
                    Some("114.114.114.114"),
                    answer_response(vec![a_record(
                        "slow.example.com.",
                        60,
                        "9.10.11.12".parse().unwrap(),
                    )]),
                ),
        );

        let rsp = query(
            rsv,
            "slow.example.com",
            RecordType::A,
            "1.1.1.1,114.114.114.114",
        )
        .await
        .unwrap();

        let got = match rsp.answer[0].data() {
            RData::A(a) => IpAddr::V4(**a),
            other => panic!("unexpected rdata {:?}", other),
        };
        // 5.6.7.8 geolocates to US, the first candidate's expected country,
        // so it wins despite arriving after the CN answer.
        assert_eq!(got, "5.6.7.8".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn no_match_returns_last_successful_response() {
        let geoip = geo_table();
        // Both candidates answer with a JP address: nothing matches, the
        // last candidate's response is the best effort.
        let rsv = Arc::new(
            FixtureResolver::new(geoip)
                .respond(
                    Some("1.1.1.1"),
                    answer_response(vec![a_record(
                        "x.example.com.",
                        60,
                        "1.2.3.4".parse().unwrap(),
                    )]),
                )
                .respond(
                    Some("114.114.114.114"),
                    answer_response(vec![a_record(
                        "y.example.com.",
                        60,
                        "1.2.3.4".parse().unwrap(),
                    )]),
                ),
        );

        let rsp = query(
            rsv,
            "x.example.com",
            RecordType::A,
            "1.1.1.1,114.114.114.114",
        )
        .await
        .unwrap();
        assert_eq!(rsp.answer[0].name().to_string(), "y.example.com.");
    }

    #[tokio::test]
    async fn all_failures_surface_an_error() {
        let geoip = geo_table();
        let mut fixture = FixtureResolver::new(geoip);
        fixture.fail_all = true;
        let rsv = Arc::new(fixture);
        let err = query(rsv, "down.example.com", RecordType::A, "1.1.1.1")
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::UpstreamHttp(_)));
    }

    #[tokio::test]
    async fn aaaa_fan_out_matches_on_aaaa_records() {
        let geoip = geo_table();
        let rsv = Arc::new(FixtureResolver::new(geoip).respond(
            Some("114.114.114.114"),
            answer_response(vec![aaaa_record(
                "v6.example.com.",
                60,
                "2400:3200::1".parse().unwrap(),
            )]),
        ));
        let rsp = query(rsv, "v6.example.com", RecordType::AAAA, "114.114.114.114")
            .await
            .unwrap();
        assert_eq!(rsp.answer[0].record_type(), RecordType::AAAA);
    }

    #[tokio::test]
    async fn non_address_queries_skip_fan_out() {
        let geoip = geo_table();
        let rsv = Arc::new(FixtureResolver::new(geoip).respond(
            None,
            answer_response(vec![a_record(
                "example.com.",
                60,
                "93.184.216.34".parse().unwrap(),
            )]),
        ));
        query(
            rsv.clone(),
            "example.com",
            RecordType::TXT,
            "1.1.1.1,114.114.114.114",
        )
        .await
        .unwrap();
        assert_eq!(rsv.call_count(), 1, "MX/TXT must resolve once, no ECS");
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let geoip = geo_table();
        let mut fixture = FixtureResolver::new(geoip).with_cache();
        fixture.fail_all = true;
        let rsv = Arc::new(fixture);
        let _ = query(rsv.clone(), "err.example.com", RecordType::A, "").await;
        let _ = query(rsv.clone(), "err.example.com", RecordType::A, "").await;
        assert_eq!(rsv.call_count(), 2, "failed resolves must not be cached");
    }

    #[tokio::test]
    async fn short_ttl_responses_are_not_cached() {
        let geoip = geo_table();
        let rsv = Arc::new(
            FixtureResolver::new(geoip)
                .with_cache()
                .respond(None, answer_response(vec![a_record(
                    "short.example.com.",
                    1,
                    "93.184.216.34".parse().unwrap(),
                )])),
        );
        let _ = query(rsv.clone(), "short.example.com", RecordType::A, "").await;
        let _ = query(rsv.clone(), "short.example.com", RecordType::A, "").await;
        assert_eq!(rsv.call_count(), 2);
    }
}
