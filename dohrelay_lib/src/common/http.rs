use std::time::Duration;

/// Ceiling for a single upstream HTTP exchange.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared HTTP client for DoH upstreams: rustls, HTTP/2 where offered, no
/// proxy, 15 s total deadline per request.
pub fn new_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .use_rustls_tls()
        .no_proxy()
        .timeout(HTTP_TIMEOUT)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
}

/// One-shot GET returning the body as text, for small helper endpoints like
/// `/checkip`.
pub async fn http_get_string(url: &str) -> Result<String, reqwest::Error> {
    new_http_client()?.get(url).send().await?.text().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds() {
        assert!(new_http_client().is_ok());
    }
}
