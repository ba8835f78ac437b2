//! Geo/proxy resolution with ordered multi-credential failover.
//!
//! A single lookup walks the configured credential list until one yields a
//! usable response. Quota, auth, and malformed-body failures each skip to
//! the next credential; when every credential is exhausted the caller gets a
//! best-effort default marked `degraded` so admission can still resolve.

use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

/// Result of a geo/proxy lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoInfo {
    /// The single authoritative VPN signal from the upstream payload. Other
    /// proxy classifications (data-center, public proxy, Tor, web proxy) do
    /// not gate access.
    pub is_vpn: bool,
    pub country_code: Option<String>,
    /// True when no credential produced a usable response and the fields
    /// above are defaults rather than observations.
    pub degraded: bool,
}

/// Why a credential was skipped in favor of the next one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    /// Rate-limit or quota exhaustion on this credential.
    Quota,
    /// The upstream rejected the credential itself.
    Auth,
    /// The response body could not be used.
    Malformed,
    /// The request never completed (timeout, connection failure).
    Transport,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quota => "quota",
            Self::Auth => "auth",
            Self::Malformed => "malformed",
            Self::Transport => "transport",
        }
    }
}

struct AttemptError {
    reason: SkipReason,
    detail: String,
}

/// Client for an ip2location.io-style geolocation/proxy-detection service.
#[derive(Clone)]
pub struct LookupClient {
    client: reqwest::Client,
    base_url: String,
    api_keys: Vec<String>,
    default_country: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    country_code: Option<String>,
    is_vpn: Option<bool>,
    proxy: Option<UpstreamProxy>,
    error: Option<UpstreamError>,
}

#[derive(Debug, Deserialize)]
struct UpstreamProxy {
    is_vpn: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct UpstreamError {
    error_message: Option<String>,
}

impl LookupClient {
    /// `api_keys` is an ordered credential list, tried first to last.
    /// Each attempt is bounded by `attempt_timeout` so one unresponsive
    /// credential cannot stall the whole chain.
    pub fn new(
        base_url: String,
        api_keys: Vec<String>,
        attempt_timeout: Duration,
        default_country: String,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()
            .expect("build lookup reqwest client");

        Self {
            client,
            base_url,
            api_keys,
            default_country,
        }
    }

    /// Resolve `ip`. Local and private addresses short-circuit to a fixed
    /// non-VPN, default-country result without any network call.
    pub async fn lookup(&self, ip: &str) -> GeoInfo {
        if is_local_address(ip) {
            return GeoInfo {
                is_vpn: false,
                country_code: Some(self.default_country.clone()),
                degraded: false,
            };
        }

        let mut last_error: Option<AttemptError> = None;
        for (index, key) in self.api_keys.iter().enumerate() {
            match self.attempt(ip, key).await {
                Ok(info) => {
                    debug!(ip, credential = index, "lookup resolved");
                    return info;
                }
                Err(e) => {
                    warn!(
                        ip,
                        credential = index,
                        reason = e.reason.as_str(),
                        detail = %e.detail,
                        "lookup credential skipped"
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => warn!(
                ip,
                reason = e.reason.as_str(),
                detail = %e.detail,
                "all lookup credentials exhausted — using default result"
            ),
            None => warn!(ip, "no lookup credentials configured — using default result"),
        }
        GeoInfo {
            is_vpn: false,
            country_code: None,
            degraded: true,
        }
    }

    async fn attempt(&self, ip: &str, key: &str) -> Result<GeoInfo, AttemptError> {
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[("ip", ip), ("key", key), ("format", "json")])
            .send()
            .await
            .map_err(|e| AttemptError {
                reason: SkipReason::Transport,
                detail: e.to_string(),
            })?;

        let status = resp.status();
        match status.as_u16() {
            402 | 429 => {
                return Err(AttemptError {
                    reason: SkipReason::Quota,
                    detail: format!("status {status}"),
                })
            }
            401 | 403 => {
                return Err(AttemptError {
                    reason: SkipReason::Auth,
                    detail: format!("status {status}"),
                })
            }
            _ => {}
        }

        let body: UpstreamResponse = resp.json().await.map_err(|e| AttemptError {
            reason: SkipReason::Malformed,
            detail: e.to_string(),
        })?;

        if let Some(err) = body.error {
            let message = err.error_message.unwrap_or_default();
            let lowered = message.to_lowercase();
            let reason = if lowered.contains("quota") || lowered.contains("limit") {
                SkipReason::Quota
            } else {
                SkipReason::Auth
            };
            return Err(AttemptError {
                reason,
                detail: message,
            });
        }

        let country_code = body.country_code.filter(|c| !c.is_empty());
        if country_code.is_none() {
            return Err(AttemptError {
                reason: SkipReason::Malformed,
                detail: "response missing country_code".into(),
            });
        }

        // `proxy.is_vpn` is the authoritative field; older payloads carry it
        // at the top level.
        let is_vpn = body
            .proxy
            .and_then(|p| p.is_vpn)
            .or(body.is_vpn)
            .unwrap_or(false);

        Ok(GeoInfo {
            is_vpn,
            country_code: country_code.map(|c| c.to_uppercase()),
            degraded: false,
        })
    }
}

/// Loopback, private-range, link-local and unspecified addresses never leave
/// the building, so there is nothing for the upstream to say about them.
fn is_local_address(ip: &str) -> bool {
    if ip == "localhost" {
        return true;
    }
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        Ok(IpAddr::V6(v6)) => {
            // fc00::/7 (unique local) and fe80::/10 (link local).
            let seg = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (seg & 0xfe00) == 0xfc00
                || (seg & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base: &str, keys: &[&str]) -> LookupClient {
        LookupClient::new(
            base.to_owned(),
            keys.iter().map(|k| k.to_string()).collect(),
            Duration::from_secs(2),
            "US".into(),
        )
    }

    #[tokio::test]
    async fn local_addresses_skip_the_network() {
        // Unroutable base URL proves no request is made.
        let c = client("http://127.0.0.1:1/", &["k1"]);
        for ip in ["127.0.0.1", "10.1.2.3", "192.168.0.5", "::1", "localhost"] {
            let info = c.lookup(ip).await;
            assert_eq!(
                info,
                GeoInfo {
                    is_vpn: false,
                    country_code: Some("US".into()),
                    degraded: false,
                },
                "{ip}"
            );
        }
    }

    #[tokio::test]
    async fn first_credential_resolves() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("ip", "1.2.3.4"))
            .and(query_param("key", "k1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "country_code": "jp",
                "proxy": { "is_vpn": true }
            })))
            .expect(1)
            .mount(&mock)
            .await;

        let info = client(&mock.uri(), &["k1", "k2"]).lookup("1.2.3.4").await;
        assert!(info.is_vpn);
        assert_eq!(info.country_code.as_deref(), Some("JP"));
        assert!(!info.degraded);
    }

    #[tokio::test]
    async fn quota_failure_skips_to_next_credential() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("key", "k1"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(query_param("key", "k2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "country_code": "DE",
                "proxy": { "is_vpn": false }
            })))
            .expect(1)
            .mount(&mock)
            .await;

        let info = client(&mock.uri(), &["k1", "k2"]).lookup("1.2.3.4").await;
        assert!(!info.is_vpn);
        assert_eq!(info.country_code.as_deref(), Some("DE"));
        assert!(!info.degraded);
    }

    #[tokio::test]
    async fn auth_failure_skips_to_next_credential() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("key", "bad"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(query_param("key", "good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "country_code": "FR"
            })))
            .mount(&mock)
            .await;

        let info = client(&mock.uri(), &["bad", "good"]).lookup("1.2.3.4").await;
        assert_eq!(info.country_code.as_deref(), Some("FR"));
        assert!(!info.is_vpn, "missing proxy object means not a VPN");
    }

    #[tokio::test]
    async fn malformed_body_skips_to_next_credential() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("key", "k1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(query_param("key", "k2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "country_code": "BR",
                "is_vpn": true
            })))
            .mount(&mock)
            .await;

        let info = client(&mock.uri(), &["k1", "k2"]).lookup("1.2.3.4").await;
        assert!(info.is_vpn, "top-level is_vpn honored as fallback field");
        assert_eq!(info.country_code.as_deref(), Some("BR"));
    }

    #[tokio::test]
    async fn upstream_error_payload_is_a_skip() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("key", "k1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": { "error_message": "monthly query limit reached" }
            })))
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(query_param("key", "k2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "country_code": "CA"
            })))
            .mount(&mock)
            .await;

        let info = client(&mock.uri(), &["k1", "k2"]).lookup("1.2.3.4").await;
        assert_eq!(info.country_code.as_deref(), Some("CA"));
    }

    #[tokio::test]
    async fn exhausted_credentials_degrade_to_default() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(2)
            .mount(&mock)
            .await;

        let info = client(&mock.uri(), &["k1", "k2"]).lookup("1.2.3.4").await;
        assert_eq!(
            info,
            GeoInfo {
                is_vpn: false,
                country_code: None,
                degraded: true,
            }
        );
    }

    #[tokio::test]
    async fn no_credentials_degrade_without_network() {
        let c = client("http://127.0.0.1:1/", &[]);
        let info = c.lookup("1.2.3.4").await;
        assert!(info.degraded);
        assert!(!info.is_vpn);
    }
}
