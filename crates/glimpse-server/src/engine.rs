//! Admission decision engine.
//!
//! Turns a visitor's network identity into an allow/deny verdict, ordered
//! so the cheapest checks run first and a repeat offender never earns a
//! fresh external lookup.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::{debug, warn};

use crate::geoip::LookupClient;
use crate::store::Store;

/// Tunables for the admission algorithm.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Full preview length in seconds.
    pub preview_duration: u64,
    /// Consumed seconds at which the preview counts as used even though the
    /// full duration was never reached. Protects against a visitor who
    /// watched most of the window, dropped, and retries for a fresh one.
    pub used_threshold: u64,
    /// VPN detections tolerated per penalty window.
    pub vpn_max_retries: u32,
    /// Length of the VPN penalty window.
    pub vpn_window: Duration,
    /// ISO country codes denied outright.
    pub restricted_countries: HashSet<String>,
    /// When true, internal failures admit instead of denying. Defaults to
    /// fail-closed.
    pub fail_open: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preview_duration: 180,
            used_threshold: 150,
            vpn_max_retries: 5,
            vpn_window: Duration::from_secs(3600),
            restricted_countries: HashSet::new(),
            fail_open: false,
        }
    }
}

/// Why an admission check was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    PreviewUsed,
    VpnDetected,
    VpnMaxRetries,
    RestrictedCountry,
    TransientError,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreviewUsed => "preview_used",
            Self::VpnDetected => "vpn_detected",
            Self::VpnMaxRetries => "vpn_max_retries",
            Self::RestrictedCountry => "restricted_country",
            Self::TransientError => "transient_error",
        }
    }

    /// Human-readable explanation with a recommended next step.
    pub fn message(&self) -> &'static str {
        match self {
            Self::PreviewUsed => {
                "your one-time preview has already been used — create an account to continue"
            }
            Self::VpnDetected => "a VPN connection was detected — disconnect it and try again",
            Self::VpnMaxRetries => {
                "too many VPN attempts — wait for the cooldown to pass before retrying"
            }
            Self::RestrictedCountry => "the preview is not available in your region",
            Self::TransientError => "a temporary problem prevented the check — try again shortly",
        }
    }
}

/// Verdict of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Granted { remaining_seconds: u64 },
    Blocked { reason: DenyReason },
}

/// Request context for one admission check.
pub struct CheckContext {
    /// Network address of the visitor.
    pub identity: String,
    /// Device fingerprint, when the browser supplied one.
    pub fingerprint: Option<String>,
    /// True when the browser carries the durable "preview ended" marker.
    pub ended_marker: bool,
}

#[derive(Clone)]
pub struct Engine {
    store: Store,
    lookup: LookupClient,
    cfg: EngineConfig,
}

impl Engine {
    pub fn new(store: Store, lookup: LookupClient, cfg: EngineConfig) -> Self {
        Self { store, lookup, cfg }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Run the admission check. Never returns an unstructured failure: an
    /// internal error resolves to `transient_error` (or a full-duration
    /// grant when `fail_open` is set).
    pub async fn check(&self, ctx: &CheckContext) -> Admission {
        match self.check_inner(ctx).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(identity = %ctx.identity, error = %e, "admission check failed internally");
                if self.cfg.fail_open {
                    Admission::Granted {
                        remaining_seconds: self.cfg.preview_duration,
                    }
                } else {
                    Admission::Blocked {
                        reason: DenyReason::TransientError,
                    }
                }
            }
        }
    }

    async fn check_inner(&self, ctx: &CheckContext) -> Result<Admission> {
        // Durable browser marker: cheapest check, no store or network.
        if ctx.ended_marker {
            return Ok(blocked(DenyReason::PreviewUsed));
        }

        let record = self.store.get(&ctx.identity)?;
        if record.as_ref().is_some_and(|r| r.preview_used) {
            return Ok(blocked(DenyReason::PreviewUsed));
        }

        // Cross-IP correlation: a fingerprint that already burned its
        // preview blocks the visitor on any address.
        if let Some(fp) = &ctx.fingerprint {
            if self.store.get(fp)?.is_some_and(|r| r.preview_used) {
                return Ok(blocked(DenyReason::PreviewUsed));
            }
        }

        let consumed = record.as_ref().map(|r| r.time_consumed).unwrap_or(0);
        if consumed >= self.cfg.used_threshold {
            return Ok(blocked(DenyReason::PreviewUsed));
        }

        // Exhausted VPN window blocks before any new lookup, so repeated
        // probing is not rewarded with fresh external calls.
        let now = unix_now();
        if let Some(rec) = &record {
            if rec.vpn_window_active(now) && rec.vpn_attempts >= self.cfg.vpn_max_retries {
                return Ok(blocked(DenyReason::VpnMaxRetries));
            }
        }

        // The single external lookup of this check. Exhausted credentials
        // come back as a degraded default rather than an error.
        let geo = self.lookup.lookup(&ctx.identity).await;
        if geo.degraded {
            debug!(identity = %ctx.identity, "lookup degraded — proceeding with defaults");
        }

        if geo.is_vpn {
            self.store
                .create_if_absent(&ctx.identity, geo.country_code.as_deref())?;
            let (attempts, _window_end) = self
                .store
                .increment_vpn_attempts(&ctx.identity, self.cfg.vpn_window)?;
            let reason = if attempts >= self.cfg.vpn_max_retries {
                DenyReason::VpnMaxRetries
            } else {
                DenyReason::VpnDetected
            };
            return Ok(blocked(reason));
        }

        if let Some(cc) = &geo.country_code {
            if self.cfg.restricted_countries.contains(cc) {
                return Ok(blocked(DenyReason::RestrictedCountry));
            }
        }

        self.store
            .create_if_absent(&ctx.identity, geo.country_code.as_deref())?;
        let rec = self.store.start_session(&ctx.identity)?;

        Ok(Admission::Granted {
            remaining_seconds: self.cfg.preview_duration.saturating_sub(rec.time_consumed),
        })
    }
}

fn blocked(reason: DenyReason) -> Admission {
    Admission::Blocked { reason }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // A lookup client pointed at nothing: every lookup degrades to the
    // non-VPN/unknown-country default, which is exactly the no-signal path.
    fn offline_engine(cfg: EngineConfig) -> Engine {
        let lookup = LookupClient::new(
            "http://127.0.0.1:1/".into(),
            vec![],
            Duration::from_millis(100),
            "US".into(),
        );
        Engine::new(Store::in_memory(), lookup, cfg)
    }

    fn mocked_engine(mock_uri: &str, cfg: EngineConfig) -> Engine {
        let lookup = LookupClient::new(
            mock_uri.to_owned(),
            vec!["k1".into()],
            Duration::from_secs(2),
            "US".into(),
        );
        Engine::new(Store::in_memory(), lookup, cfg)
    }

    fn ctx(identity: &str) -> CheckContext {
        CheckContext {
            identity: identity.into(),
            fingerprint: None,
            ended_marker: false,
        }
    }

    #[tokio::test]
    async fn fresh_identity_gets_full_preview() {
        let engine = offline_engine(EngineConfig::default());
        assert_eq!(
            engine.check(&ctx("1.2.3.4")).await,
            Admission::Granted {
                remaining_seconds: 180
            }
        );
    }

    #[tokio::test]
    async fn ended_marker_denies_without_any_state() {
        let engine = offline_engine(EngineConfig::default());
        let verdict = engine
            .check(&CheckContext {
                identity: "1.2.3.4".into(),
                fingerprint: None,
                ended_marker: true,
            })
            .await;
        assert_eq!(
            verdict,
            Admission::Blocked {
                reason: DenyReason::PreviewUsed
            }
        );
    }

    #[tokio::test]
    async fn used_preview_never_admits_again() {
        let engine = offline_engine(EngineConfig::default());
        let store = engine.store.clone();

        assert!(matches!(
            engine.check(&ctx("1.2.3.4")).await,
            Admission::Granted { .. }
        ));
        store.mark_preview_used("1.2.3.4").unwrap();

        for _ in 0..3 {
            assert_eq!(
                engine.check(&ctx("1.2.3.4")).await,
                Admission::Blocked {
                    reason: DenyReason::PreviewUsed
                }
            );
        }
    }

    #[tokio::test]
    async fn end_to_end_preview_lifecycle() {
        let engine = offline_engine(EngineConfig::default());
        let store = engine.store.clone();

        assert_eq!(
            engine.check(&ctx("1.2.3.4")).await,
            Admission::Granted {
                remaining_seconds: 180
            }
        );
        store.update_time_consumed("1.2.3.4", 30, 180).unwrap();
        store.mark_preview_used("1.2.3.4").unwrap();
        assert_eq!(
            engine.check(&ctx("1.2.3.4")).await,
            Admission::Blocked {
                reason: DenyReason::PreviewUsed
            }
        );
    }

    #[tokio::test]
    async fn partial_consumption_resumes_with_remainder() {
        let engine = offline_engine(EngineConfig::default());
        engine.store.update_time_consumed("1.2.3.4", 30, 180).unwrap();

        assert_eq!(
            engine.check(&ctx("1.2.3.4")).await,
            Admission::Granted {
                remaining_seconds: 150
            }
        );
    }

    #[tokio::test]
    async fn consumption_past_threshold_counts_as_used() {
        let engine = offline_engine(EngineConfig::default());
        engine.store.update_time_consumed("1.2.3.4", 150, 180).unwrap();

        assert_eq!(
            engine.check(&ctx("1.2.3.4")).await,
            Admission::Blocked {
                reason: DenyReason::PreviewUsed
            }
        );
    }

    #[tokio::test]
    async fn fingerprint_correlates_across_addresses() {
        let engine = offline_engine(EngineConfig::default());
        engine.store.mark_preview_used("device-abc").unwrap();

        let verdict = engine
            .check(&CheckContext {
                identity: "8.8.4.4".into(),
                fingerprint: Some("device-abc".into()),
                ended_marker: false,
            })
            .await;
        assert_eq!(
            verdict,
            Admission::Blocked {
                reason: DenyReason::PreviewUsed
            }
        );
    }

    #[tokio::test]
    async fn vpn_detections_escalate_to_max_retries() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("ip", "5.6.7.8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "country_code": "NL",
                "proxy": { "is_vpn": true }
            })))
            .expect(5) // the sixth check must not reach the upstream
            .mount(&mock)
            .await;

        let engine = mocked_engine(&mock.uri(), EngineConfig::default());

        for _ in 0..4 {
            assert_eq!(
                engine.check(&ctx("5.6.7.8")).await,
                Admission::Blocked {
                    reason: DenyReason::VpnDetected
                }
            );
        }
        assert_eq!(
            engine.check(&ctx("5.6.7.8")).await,
            Admission::Blocked {
                reason: DenyReason::VpnMaxRetries
            }
        );
        // Still inside the window: denied again, without a new lookup.
        assert_eq!(
            engine.check(&ctx("5.6.7.8")).await,
            Admission::Blocked {
                reason: DenyReason::VpnMaxRetries
            }
        );

        let rec = engine.store.get("5.6.7.8").unwrap().unwrap();
        assert_eq!(rec.vpn_attempts, 5);
        assert_eq!(rec.country_code.as_deref(), Some("NL"));
    }

    #[tokio::test]
    async fn restricted_country_is_blocked_without_a_record() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "country_code": "KP",
                "proxy": { "is_vpn": false }
            })))
            .mount(&mock)
            .await;

        let mut cfg = EngineConfig::default();
        cfg.restricted_countries.insert("KP".into());
        let engine = mocked_engine(&mock.uri(), cfg);

        assert_eq!(
            engine.check(&ctx("5.6.7.8")).await,
            Admission::Blocked {
                reason: DenyReason::RestrictedCountry
            }
        );
        assert_eq!(engine.store.get("5.6.7.8").unwrap(), None);
    }

    #[tokio::test]
    async fn admitted_visitor_gets_country_recorded() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "country_code": "GB",
                "proxy": { "is_vpn": false }
            })))
            .mount(&mock)
            .await;

        let engine = mocked_engine(&mock.uri(), EngineConfig::default());
        assert!(matches!(
            engine.check(&ctx("5.6.7.8")).await,
            Admission::Granted { .. }
        ));
        let rec = engine.store.get("5.6.7.8").unwrap().unwrap();
        assert_eq!(rec.country_code.as_deref(), Some("GB"));
    }

    #[test]
    fn deny_reasons_serialize_to_wire_strings() {
        assert_eq!(DenyReason::PreviewUsed.as_str(), "preview_used");
        assert_eq!(DenyReason::VpnDetected.as_str(), "vpn_detected");
        assert_eq!(DenyReason::VpnMaxRetries.as_str(), "vpn_max_retries");
        assert_eq!(DenyReason::RestrictedCountry.as_str(), "restricted_country");
        assert_eq!(DenyReason::TransientError.as_str(), "transient_error");
    }
}
