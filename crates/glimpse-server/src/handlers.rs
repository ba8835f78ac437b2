use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{
    engine::{Admission, CheckContext, DenyReason},
    ratelimit::{OpClass, RateDecision},
    store::{
        audit::{
            ACTION_ADMISSION_ALLOW, ACTION_ADMISSION_DENY, ACTION_IDENTITY_RESET,
            ACTION_PREVIEW_END,
        },
        AuditEvent, AuditQuery,
    },
    AppState,
};

const MAX_FINGERPRINT_LEN: usize = 128;
/// Sanity ceiling for progress reports; anything above is a malformed or
/// hostile payload, not a preview that ran for a day.
const MAX_PROGRESS_SECONDS: u64 = 86_400;

// ── IP extraction ────────────────────────────────────────────────────────────

fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    addr.ip().to_string()
}

// ── Rate limit middleware ────────────────────────────────────────────────────

async fn limit(
    state: AppState,
    class: OpClass,
    addr: SocketAddr,
    request: Request,
    next: Next,
) -> Response {
    let ip = extract_ip(request.headers(), &addr);
    match state.limiter.check(class, &ip) {
        RateDecision::Allowed => next.run(request).await,
        RateDecision::Exceeded { retry_after_secs } => {
            info!(ip = %ip, class = class.as_str(), retry_after_secs, "rate limited");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_secs.to_string())],
                Json(json!({
                    "error": "rate limit exceeded",
                    "retry_after_secs": retry_after_secs,
                })),
            )
                .into_response()
        }
    }
}

pub async fn limit_public(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    limit(state, OpClass::Public, addr, request, next).await
}

pub async fn limit_admin(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    limit(state, OpClass::Admin, addr, request, next).await
}

// ── Health ───────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Admission check (start-session) ──────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CheckRequest {
    pub fingerprint: Option<String>,
    /// Echo of the durable "preview ended" marker held by the browser.
    pub ended: Option<bool>,
}

pub async fn check_preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<CheckRequest>,
) -> Response {
    let ip = extract_ip(&headers, &addr);

    if let Some(ref fp) = body.fingerprint {
        if fp.is_empty() || fp.len() > MAX_FINGERPRINT_LEN {
            return bad_request("fingerprint must be 1–128 characters");
        }
    }

    let ctx = CheckContext {
        identity: ip.clone(),
        fingerprint: body.fingerprint,
        ended_marker: body.ended.unwrap_or(false),
    };

    match state.engine.check(&ctx).await {
        Admission::Granted { remaining_seconds } => {
            info!(ip = %ip, remaining_seconds, "audit: admission.allow");
            let _ = state.store.record_audit(AuditEvent::new(
                ACTION_ADMISSION_ALLOW,
                Some(ip),
                true,
                Some(format!("remaining={remaining_seconds}")),
            ));
            Json(json!({
                "status": "ok",
                "remaining_seconds": remaining_seconds,
            }))
            .into_response()
        }
        Admission::Blocked { reason } => {
            info!(ip = %ip, reason = reason.as_str(), "audit: admission.deny");
            let _ = state.store.record_audit(AuditEvent::new(
                ACTION_ADMISSION_DENY,
                Some(ip),
                false,
                Some(reason.as_str().to_owned()),
            ));
            let status = match reason {
                DenyReason::TransientError => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::FORBIDDEN,
            };
            (
                status,
                Json(json!({
                    "status": "blocked",
                    "reason": reason.as_str(),
                    "message": reason.message(),
                })),
            )
                .into_response()
        }
    }
}

// ── Progress ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub seconds_elapsed: u64,
    pub trigger: String,
}

/// Record preview progress. Returns 204 with no body so the browser can
/// deliver it fire-and-forget on unload without observing a response.
pub async fn report_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ProgressRequest>,
) -> Response {
    if !matches!(body.trigger.as_str(), "threshold" | "periodic" | "unload") {
        return bad_request("trigger must be one of threshold, periodic, unload");
    }
    if body.seconds_elapsed > MAX_PROGRESS_SECONDS {
        return bad_request("seconds_elapsed out of range");
    }

    let ip = extract_ip(&headers, &addr);
    let cap = state.engine.config().preview_duration;

    match state.store.update_time_consumed(&ip, body.seconds_elapsed, cap) {
        Ok(rec) => {
            info!(
                ip = %ip,
                seconds_elapsed = body.seconds_elapsed,
                trigger = %body.trigger,
                time_consumed = rec.time_consumed,
                "progress recorded"
            );
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ── Termination ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct EndRequest {
    pub fingerprint: Option<String>,
}

/// End the preview for good. Idempotent: repeated calls leave the record in
/// the same terminal state and return the same durable marker, which the
/// browser persists so a later store outage cannot re-admit it.
pub async fn end_preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<EndRequest>,
) -> Response {
    let ip = extract_ip(&headers, &addr);

    if let Some(ref fp) = body.fingerprint {
        if fp.is_empty() || fp.len() > MAX_FINGERPRINT_LEN {
            return bad_request("fingerprint must be 1–128 characters");
        }
    }

    if let Err(e) = state.store.mark_preview_used(&ip) {
        return internal_error(e);
    }
    if let Some(ref fp) = body.fingerprint {
        if let Err(e) = state.store.mark_preview_used(fp) {
            return internal_error(e);
        }
    }

    info!(ip = %ip, "audit: preview.end");
    let _ = state.store.record_audit(AuditEvent::new(
        ACTION_PREVIEW_END,
        Some(ip.clone()),
        true,
        body.fingerprint.as_deref().map(|fp| format!("fingerprint={fp}")),
    ));

    Json(json!({
        "status": "ended",
        "marker": end_marker(&ip),
    }))
    .into_response()
}

/// Deterministic per-identity marker, so retried terminations agree.
pub fn end_marker(identity: &str) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(identity.as_bytes());
    format!("glm_{}", hex::encode(&hash[..8]))
}

// ── Admin: reset ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub identity: String,
    pub fingerprint: Option<String>,
}

pub async fn reset_identity(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ResetRequest>,
) -> Response {
    if body.identity.is_empty() {
        return bad_request("identity is required");
    }
    let caller = extract_ip(&headers, &addr);

    let mut removed = match state.store.reset(&body.identity) {
        Ok(r) => r,
        Err(e) => return internal_error(e),
    };
    if let Some(ref fp) = body.fingerprint {
        match state.store.reset(fp) {
            Ok(r) => removed = removed || r,
            Err(e) => return internal_error(e),
        }
    }

    info!(identity = %body.identity, caller = %caller, removed, "audit: identity.reset");
    let _ = state.store.record_audit(AuditEvent::new(
        ACTION_IDENTITY_RESET,
        Some(body.identity.clone()),
        removed,
        Some(format!("caller={caller}")),
    ));

    Json(json!({"reset": removed})).into_response()
}

// ── Admin: stats ─────────────────────────────────────────────────────────────

pub async fn stats(State(state): State<AppState>) -> Response {
    match state.store.stats() {
        Ok(stats) => Json(json!({
            "identities": stats,
            "rate_limit_entries": state.limiter.entry_count(),
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

// ── Admin: audit query ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuditQueryParams {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub action: Option<String>,
    pub limit: Option<usize>,
}

pub async fn audit_events(
    State(state): State<AppState>,
    Query(params): Query<AuditQueryParams>,
) -> Response {
    let limit = params.limit.unwrap_or(100).min(1000);
    let query = AuditQuery {
        since: params.since,
        until: params.until,
        action: params.action,
        limit,
    };
    match state.store.list_audit(&query) {
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(e) => internal_error(e),
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_marker_is_deterministic_and_distinct() {
        let a1 = end_marker("1.2.3.4");
        let a2 = end_marker("1.2.3.4");
        let b = end_marker("5.6.7.8");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert!(a1.starts_with("glm_"));
        assert_eq!(a1.len(), 4 + 16);
    }

    #[test]
    fn extract_ip_prefers_forwarded_header() {
        let addr: SocketAddr = "9.9.9.9:1234".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 10.0.0.1".parse().unwrap());
        assert_eq!(extract_ip(&headers, &addr), "1.2.3.4");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "5.6.7.8".parse().unwrap());
        assert_eq!(extract_ip(&headers, &addr), "5.6.7.8");

        assert_eq!(extract_ip(&HeaderMap::new(), &addr), "9.9.9.9");
    }
}
