use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_admin_key,
    engine::{Engine, EngineConfig},
    geoip::LookupClient,
    handlers::{
        audit_events, check_preview, end_preview, health, limit_admin, limit_public,
        report_progress, reset_identity, stats,
    },
    ratelimit::{RateLimiter, RateLimits},
    store::Store,
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer key for administrative routes. Unset disables them.
    pub admin_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    /// Set `GLIMPSE_ENV=production` to refuse startup without a durable
    /// store instead of silently running on the in-memory fallback.
    pub production: bool,
    /// Explicitly run on the in-memory store (development only).
    pub ephemeral: bool,
    /// Ordered upstream credentials for the geo/proxy lookup.
    pub geo_keys: Vec<String>,
    pub geo_url: String,
    pub geo_timeout: Duration,
    pub default_country: String,
    pub preview_duration: u64,
    pub used_threshold: u64,
    pub vpn_max_retries: u32,
    pub vpn_window: Duration,
    pub restricted_countries: HashSet<String>,
    pub fail_open: bool,
    pub rate_limits: RateLimits,
    pub rate_window: Duration,
    pub sweep_interval: Duration,
    pub retention_days: u64,
    pub audit_retention_days: u64,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("GLIMPSE_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("GLIMPSE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            admin_key: std::env::var("GLIMPSE_ADMIN_KEY").ok(),
            data_dir: std::env::var("GLIMPSE_DATA_DIR").ok().map(PathBuf::from),
            production: std::env::var("GLIMPSE_ENV")
                .map(|v| v == "production")
                .unwrap_or(false),
            ephemeral: std::env::var("GLIMPSE_EPHEMERAL")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            geo_keys: std::env::var("GLIMPSE_GEO_KEYS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            geo_url: std::env::var("GLIMPSE_GEO_URL")
                .unwrap_or_else(|_| "https://api.ip2location.io/".into()),
            geo_timeout: Duration::from_secs(
                std::env::var("GLIMPSE_GEO_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(4),
            ),
            default_country: std::env::var("GLIMPSE_DEFAULT_COUNTRY")
                .unwrap_or_else(|_| "US".into()),
            preview_duration: std::env::var("GLIMPSE_PREVIEW_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(180),
            used_threshold: std::env::var("GLIMPSE_USED_THRESHOLD_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(150),
            vpn_max_retries: std::env::var("GLIMPSE_VPN_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            vpn_window: Duration::from_secs(
                std::env::var("GLIMPSE_VPN_WINDOW_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3600),
            ),
            restricted_countries: std::env::var("GLIMPSE_RESTRICTED_COUNTRIES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_uppercase)
                        .collect()
                })
                .unwrap_or_default(),
            fail_open: std::env::var("GLIMPSE_FAIL_OPEN")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            rate_limits: RateLimits {
                admin: std::env::var("GLIMPSE_LIMIT_ADMIN")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
                public: std::env::var("GLIMPSE_LIMIT_PUBLIC")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
                ingest: std::env::var("GLIMPSE_LIMIT_INGEST")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(100),
                feed: std::env::var("GLIMPSE_LIMIT_FEED")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            },
            rate_window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
            retention_days: std::env::var("GLIMPSE_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            audit_retention_days: std::env::var("GLIMPSE_AUDIT_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            cors_origins: std::env::var("GLIMPSE_CORS_ORIGINS").ok(),
        }
    }
}

/// Resolve the data directory, creating it if needed.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

/// Open the identity store per the configured policy. Absence of durable
/// configuration (`ephemeral`) and a configured-but-unreachable backend are
/// distinct cases; production refuses to start on either.
fn open_store(cfg: &ServerConfig) -> Result<Store> {
    if cfg.ephemeral {
        if cfg.production {
            anyhow::bail!(
                "GLIMPSE_EPHEMERAL is not allowed in production — configure a durable data dir"
            );
        }
        warn!("running on the in-memory store — records are lost on restart");
        return Ok(Store::in_memory());
    }

    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    let db_path = data_dir.join("glimpse.db");
    match Store::open(&db_path) {
        Ok(store) => {
            info!(db = %db_path.display(), "using durable identity store");
            Ok(store)
        }
        Err(e) if cfg.production => {
            Err(e.context("durable store is required in production but could not be opened"))
        }
        Err(e) => {
            warn!(error = %e, "durable store unreachable — falling back to in-memory records");
            Ok(Store::in_memory())
        }
    }
}

/// Assemble the full router. Split from `run` so tests can serve it on an
/// ephemeral port.
pub fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    // Public visitor routes, rate limited as one class.
    let public = Router::new()
        .route("/preview/check", post(check_preview))
        .route("/preview/progress", post(report_progress))
        .route("/preview/end", post(end_preview))
        .layer(middleware::from_fn_with_state(state.clone(), limit_public));

    // Administrative routes: rate limited, then bearer-key gated.
    let admin = Router::new()
        .route("/admin/reset", post(reset_identity))
        .route("/admin/stats", get(stats))
        .route("/admin/audit", get(audit_events))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin_key))
        .layer(middleware::from_fn_with_state(state.clone(), limit_admin));

    Router::new()
        .route("/health", get(health))
        .merge(public)
        .merge(admin)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let store = open_store(&cfg)?;

    if cfg.geo_keys.is_empty() {
        warn!("no GLIMPSE_GEO_KEYS configured — geo/VPN lookups will degrade to defaults");
    }
    if cfg.admin_key.is_none() {
        warn!("no GLIMPSE_ADMIN_KEY configured — administrative routes are disabled");
    }

    let lookup = LookupClient::new(
        cfg.geo_url.clone(),
        cfg.geo_keys.clone(),
        cfg.geo_timeout,
        cfg.default_country.clone(),
    );

    let engine = Engine::new(
        store.clone(),
        lookup,
        EngineConfig {
            preview_duration: cfg.preview_duration,
            used_threshold: cfg.used_threshold,
            vpn_max_retries: cfg.vpn_max_retries,
            vpn_window: cfg.vpn_window,
            restricted_countries: cfg.restricted_countries.clone(),
            fail_open: cfg.fail_open,
        },
    );

    let limiter = RateLimiter::new(cfg.rate_limits, cfg.rate_window);

    // Background sweeps. The handles die with the runtime; nothing here
    // prevents process shutdown.
    store.clone().spawn_retention_sweep(
        cfg.sweep_interval,
        Duration::from_secs(cfg.retention_days * 86400),
    );
    store
        .clone()
        .spawn_audit_sweep(cfg.sweep_interval, (cfg.audit_retention_days * 86400) as i64);
    limiter.clone().spawn_sweep(cfg.sweep_interval);

    let state = AppState {
        store,
        engine,
        limiter,
        admin_key: cfg.admin_key,
    };

    let app = build_router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "glimpse server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
