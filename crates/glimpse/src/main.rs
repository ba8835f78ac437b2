use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "glimpse", about = "Glimpse — one-time preview gate", version)]
struct Cli {
    /// Glimpse server URL (default: http://localhost:8080 or $GLIMPSE_SERVER)
    #[arg(long, env = "GLIMPSE_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Bearer key for administrative commands ($GLIMPSE_ADMIN_KEY)
    #[arg(long, env = "GLIMPSE_ADMIN_KEY")]
    admin_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Glimpse HTTP server
    Serve {
        /// Port to listen on (default: $GLIMPSE_PORT or 8080)
        #[arg(long, env = "GLIMPSE_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $GLIMPSE_HOST or 0.0.0.0)
        #[arg(long, env = "GLIMPSE_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Run an admission check for an address, as if it were the visitor
    Check {
        /// Address to probe
        ip: String,
        /// Device fingerprint to include
        #[arg(long)]
        fingerprint: Option<String>,
    },
    /// Show identity-store and rate-limiter statistics
    Stats,
    /// Clear an identity's record so it can be re-tested
    Reset {
        /// Identity (network address or fingerprint) to clear
        identity: String,
        /// Associated fingerprint to clear as well
        #[arg(long)]
        fingerprint: Option<String>,
    },
    /// List recent admission/termination audit events
    Audit {
        /// Only events newer than this age, e.g. 2h, 30m, 7d
        #[arg(long)]
        since: Option<String>,
        /// Filter by action, e.g. admission.deny
        #[arg(long)]
        action: Option<String>,
        /// Maximum number of events
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("GLIMPSE_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Check { ip, fingerprint } => {
            cmd_check(&cli.server, &ip, fingerprint.as_deref()).await
        }

        Commands::Stats => {
            let key = require_admin_key(&cli.admin_key)?;
            cmd_stats(&cli.server, &key).await
        }

        Commands::Reset {
            identity,
            fingerprint,
        } => {
            let key = require_admin_key(&cli.admin_key)?;
            cmd_reset(&cli.server, &key, &identity, fingerprint.as_deref()).await
        }

        Commands::Audit {
            since,
            action,
            limit,
        } => {
            let key = require_admin_key(&cli.admin_key)?;
            cmd_audit(&cli.server, &key, since.as_deref(), action.as_deref(), limit).await
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = glimpse_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    glimpse_server::run(cfg).await
}

async fn cmd_check(server: &str, ip: &str, fingerprint: Option<&str>) -> Result<()> {
    let client = Client::new();
    let body = serde_json::json!({ "fingerprint": fingerprint });

    let resp = client
        .post(format!("{}/preview/check", server.trim_end_matches('/')))
        .header("x-forwarded-for", ip)
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;

    match json["status"].as_str() {
        Some("ok") => {
            let remaining = json["remaining_seconds"].as_u64().unwrap_or(0);
            println!("admitted — {} remaining", format_duration(remaining));
        }
        Some("blocked") => {
            let reason = json["reason"].as_str().unwrap_or("unknown");
            let message = json["message"].as_str().unwrap_or("");
            println!("blocked ({reason}): {message}");
        }
        _ => anyhow::bail!("server returned {status}: {json}"),
    }
    Ok(())
}

async fn cmd_stats(server: &str, key: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .get(format!("{}/admin/stats", server.trim_end_matches('/')))
        .bearer_auth(key)
        .send()
        .await
        .context("HTTP request failed")?;

    if !resp.status().is_success() {
        let status = resp.status();
        anyhow::bail!("server returned {status}");
    }

    let json: Value = resp.json().await?;
    let ids = &json["identities"];
    println!(
        "identities: {}  previews used: {}  vpn flagged: {}",
        ids["total_identities"], ids["previews_used"], ids["vpn_flagged"]
    );
    println!("rate-limit entries: {}", json["rate_limit_entries"]);
    if ids["memory_fallback"].as_bool() == Some(true) {
        println!("warning: server is running on the in-memory store");
    }
    Ok(())
}

async fn cmd_reset(
    server: &str,
    key: &str,
    identity: &str,
    fingerprint: Option<&str>,
) -> Result<()> {
    let client = Client::new();
    let body = serde_json::json!({
        "identity": identity,
        "fingerprint": fingerprint,
    });

    let resp = client
        .post(format!("{}/admin/reset", server.trim_end_matches('/')))
        .bearer_auth(key)
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();
    if status.is_success() {
        if json["reset"].as_bool() == Some(true) {
            println!("✓ cleared {identity}");
        } else {
            println!("no record for {identity}");
        }
        Ok(())
    } else {
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("")
        )
    }
}

async fn cmd_audit(
    server: &str,
    key: &str,
    since: Option<&str>,
    action: Option<&str>,
    limit: usize,
) -> Result<()> {
    let mut query: Vec<(String, String)> = vec![("limit".into(), limit.to_string())];
    if let Some(age) = since {
        let age = parse_duration(age)?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        query.push(("since".into(), (now - age as i64).to_string()));
    }
    if let Some(action) = action {
        query.push(("action".into(), action.to_owned()));
    }

    let client = Client::new();
    let resp = client
        .get(format!("{}/admin/audit", server.trim_end_matches('/')))
        .query(&query)
        .bearer_auth(key)
        .send()
        .await
        .context("HTTP request failed")?;

    if !resp.status().is_success() {
        let status = resp.status();
        anyhow::bail!("server returned {status}");
    }

    let json: Value = resp.json().await?;
    let events = json["events"].as_array().cloned().unwrap_or_default();
    if events.is_empty() {
        println!("(no audit events)");
        return Ok(());
    }
    for e in &events {
        println!(
            "  {} {} {} {} {}",
            e["timestamp"],
            e["action"].as_str().unwrap_or("?"),
            e["identity"].as_str().unwrap_or("-"),
            if e["success"].as_bool() == Some(true) {
                "ok"
            } else {
                "denied"
            },
            e["detail"].as_str().unwrap_or(""),
        );
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn require_admin_key(key: &Option<String>) -> Result<String> {
    key.clone()
        .context("--admin-key / GLIMPSE_ADMIN_KEY is required for this command")
}

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

fn format_duration(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_durations() {
        assert_eq!(parse_duration("30m").unwrap(), 1800);
        assert_eq!(parse_duration("2h").unwrap(), 7200);
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn formats_durations_compactly() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(150), "2m30s");
        assert_eq!(format_duration(7260), "2h1m");
    }
}
