use serde::{Deserialize, Serialize};

/// Stored in redb as bincode-encoded bytes, one record per visitor identity.
/// The identity key is the network address, or a device fingerprint when one
/// has been associated for cross-IP correlation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityRecord {
    /// Set exactly once when the preview ends. Terminal: only an
    /// administrative reset clears it.
    pub preview_used: bool,
    /// Seconds of preview consumed. Never decreases; capped at the
    /// configured preview duration.
    pub time_consumed: u64,
    /// VPN detections accumulated in the current penalty window.
    pub vpn_attempts: u32,
    /// Unix timestamp (seconds). While `now < vpn_window_end`, detections
    /// count against the same window; afterwards the next detection opens a
    /// fresh window at 1.
    pub vpn_window_end: i64,
    /// ISO country code recorded at the first successful lookup.
    pub country_code: Option<String>,
    /// Unix timestamp (seconds) when the record was created.
    pub first_seen: i64,
    /// Unix timestamp (seconds) of the most recent touch.
    pub last_seen: i64,
}

impl IdentityRecord {
    pub fn new(now: i64, country_code: Option<String>) -> Self {
        Self {
            preview_used: false,
            time_consumed: 0,
            vpn_attempts: 0,
            vpn_window_end: 0,
            country_code,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Returns true if the VPN penalty window is still open.
    pub fn vpn_window_active(&self, now: i64) -> bool {
        now < self.vpn_window_end
    }
}

/// Aggregate counters returned by the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_identities: u64,
    pub previews_used: u64,
    pub vpn_flagged: u64,
    /// True when running on the in-memory fallback — records are lost on
    /// restart in this mode.
    pub memory_fallback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_has_no_history() {
        let rec = IdentityRecord::new(1000, Some("US".into()));
        assert!(!rec.preview_used);
        assert_eq!(rec.time_consumed, 0);
        assert_eq!(rec.vpn_attempts, 0);
        assert_eq!(rec.first_seen, rec.last_seen);
    }

    #[test]
    fn vpn_window_activity() {
        let mut rec = IdentityRecord::new(1000, None);
        assert!(!rec.vpn_window_active(1000));
        rec.vpn_window_end = 2000;
        assert!(rec.vpn_window_active(1999));
        assert!(!rec.vpn_window_active(2000));
    }
}
