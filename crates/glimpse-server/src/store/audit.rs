use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ── Action constants ─────────────────────────────────────────────────────────

pub const ACTION_ADMISSION_ALLOW: &str = "admission.allow";
pub const ACTION_ADMISSION_DENY: &str = "admission.deny";
pub const ACTION_PREVIEW_END: &str = "preview.end";
pub const ACTION_IDENTITY_RESET: &str = "identity.reset";

// ── AuditEvent ───────────────────────────────────────────────────────────────

/// One line of the enforcement record: who asked, what was decided, why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    pub timestamp: i64,
    pub action: String,
    pub identity: Option<String>,
    pub success: bool,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(
        action: &str,
        identity: Option<String>,
        success: bool,
        detail: Option<String>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        Self {
            id: 0, // allocated by store
            timestamp,
            action: action.to_owned(),
            identity,
            success,
            detail,
        }
    }
}

// ── AuditQuery ───────────────────────────────────────────────────────────────

pub struct AuditQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub action: Option<String>,
    pub limit: usize,
}
