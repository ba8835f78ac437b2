use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::audit::{AuditEvent, AuditQuery};
use super::model::{IdentityRecord, StoreStats};

const IDENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("identities");
const AUDIT_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("audit_log");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const AUDIT_SEQ_KEY: &str = "audit_seq";

/// Thread-safe handle to the identity store.
///
/// Backed by redb when a durable path is available, or by a process-local
/// map otherwise. The fallback is a degraded mode: records vanish on
/// restart, so callers decide at startup whether that is acceptable.
#[derive(Clone)]
pub struct Store {
    backend: Backend,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.backend {
            Backend::Durable(_) => "durable",
            Backend::Memory(_) => "memory",
        };
        f.debug_struct("Store").field("backend", &kind).finish()
    }
}

#[derive(Clone)]
enum Backend {
    Durable(Arc<Database>),
    Memory(Arc<Mutex<MemState>>),
}

#[derive(Default)]
struct MemState {
    identities: HashMap<String, IdentityRecord>,
    audit: Vec<AuditEvent>,
    audit_seq: u64,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(IDENTITIES)?;
        write_txn.open_table(AUDIT_LOG)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self {
            backend: Backend::Durable(Arc::new(db)),
        })
    }

    /// Process-local fallback store. Same atomicity contract as the durable
    /// backend, emulated with a lock around each read-modify-write.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(MemState::default()))),
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.backend, Backend::Durable(_))
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    // ── Identity records ──────────────────────────────────────────────────

    /// Look up a record. `None` is a valid state, not an error.
    pub fn get(&self, identity: &str) -> Result<Option<IdentityRecord>> {
        match &self.backend {
            Backend::Durable(db) => {
                let read_txn = db.begin_read()?;
                let table = read_txn.open_table(IDENTITIES)?;
                let raw: Option<Vec<u8>> =
                    table.get(identity)?.map(|guard| guard.value().to_vec());
                raw.map(|bytes| decode(&bytes)).transpose()
            }
            Backend::Memory(mem) => {
                let state = mem.lock().expect("identity store lock poisoned");
                Ok(state.identities.get(identity).cloned())
            }
        }
    }

    /// The single atomic update-or-insert primitive every mutation goes
    /// through. `apply` receives the current record (if any) and the current
    /// unix time, and returns the record to persist.
    fn upsert<F>(&self, identity: &str, apply: F) -> Result<IdentityRecord>
    where
        F: FnOnce(Option<IdentityRecord>, i64) -> IdentityRecord,
    {
        let now = Self::now();
        match &self.backend {
            Backend::Durable(db) => {
                let write_txn = db.begin_write()?;
                let updated = {
                    let mut table = write_txn.open_table(IDENTITIES)?;

                    // Clone the raw bytes so the AccessGuard (which borrows
                    // `table`) is dropped before the insert.
                    let raw: Option<Vec<u8>> =
                        table.get(identity)?.map(|guard| guard.value().to_vec());
                    let current = raw.map(|bytes| decode(&bytes)).transpose()?;

                    let updated = apply(current, now);
                    let bytes = encode(&updated)?;
                    table.insert(identity, bytes.as_slice())?;
                    updated
                };
                write_txn.commit()?;
                Ok(updated)
            }
            Backend::Memory(mem) => {
                let mut state = mem.lock().expect("identity store lock poisoned");
                let current = state.identities.get(identity).cloned();
                let updated = apply(current, now);
                state.identities.insert(identity.to_owned(), updated.clone());
                Ok(updated)
            }
        }
    }

    /// Create a record if none exists. The country code is captured on
    /// first sight only; an existing record keeps the code from its first
    /// successful lookup.
    pub fn create_if_absent(
        &self,
        identity: &str,
        country_code: Option<&str>,
    ) -> Result<IdentityRecord> {
        self.upsert(identity, |current, now| match current {
            Some(mut rec) => {
                if rec.country_code.is_none() {
                    rec.country_code = country_code.map(str::to_owned);
                }
                rec.last_seen = now;
                rec
            }
            None => {
                debug!(identity, "created identity record");
                IdentityRecord::new(now, country_code.map(str::to_owned))
            }
        })
    }

    /// Mark the preview consumed. Idempotent; the record is created first if
    /// the identity was never seen (a termination can race record creation).
    pub fn mark_preview_used(&self, identity: &str) -> Result<IdentityRecord> {
        self.upsert(identity, |current, now| {
            let mut rec = current.unwrap_or_else(|| IdentityRecord::new(now, None));
            rec.preview_used = true;
            rec.last_seen = now;
            rec
        })
    }

    /// Count a VPN detection against the current penalty window, opening a
    /// fresh window at 1 if the previous one has expired. Returns the
    /// post-increment attempt count and the window end.
    pub fn increment_vpn_attempts(
        &self,
        identity: &str,
        window: Duration,
    ) -> Result<(u32, i64)> {
        let rec = self.upsert(identity, |current, now| {
            let mut rec = current.unwrap_or_else(|| IdentityRecord::new(now, None));
            if rec.vpn_window_active(now) {
                rec.vpn_attempts += 1;
            } else {
                rec.vpn_attempts = 1;
                rec.vpn_window_end = now + window.as_secs() as i64;
            }
            rec.last_seen = now;
            rec
        })?;
        Ok((rec.vpn_attempts, rec.vpn_window_end))
    }

    /// Record preview progress as a monotonic maximum, capped at `cap`
    /// seconds. Progress reports race (periodic vs. unload-triggered), so a
    /// stale report with a smaller elapsed value never rewinds the counter.
    pub fn update_time_consumed(
        &self,
        identity: &str,
        seconds_elapsed: u64,
        cap: u64,
    ) -> Result<IdentityRecord> {
        self.upsert(identity, |current, now| {
            let mut rec = current.unwrap_or_else(|| IdentityRecord::new(now, None));
            rec.time_consumed = rec.time_consumed.max(seconds_elapsed.min(cap));
            rec.last_seen = now;
            rec
        })
    }

    /// Touch the record at session start (creating it if needed) and return
    /// the current state.
    pub fn start_session(&self, identity: &str) -> Result<IdentityRecord> {
        self.upsert(identity, |current, now| {
            let mut rec = current.unwrap_or_else(|| IdentityRecord::new(now, None));
            rec.last_seen = now;
            rec
        })
    }

    /// Administrative reset: remove the record so the identity can be
    /// re-tested. Returns true if a record existed.
    pub fn reset(&self, identity: &str) -> Result<bool> {
        match &self.backend {
            Backend::Durable(db) => {
                let write_txn = db.begin_write()?;
                let existed = {
                    let mut table = write_txn.open_table(IDENTITIES)?;
                    let existed = table.remove(identity)?.is_some();
                    existed
                };
                write_txn.commit()?;
                Ok(existed)
            }
            Backend::Memory(mem) => {
                let mut state = mem.lock().expect("identity store lock poisoned");
                Ok(state.identities.remove(identity).is_some())
            }
        }
    }

    /// Aggregate counters for the stats endpoint.
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats {
            total_identities: 0,
            previews_used: 0,
            vpn_flagged: 0,
            memory_fallback: !self.is_durable(),
        };

        let mut tally = |rec: &IdentityRecord| {
            stats.total_identities += 1;
            if rec.preview_used {
                stats.previews_used += 1;
            }
            if rec.vpn_attempts > 0 {
                stats.vpn_flagged += 1;
            }
        };

        match &self.backend {
            Backend::Durable(db) => {
                let read_txn = db.begin_read()?;
                let table = read_txn.open_table(IDENTITIES)?;
                for item in table.iter()? {
                    let (_k, v) = item?;
                    let rec = decode(v.value())?;
                    tally(&rec);
                }
            }
            Backend::Memory(mem) => {
                let state = mem.lock().expect("identity store lock poisoned");
                for rec in state.identities.values() {
                    tally(rec);
                }
            }
        }
        Ok(stats)
    }

    /// Remove records that never completed a preview and have not been seen
    /// for `retention`. Records with `preview_used=true` are the permanent
    /// enforcement record and are never swept. Returns the count removed.
    pub fn prune_unused(&self, retention: Duration) -> Result<usize> {
        let cutoff = Self::now() - retention.as_secs() as i64;

        match &self.backend {
            Backend::Durable(db) => {
                // Read pass first: collect stale keys.
                let stale: Vec<String> = {
                    let read_txn = db.begin_read()?;
                    let table = read_txn.open_table(IDENTITIES)?;
                    let mut keys = Vec::new();
                    for item in table.iter()? {
                        let (k, v) = item?;
                        let rec = decode(v.value())?;
                        if !rec.preview_used && rec.last_seen < cutoff {
                            keys.push(k.value().to_owned());
                        }
                    }
                    keys
                };

                if stale.is_empty() {
                    return Ok(0);
                }

                let write_txn = db.begin_write()?;
                {
                    let mut table = write_txn.open_table(IDENTITIES)?;
                    for key in &stale {
                        table.remove(key.as_str())?;
                    }
                }
                write_txn.commit()?;

                info!(removed = stale.len(), "pruned stale identity records");
                Ok(stale.len())
            }
            Backend::Memory(mem) => {
                let mut state = mem.lock().expect("identity store lock poisoned");
                let before = state.identities.len();
                state
                    .identities
                    .retain(|_, rec| rec.preview_used || rec.last_seen >= cutoff);
                Ok(before - state.identities.len())
            }
        }
    }

    /// Spawn a background task that prunes stale unused records every
    /// `interval`. The handle can be aborted at shutdown.
    pub fn spawn_retention_sweep(self, interval: Duration, retention: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.prune_unused(retention) {
                    warn!(error = %e, "retention sweep error");
                }
            }
        })
    }

    // ── Audit log ─────────────────────────────────────────────────────────

    /// Record an audit event. Allocates a monotonic ID via the counters table.
    pub fn record_audit(&self, mut event: AuditEvent) -> Result<()> {
        match &self.backend {
            Backend::Durable(db) => {
                let write_txn = db.begin_write()?;
                {
                    let mut counters = write_txn.open_table(COUNTERS)?;
                    let seq = counters.get(AUDIT_SEQ_KEY)?.map(|g| g.value()).unwrap_or(0) + 1;
                    counters.insert(AUDIT_SEQ_KEY, seq)?;
                    event.id = seq;

                    let bytes = bincode::serde::encode_to_vec(&event, bincode::config::standard())
                        .context("bincode encode audit event")?;
                    let mut audit = write_txn.open_table(AUDIT_LOG)?;
                    audit.insert(event.id, bytes.as_slice())?;
                }
                write_txn.commit()?;
                Ok(())
            }
            Backend::Memory(mem) => {
                let mut state = mem.lock().expect("identity store lock poisoned");
                state.audit_seq += 1;
                event.id = state.audit_seq;
                state.audit.push(event);
                Ok(())
            }
        }
    }

    /// List audit events matching the query, most recent first.
    pub fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let matches = |event: &AuditEvent| {
            if let Some(until) = query.until {
                if event.timestamp > until {
                    return false;
                }
            }
            if let Some(ref action) = query.action {
                if event.action != *action {
                    return false;
                }
            }
            true
        };

        let mut events = Vec::new();
        match &self.backend {
            Backend::Durable(db) => {
                let read_txn = db.begin_read()?;
                let table = read_txn.open_table(AUDIT_LOG)?;
                for item in table.iter()?.rev() {
                    let (_k, v) = item?;
                    let (event, _): (AuditEvent, _) =
                        bincode::serde::decode_from_slice(v.value(), bincode::config::standard())
                            .context("bincode decode audit event")?;

                    if let Some(since) = query.since {
                        if event.timestamp < since {
                            break; // IDs are monotonic, older events follow — stop early.
                        }
                    }
                    if matches(&event) {
                        events.push(event);
                    }
                    if events.len() >= query.limit {
                        break;
                    }
                }
            }
            Backend::Memory(mem) => {
                let state = mem.lock().expect("identity store lock poisoned");
                for event in state.audit.iter().rev() {
                    if let Some(since) = query.since {
                        if event.timestamp < since {
                            break;
                        }
                    }
                    if matches(event) {
                        events.push(event.clone());
                    }
                    if events.len() >= query.limit {
                        break;
                    }
                }
            }
        }
        Ok(events)
    }

    /// Remove audit events older than `retention_seconds`. Returns count removed.
    pub fn prune_audit(&self, retention_seconds: i64) -> Result<usize> {
        let cutoff = Self::now() - retention_seconds;

        match &self.backend {
            Backend::Durable(db) => {
                // Read pass: collect IDs to remove.
                let ids_to_remove: Vec<u64> = {
                    let read_txn = db.begin_read()?;
                    let table = read_txn.open_table(AUDIT_LOG)?;
                    let mut ids = Vec::new();
                    for item in table.iter()? {
                        let (k, v) = item?;
                        let (event, _): (AuditEvent, _) = bincode::serde::decode_from_slice(
                            v.value(),
                            bincode::config::standard(),
                        )
                        .context("bincode decode audit for prune")?;
                        if event.timestamp < cutoff {
                            ids.push(k.value());
                        } else {
                            break; // IDs are monotonic — remaining are newer.
                        }
                    }
                    ids
                };

                if ids_to_remove.is_empty() {
                    return Ok(0);
                }

                let write_txn = db.begin_write()?;
                {
                    let mut table = write_txn.open_table(AUDIT_LOG)?;
                    for id in &ids_to_remove {
                        table.remove(*id)?;
                    }
                }
                write_txn.commit()?;

                info!(removed = ids_to_remove.len(), "pruned old audit events");
                Ok(ids_to_remove.len())
            }
            Backend::Memory(mem) => {
                let mut state = mem.lock().expect("identity store lock poisoned");
                let before = state.audit.len();
                state.audit.retain(|e| e.timestamp >= cutoff);
                Ok(before - state.audit.len())
            }
        }
    }

    /// Spawn a background task that prunes old audit events periodically.
    pub fn spawn_audit_sweep(self, interval: Duration, retention_seconds: i64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.prune_audit(retention_seconds) {
                    warn!(error = %e, "audit sweep error");
                }
            }
        })
    }
}

fn encode(record: &IdentityRecord) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(record, bincode::config::standard()).context("bincode encode")
}

fn decode(bytes: &[u8]) -> Result<IdentityRecord> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode")?;
    Ok(record)
}
