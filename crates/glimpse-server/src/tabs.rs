//! Multi-tab leader election and timer synchronization.
//!
//! A visitor with the preview open in several tabs must see one consistent
//! countdown, and exactly one tab should report progress to the server.
//! Tabs coordinate over a shared broadcast channel: the leader heartbeats
//! on a fixed interval, followers claim leadership after heartbeat silence,
//! and ties resolve toward the earliest claim. A brief double-leadership
//! window costs at most one duplicate progress save, never a wrong verdict.
//!
//! `TabTimer` is a deterministic state machine driven by `on_message` and
//! `tick` with explicit timestamps; `spawn_tab` wires it to a
//! `tokio::sync::broadcast` channel and a tick interval.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

pub type TabId = u64;

/// Generate a session-local tab identifier.
pub fn random_tab_id() -> TabId {
    rand::thread_rng().gen()
}

/// Messages exchanged between tabs of one visitor. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum TabMessage {
    /// Relative seconds remaining, from the leader.
    TimerUpdate { from: TabId, remaining: u64 },
    /// Absolute expiry instant (unix millis). The more robust signal:
    /// immune to clock drift from missed intervals.
    ExpirySync { from: TabId, expires_at: i64 },
    /// Heartbeat from the current leader.
    LeaderPing { from: TabId },
    /// A tab asserting leadership, stamped with its claim instant.
    LeaderClaim { from: TabId, claimed_at: i64 },
    /// A newly joined tab asking for current state.
    RequestTime { from: TabId },
    PreviewEnded { from: TabId },
    ProgressSaved { from: TabId, seconds: u64 },
}

impl TabMessage {
    fn from_tab(&self) -> TabId {
        match *self {
            Self::TimerUpdate { from, .. }
            | Self::ExpirySync { from, .. }
            | Self::LeaderPing { from }
            | Self::LeaderClaim { from, .. }
            | Self::RequestTime { from }
            | Self::PreviewEnded { from }
            | Self::ProgressSaved { from, .. } => from,
        }
    }
}

/// What caused a progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressTrigger {
    Threshold,
    Periodic,
    Unload,
}

impl ProgressTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Periodic => "periodic",
            Self::Unload => "unload",
        }
    }
}

/// Server-bound side effects. Only the leader produces these; the embedder
/// delivers them to the progress/termination endpoints.
#[derive(Debug, Clone, PartialEq)]
pub enum TabEffect {
    ReportProgress { seconds: u64, trigger: ProgressTrigger },
    EndSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabRole {
    Leader,
    Follower,
}

#[derive(Debug, Clone)]
pub struct TabConfig {
    /// Leader heartbeat cadence.
    pub ping_interval: Duration,
    /// Heartbeat silence after which a follower claims leadership.
    pub leader_timeout: Duration,
    /// Upper bound of the randomized delay before a newly joined tab claims
    /// leadership, so simultaneously opened tabs do not all claim at once.
    pub claim_jitter_max: Duration,
    /// Seconds of consumption between periodic progress reports.
    pub progress_interval: u64,
    /// Consumed seconds at which the one-shot threshold report fires.
    pub report_threshold: u64,
}

impl Default for TabConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(2),
            leader_timeout: Duration::from_secs(3),
            claim_jitter_max: Duration::from_millis(400),
            progress_interval: 15,
            report_threshold: 30,
        }
    }
}

/// Per-browser persistence of the absolute expiry instant, shared by all
/// tabs of one visitor. Lets a newly elected leader resume the correct
/// countdown when no other tab is alive to ask.
#[derive(Clone, Default)]
pub struct ExpiryCache(Arc<Mutex<Option<i64>>>);

impl ExpiryCache {
    pub fn save(&self, expires_at: i64) {
        *self.0.lock().expect("expiry cache lock poisoned") = Some(expires_at);
    }

    pub fn load(&self) -> Option<i64> {
        *self.0.lock().expect("expiry cache lock poisoned")
    }
}

/// Everything a state transition wants the embedder to do.
#[derive(Debug, Default, PartialEq)]
pub struct TabOutput {
    pub broadcasts: Vec<TabMessage>,
    pub effects: Vec<TabEffect>,
}

impl TabOutput {
    fn merge(&mut self, other: TabOutput) {
        self.broadcasts.extend(other.broadcasts);
        self.effects.extend(other.effects);
    }
}

/// Deterministic countdown/election state machine for one tab.
pub struct TabTimer {
    id: TabId,
    cfg: TabConfig,
    role: TabRole,
    cache: ExpiryCache,
    preview_duration_ms: i64,
    /// Absolute expiry instant (unix millis), once known.
    expires_at: Option<i64>,
    /// Most recent sign of leader liveness.
    last_ping: i64,
    /// Instant after which this tab may claim leadership.
    claim_deadline: i64,
    /// Our own claim stamp while (tentatively) leader.
    claim_time: Option<i64>,
    last_ping_sent: i64,
    /// Consumed seconds covered by the last progress report.
    last_progress_sent: u64,
    threshold_reported: bool,
    /// Fallback display state: (received_at, remaining) from a TimerUpdate.
    last_update: Option<(i64, u64)>,
    ended: bool,
}

impl TabTimer {
    /// Create the timer for a tab. `has_channel=false` means the
    /// environment offers no cross-tab channel at all, in which case the
    /// single tab is unconditionally leader — there is no coordination
    /// problem to solve.
    pub fn new(
        id: TabId,
        cfg: TabConfig,
        cache: ExpiryCache,
        preview_duration_secs: u64,
        has_channel: bool,
        now: i64,
    ) -> (Self, TabOutput) {
        let mut timer = Self {
            id,
            preview_duration_ms: preview_duration_secs as i64 * 1000,
            role: TabRole::Follower,
            expires_at: cache.load(),
            cache,
            last_ping: now,
            claim_deadline: 0,
            claim_time: None,
            last_ping_sent: 0,
            last_progress_sent: 0,
            threshold_reported: false,
            last_update: None,
            ended: false,
            cfg,
        };

        let mut out = TabOutput::default();
        if has_channel {
            out.broadcasts.push(TabMessage::RequestTime { from: id });
            timer.claim_deadline =
                now + timer.cfg.leader_timeout.as_millis() as i64 + timer.jitter_ms();
        } else {
            out.merge(timer.become_leader(now, false));
        }
        (timer, out)
    }

    pub fn id(&self) -> TabId {
        self.id
    }

    pub fn role(&self) -> TabRole {
        self.role
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Time remaining as this tab would display it: derived from the
    /// absolute expiry when known, else recomputed locally from the last
    /// relative update so the display stays smooth between broadcasts.
    pub fn remaining_seconds(&self, now: i64) -> Option<u64> {
        if let Some(expires_at) = self.expires_at {
            return Some(((expires_at - now).max(0) / 1000) as u64);
        }
        self.last_update.map(|(at, remaining)| {
            remaining.saturating_sub(((now - at).max(0) / 1000) as u64)
        })
    }

    fn jitter_ms(&self) -> i64 {
        let max = self.cfg.claim_jitter_max.as_millis() as i64;
        if max == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max)
        }
    }

    fn consumed_seconds(&self, now: i64) -> u64 {
        match self.expires_at {
            Some(expires_at) => {
                let remaining = (expires_at - now).max(0);
                ((self.preview_duration_ms - remaining).max(0) / 1000) as u64
            }
            None => 0,
        }
    }

    fn become_leader(&mut self, now: i64, announce: bool) -> TabOutput {
        self.role = TabRole::Leader;
        self.claim_time = Some(now);
        self.last_ping_sent = now;

        // Resume from the persisted expiry if the previous leader saved
        // one; otherwise this is a fresh countdown.
        if self.expires_at.is_none() {
            self.expires_at = self.cache.load();
        }
        let expires_at = *self.expires_at.get_or_insert(now + self.preview_duration_ms);
        self.cache.save(expires_at);

        debug!(tab = self.id, expires_at, "tab assumed leadership");

        let mut out = TabOutput::default();
        if announce {
            out.broadcasts.push(TabMessage::LeaderClaim {
                from: self.id,
                claimed_at: now,
            });
            out.broadcasts.push(TabMessage::LeaderPing { from: self.id });
            out.broadcasts.push(TabMessage::ExpirySync {
                from: self.id,
                expires_at,
            });
        }
        out
    }

    fn yield_leadership(&mut self, now: i64) {
        debug!(tab = self.id, "tab yielded leadership");
        self.role = TabRole::Follower;
        self.claim_time = None;
        self.last_ping = now;
        self.claim_deadline =
            now + self.cfg.leader_timeout.as_millis() as i64 + self.jitter_ms();
    }

    /// Feed one message received from the broadcast channel.
    pub fn on_message(&mut self, msg: &TabMessage, now: i64) -> TabOutput {
        let mut out = TabOutput::default();
        if msg.from_tab() == self.id {
            return out;
        }

        match *msg {
            TabMessage::LeaderPing { .. } => {
                if self.role == TabRole::Follower {
                    self.last_ping = now;
                }
            }
            TabMessage::LeaderClaim { from, claimed_at } => match self.role {
                TabRole::Leader => {
                    // Earlier claim wins; equal stamps break toward the
                    // smaller id. Best-effort: each receiver resolves from
                    // what it observed.
                    let ours = self.claim_time.unwrap_or(i64::MAX);
                    if claimed_at < ours || (claimed_at == ours && from < self.id) {
                        self.yield_leadership(now);
                    }
                }
                TabRole::Follower => {
                    self.last_ping = now;
                    self.claim_deadline =
                        now + self.cfg.leader_timeout.as_millis() as i64 + self.jitter_ms();
                }
            },
            TabMessage::RequestTime { .. } => {
                if self.role == TabRole::Leader && !self.ended {
                    if let Some(expires_at) = self.expires_at {
                        out.broadcasts.push(TabMessage::ExpirySync {
                            from: self.id,
                            expires_at,
                        });
                    }
                    if let Some(remaining) = self.remaining_seconds(now) {
                        out.broadcasts.push(TabMessage::TimerUpdate {
                            from: self.id,
                            remaining,
                        });
                    }
                }
            }
            TabMessage::ExpirySync { expires_at, .. } => {
                self.expires_at = Some(expires_at);
                self.cache.save(expires_at);
                if self.role == TabRole::Follower {
                    self.last_ping = now;
                }
            }
            TabMessage::TimerUpdate { remaining, .. } => {
                self.last_update = Some((now, remaining));
                if self.role == TabRole::Follower {
                    self.last_ping = now;
                }
            }
            TabMessage::PreviewEnded { .. } => {
                self.ended = true;
            }
            TabMessage::ProgressSaved { seconds, .. } => {
                // Another tab saved progress; remember the high-water mark
                // so a later election does not re-report stale values.
                self.last_progress_sent = self.last_progress_sent.max(seconds);
            }
        }
        out
    }

    /// Advance time. Call on a short cadence (a few times per second is
    /// plenty); all scheduling derives from `now`, not from call frequency.
    pub fn tick(&mut self, now: i64) -> TabOutput {
        let mut out = TabOutput::default();
        if self.ended {
            return out;
        }

        match self.role {
            TabRole::Follower => {
                let silence = now - self.last_ping;
                if silence >= self.cfg.leader_timeout.as_millis() as i64
                    && now >= self.claim_deadline
                {
                    out.merge(self.become_leader(now, true));
                }
            }
            TabRole::Leader => {
                if now - self.last_ping_sent >= self.cfg.ping_interval.as_millis() as i64 {
                    self.last_ping_sent = now;
                    out.broadcasts.push(TabMessage::LeaderPing { from: self.id });
                    if let Some(expires_at) = self.expires_at {
                        out.broadcasts.push(TabMessage::ExpirySync {
                            from: self.id,
                            expires_at,
                        });
                    }
                    if let Some(remaining) = self.remaining_seconds(now) {
                        out.broadcasts.push(TabMessage::TimerUpdate {
                            from: self.id,
                            remaining,
                        });
                    }
                }

                if self.remaining_seconds(now) == Some(0) {
                    self.ended = true;
                    out.broadcasts.push(TabMessage::PreviewEnded { from: self.id });
                    out.effects.push(TabEffect::EndSession);
                    return out;
                }

                let consumed = self.consumed_seconds(now);
                if !self.threshold_reported && consumed >= self.cfg.report_threshold {
                    self.threshold_reported = true;
                    self.last_progress_sent = consumed;
                    out.effects.push(TabEffect::ReportProgress {
                        seconds: consumed,
                        trigger: ProgressTrigger::Threshold,
                    });
                    out.broadcasts.push(TabMessage::ProgressSaved {
                        from: self.id,
                        seconds: consumed,
                    });
                } else if consumed >= self.last_progress_sent + self.cfg.progress_interval {
                    self.last_progress_sent = consumed;
                    out.effects.push(TabEffect::ReportProgress {
                        seconds: consumed,
                        trigger: ProgressTrigger::Periodic,
                    });
                    out.broadcasts.push(TabMessage::ProgressSaved {
                        from: self.id,
                        seconds: consumed,
                    });
                }
            }
        }
        out
    }

    /// The tab is closing. A leader flushes one last progress report for
    /// fire-and-forget delivery; peers notice the disappearance through
    /// heartbeat silence, so no departure message is sent.
    pub fn on_unload(&mut self, now: i64) -> TabOutput {
        let mut out = TabOutput::default();
        if self.role == TabRole::Leader && !self.ended {
            let consumed = self.consumed_seconds(now);
            if consumed > 0 {
                out.effects.push(TabEffect::ReportProgress {
                    seconds: consumed,
                    trigger: ProgressTrigger::Unload,
                });
            }
        }
        self.ended = true;
        out
    }
}

/// Drive a `TabTimer` over a broadcast channel. Effects are forwarded to
/// `effects` for the embedder to deliver to the server. The task finishes
/// when the preview ends.
pub fn spawn_tab(
    mut timer: TabTimer,
    bus: broadcast::Sender<TabMessage>,
    effects: mpsc::UnboundedSender<TabEffect>,
    tick_every: Duration,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_every);
        loop {
            let out = tokio::select! {
                _ = ticker.tick() => timer.tick(unix_now_ms()),
                msg = rx.recv() => match msg {
                    Ok(msg) => timer.on_message(&msg, unix_now_ms()),
                    // Lagged receivers just miss stale messages; the next
                    // ExpirySync resynchronizes the display.
                    Err(broadcast::error::RecvError::Lagged(_)) => TabOutput::default(),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            for msg in out.broadcasts {
                // Send fails only with no receivers, which is fine solo.
                let _ = bus.send(msg);
            }
            for effect in out.effects {
                let _ = effects.send(effect);
            }
            if timer.is_ended() {
                break;
            }
        }
    })
}

fn unix_now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
