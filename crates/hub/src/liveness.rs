//! Device reachability: a two-state machine fed by `lastSeen` markers whose
//! format varies by device firmware, plus a periodic watchdog so a silent
//! device still times out.
//!
//! ## Timestamp ambiguity
//!
//! Devices report `lastSeen` as one of three shapes, distinguishable only by
//! magnitude:
//!
//! - a device-relative monotonic counter (time since boot) — not comparable
//!   to wall-clock time, so the detector anchors the first local observation
//!   of each marker *value* and measures elapsed local time from there
//! - epoch seconds — normalized to milliseconds
//! - epoch milliseconds — compared to local wall-clock directly
//!
//! The heuristic lives entirely in [`classify_last_seen`].

use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::state::SharedState;

/// Silence longer than this marks the device offline. Shared by both
/// timestamp branches; adjust here if devices legitimately report slower.
pub const OFFLINE_TIMEOUT: Duration = Duration::from_secs(30);
pub const OFFLINE_TIMEOUT_MS: i64 = OFFLINE_TIMEOUT.as_millis() as i64;

/// Watchdog re-evaluation period. Short enough that an offline transition
/// is never delayed by more than one tick past the timeout.
pub const WATCHDOG_TICK: Duration = Duration::from_secs(5);

/// Below this, `lastSeen` is a device-relative counter; epoch seconds for
/// any date after 2001 are larger.
const RELATIVE_CUTOFF: i64 = 1_000_000_000;

/// Below this (and above the relative cutoff), `lastSeen` is epoch seconds;
/// epoch milliseconds for any modern date are larger.
const EPOCH_MILLIS_CUTOFF: i64 = 1_000_000_000_000;

// ---------------------------------------------------------------------------
// Marker classification
// ---------------------------------------------------------------------------

/// Tagged representation of a raw `lastSeen` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastSeen {
    /// Device-relative counter (e.g. time since boot).
    Relative(i64),
    /// Wall-clock timestamp, normalized to epoch milliseconds.
    WallClockMs(i64),
}

/// Classify a raw marker value by magnitude. Seconds are normalized to
/// milliseconds so both wall-clock shapes share one comparison path.
pub fn classify_last_seen(raw: i64) -> LastSeen {
    if raw < RELATIVE_CUTOFF {
        LastSeen::Relative(raw)
    } else if raw < EPOCH_MILLIS_CUTOFF {
        LastSeen::WallClockMs(raw * 1000)
    } else {
        LastSeen::WallClockMs(raw)
    }
}

/// Current epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Online,
    Offline,
}

/// What an observation or tick did to the state. `WentOffline` obliges the
/// caller to zero the associated reading in the same critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Transition {
    None,
    WentOnline,
    WentOffline,
}

#[derive(Debug)]
pub struct LivenessDetector {
    state: Liveness,
    /// Last classified marker plus the local instant its value was first
    /// observed. The anchor only matters for the relative branch and is kept
    /// as long as the marker value does not change.
    marker: Option<(LastSeen, Instant)>,
}

impl LivenessDetector {
    /// Offline until the first meta observation.
    pub fn new() -> Self {
        Self {
            state: Liveness::Offline,
            marker: None,
        }
    }

    pub fn state(&self) -> Liveness {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == Liveness::Online
    }

    /// Feed a fresh `lastSeen` marker.
    pub fn observe(&mut self, raw: i64, now_ms: i64, local_now: Instant) -> Transition {
        let seen = classify_last_seen(raw);
        let anchor = match (self.marker, seen) {
            // Unchanged relative marker: the device is replaying the same
            // counter value, so the original observation instant stands.
            (Some((LastSeen::Relative(prev), prev_anchor)), LastSeen::Relative(v))
                if prev == v =>
            {
                prev_anchor
            }
            _ => local_now,
        };
        self.marker = Some((seen, anchor));
        self.evaluate(now_ms, local_now)
    }

    /// Periodic re-evaluation; fires offline transitions for silent devices.
    pub fn tick(&mut self, now_ms: i64, local_now: Instant) -> Transition {
        self.evaluate(now_ms, local_now)
    }

    /// Transport failure on the meta channel: fail closed.
    pub fn force_offline(&mut self) -> Transition {
        self.marker = None;
        self.set_state(Liveness::Offline)
    }

    fn evaluate(&mut self, now_ms: i64, local_now: Instant) -> Transition {
        let fresh = match self.marker {
            None => false,
            Some((LastSeen::Relative(_), anchor)) => {
                local_now.duration_since(anchor) <= OFFLINE_TIMEOUT
            }
            Some((LastSeen::WallClockMs(ms), _)) => now_ms - ms <= OFFLINE_TIMEOUT_MS,
        };
        self.set_state(if fresh {
            Liveness::Online
        } else {
            Liveness::Offline
        })
    }

    fn set_state(&mut self, next: Liveness) -> Transition {
        let prev = std::mem::replace(&mut self.state, next);
        match (prev, next) {
            (Liveness::Offline, Liveness::Online) => Transition::WentOnline,
            (Liveness::Online, Liveness::Offline) => Transition::WentOffline,
            _ => Transition::None,
        }
    }
}

impl Default for LivenessDetector {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Watchdog loop
// ---------------------------------------------------------------------------

/// Re-evaluate the active session's liveness every [`WATCHDOG_TICK`].
/// Intended to be `tokio::spawn`-ed from main. Without this, a device that
/// stops publishing would never produce the event that flips it offline.
pub async fn watchdog(shared: SharedState) {
    let mut ticker = tokio::time::interval(WATCHDOG_TICK);
    loop {
        ticker.tick().await;

        let mut st = shared.write().await;
        let went_offline = match st.session.as_mut() {
            Some(session) => match session.watchdog_tick(now_epoch_ms(), Instant::now()) {
                Transition::WentOffline => Some(session.device_id.clone()),
                _ => None,
            },
            None => None,
        };

        if let Some(device_id) = went_offline {
            info!(device = %device_id, "watchdog: device went offline");
            st.record_liveness(format!(
                "{device_id}: offline (silent for {}s)",
                OFFLINE_TIMEOUT.as_secs()
            ));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
