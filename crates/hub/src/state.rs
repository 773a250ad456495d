use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::mqtt::{IrrigationMode, RelayState};
use crate::normalize::CanonicalReading;
use crate::registry::{ActiveSelection, DeviceSummary};
use crate::session::DeviceSession;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<CoreState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Signed-in principal the core acts for. Identity issuance happens
/// upstream; we only carry id + email for command provenance.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
}

pub struct CoreState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub principal: Option<Principal>,
    /// Devices currently assigned to the principal, newest first.
    pub devices: Vec<DeviceSummary>,
    pub active: Option<ActiveSelection>,
    pub session: Option<DeviceSession>,
    pub events: VecDeque<CoreEvent>,
}

#[derive(Clone, Serialize)]
pub struct CoreEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Serialize, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Relay,
    Liveness,
    Assignment,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub user_id: Option<String>,
    pub active_device: Option<String>,
    pub device_online: bool,
    pub reading: Option<CanonicalReading>,
    pub relay_status: Option<RelayState>,
    pub irrigation_mode: Option<IrrigationMode>,
    pub events: Vec<CoreEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl CoreState {
    pub fn new(principal: Option<Principal>) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            principal,
            devices: Vec::new(),
            active: None,
            session: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a telemetry application.
    pub fn record_telemetry(&mut self, detail: String) {
        self.push_event(EventKind::Telemetry, detail);
    }

    /// Record a relay command or status change.
    pub fn record_relay(&mut self, detail: String) {
        self.push_event(EventKind::Relay, detail);
    }

    /// Record an online/offline transition.
    pub fn record_liveness(&mut self, detail: String) {
        self.push_event(EventKind::Liveness, detail);
    }

    /// Record an assignment or active-device change.
    pub fn record_assignment(&mut self, detail: String) {
        self.push_event(EventKind::Assignment, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            user_id: self.principal.as_ref().map(|p| p.user_id.clone()),
            active_device: self.active.as_ref().map(|a| a.device_id.clone()),
            device_online: self.session.as_ref().is_some_and(|s| s.is_online()),
            reading: self.session.as_ref().map(|s| s.reading.clone()),
            relay_status: self.session.as_ref().map(|s| s.relay),
            irrigation_mode: self.session.as_ref().map(|s| s.mode),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(CoreEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> CoreState {
        CoreState::new(Some(Principal {
            user_id: "user-1".into(),
            email: "grower@example.com".into(),
        }))
    }

    #[test]
    fn new_state_is_disconnected_and_empty() {
        let st = test_state();
        assert!(!st.mqtt_connected);
        assert!(st.devices.is_empty());
        assert!(st.active.is_none());
        assert!(st.session.is_none());
        assert!(st.events.is_empty());
    }

    #[test]
    fn events_capped_at_ring_size() {
        let mut st = test_state();
        for i in 0..250 {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), 200);
        // Oldest entries were dropped.
        assert_eq!(st.events.front().unwrap().detail, "event 50");
    }

    #[test]
    fn status_reports_newest_events_first() {
        let mut st = test_state();
        st.record_system("first".into());
        st.record_relay("second".into());

        let status = st.to_status();
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.events[1].detail, "first");
    }

    #[test]
    fn status_without_session_has_no_reading() {
        let st = test_state();
        let status = st.to_status();
        assert!(!status.device_online);
        assert!(status.reading.is_none());
        assert!(status.relay_status.is_none());
        assert_eq!(status.user_id.as_deref(), Some("user-1"));
    }
}
