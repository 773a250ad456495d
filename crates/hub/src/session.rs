//! Per-device session: one value owning the device's push subscriptions and
//! its read models, created when a device is selected and dropped as a unit
//! when the selection changes. Dropping the session closes every
//! subscription, so nothing can leak across a device switch.

use rumqttc::{AsyncClient, QoS};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::liveness::{LivenessDetector, Transition};
use crate::mqtt::{self, IrrigationMode, RelayState};
use crate::normalize::{normalize, CanonicalReading, RawRecord};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Subscription handle
// ---------------------------------------------------------------------------

/// A live topic subscription that unsubscribes itself on drop.
pub struct Subscription {
    topic: String,
    client: AsyncClient,
}

impl Subscription {
    pub async fn open(client: &AsyncClient, topic: String) -> Result<Self, CoreError> {
        client
            .subscribe(topic.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| CoreError::SubscriptionError(format!("subscribe {topic}: {e}")))?;
        Ok(Self {
            topic,
            client: client.clone(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Best effort: if the client is gone the broker-side subscription
        // died with the connection anyway.
        if let Err(e) = self.client.try_unsubscribe(self.topic.as_str()) {
            warn!(topic = %self.topic, "unsubscribe failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Device session
// ---------------------------------------------------------------------------

pub struct DeviceSession {
    pub device_id: String,
    /// Latest normalized sensor snapshot. Zeroed whenever the device is
    /// offline — never offline with stale non-zero values.
    pub reading: CanonicalReading,
    /// Relay read model. Optimistically set on command send; any push on the
    /// authoritative status stream overwrites it.
    pub relay: RelayState,
    pub mode: IrrigationMode,
    liveness: LivenessDetector,
    subs: Vec<Subscription>,
}

impl DeviceSession {
    /// Subscribe to the device's four inbound topics and start offline until
    /// the first meta observation.
    pub async fn open(client: &AsyncClient, device_id: &str) -> Result<Self, CoreError> {
        let mut subs = Vec::new();
        for topic in Self::topics(device_id) {
            subs.push(Subscription::open(client, topic).await?);
        }
        Ok(Self {
            device_id: device_id.to_string(),
            reading: CanonicalReading::default(),
            relay: RelayState::Off,
            mode: IrrigationMode::default(),
            liveness: LivenessDetector::new(),
            subs,
        })
    }

    /// The inbound topics a session for `device_id` listens on.
    pub fn topics(device_id: &str) -> Vec<String> {
        vec![
            mqtt::sensors_topic(device_id),
            mqtt::meta_topic(device_id),
            mqtt::relay_status_topic(device_id),
            mqtt::mode_topic(device_id),
        ]
    }

    /// Topics currently held open, for re-subscribing after a reconnect.
    pub fn subscription_topics(&self) -> Vec<String> {
        self.subs.iter().map(|s| s.topic().to_string()).collect()
    }

    pub fn is_online(&self) -> bool {
        self.liveness.is_online()
    }

    /// Apply a raw telemetry push. Returns `false` when the push was
    /// suppressed because the device is offline — a late reading must never
    /// overwrite the zeroed snapshot.
    pub fn apply_sensors(&mut self, raw: &RawRecord) -> bool {
        if !self.liveness.is_online() {
            debug!(device = %self.device_id, "sensor push suppressed while offline");
            return false;
        }
        let Some(normalized) = normalize(Some(raw)) else {
            return false;
        };
        if !normalized.missing.is_empty() {
            debug!(
                device = %self.device_id,
                missing = ?normalized.missing,
                "telemetry record lacked expected fields"
            );
        }
        self.reading = normalized.reading;
        self.reading.device_online = true;
        true
    }

    /// Apply a meta (`lastSeen`) push.
    pub fn apply_meta(&mut self, last_seen_raw: i64, now_ms: i64, local_now: Instant) -> Transition {
        let transition = self.liveness.observe(last_seen_raw, now_ms, local_now);
        self.apply_transition(transition);
        transition
    }

    /// Periodic re-evaluation from the watchdog.
    pub fn watchdog_tick(&mut self, now_ms: i64, local_now: Instant) -> Transition {
        let transition = self.liveness.tick(now_ms, local_now);
        self.apply_transition(transition);
        transition
    }

    /// A read channel failed: fail closed.
    pub fn subscription_failure(&mut self) -> Transition {
        let transition = self.liveness.force_offline();
        self.apply_transition(transition);
        transition
    }

    /// Authoritative relay truth from the device; always wins over the
    /// optimistic value.
    pub fn apply_relay_status(&mut self, status: RelayState) {
        self.relay = status;
        self.reading.relay_status = status;
    }

    /// Local optimistic update at command-send time.
    pub fn apply_optimistic_relay(&mut self, desired: RelayState) {
        self.relay = desired;
        self.reading.relay_status = desired;
    }

    pub fn apply_mode(&mut self, mode: IrrigationMode) {
        self.mode = mode;
    }

    pub fn apply_optimistic_mode(&mut self, mode: IrrigationMode) {
        self.mode = mode;
    }

    fn apply_transition(&mut self, transition: Transition) {
        match transition {
            // Offline and a zeroed reading are one atomic step.
            Transition::WentOffline => self.zero_reading(),
            Transition::WentOnline => self.reading.device_online = true,
            Transition::None => {}
        }
    }

    fn zero_reading(&mut self) {
        self.reading = CanonicalReading::default();
        self.relay = RelayState::Off;
    }
}

// ---------------------------------------------------------------------------
// Session switching
// ---------------------------------------------------------------------------

/// Tear down the current session and open one for `device_id`. The old
/// session is dropped — and its subscriptions closed — before any new
/// subscription opens, so readings from the previous device cannot bleed
/// into the new session.
pub async fn activate(
    shared: &SharedState,
    client: &AsyncClient,
    device_id: &str,
) -> Result<(), CoreError> {
    {
        let mut st = shared.write().await;
        st.session = None;
    }
    let session = DeviceSession::open(client, device_id).await?;
    shared.write().await.session = Some(session);
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
