//! Actuator control channel: relay (pump) and irrigation-mode commands with
//! request provenance, an optimistic local update for immediate dashboard
//! feedback, and reconciliation against the device's authoritative status
//! stream (handled in `session`).
//!
//! A failed send does not roll the optimistic value back: the retained
//! status topic corrects any divergence on the next push, and the caller
//! gets a classified error to show.

use rumqttc::{AsyncClient, QoS};
use tracing::{error, info};

use crate::error::{CoreError, CoreResult};
use crate::liveness::now_epoch_ms;
use crate::mqtt::{self, IrrigationMode, RelayCommand, RelayState};
use crate::state::SharedState;

/// Send one relay command for the active device. Exactly one publish per
/// call — commands are never retried automatically.
pub async fn send_relay_command(
    shared: &SharedState,
    mqtt: &AsyncClient,
    desired: RelayState,
) -> CoreResult<RelayCommand> {
    let (command, device_id, connected) = {
        let mut st = shared.write().await;

        let principal = st.principal.clone().ok_or(CoreError::NotReady)?;
        let device_id = match &st.session {
            Some(s) => s.device_id.clone(),
            None => return Err(CoreError::NotReady),
        };
        if !st.devices.iter().any(|d| d.device_id == device_id) {
            return Err(CoreError::PermissionDenied);
        }

        let command = RelayCommand {
            value: desired,
            requested_by: principal.user_id,
            requested_by_email: principal.email,
            timestamp: now_epoch_ms(),
        };

        // Optimistic: the dashboard reflects intent before any device
        // acknowledgment; the status stream remains the source of truth.
        if let Some(session) = st.session.as_mut() {
            session.apply_optimistic_relay(desired);
        }
        st.record_relay(format!(
            "{device_id}: pump {desired} requested by {}",
            command.requested_by
        ));

        (command, device_id, st.mqtt_connected)
    };

    let payload =
        serde_json::to_vec(&command).map_err(|e| CoreError::InvalidPayload(e.to_string()))?;

    deliver(
        shared,
        mqtt,
        &device_id,
        mqtt::relay_set_topic(&device_id),
        payload,
        connected,
    )
    .await?;

    info!(device = %device_id, state = %desired, "relay command sent");
    Ok(command)
}

/// Switch the device between automatic and manual irrigation. Same
/// precondition / optimistic / reconcile path as the relay command.
pub async fn set_irrigation_mode(
    shared: &SharedState,
    mqtt: &AsyncClient,
    mode: IrrigationMode,
) -> CoreResult<()> {
    let (device_id, connected) = {
        let mut st = shared.write().await;

        if st.principal.is_none() {
            return Err(CoreError::NotReady);
        }
        let device_id = match &st.session {
            Some(s) => s.device_id.clone(),
            None => return Err(CoreError::NotReady),
        };
        if !st.devices.iter().any(|d| d.device_id == device_id) {
            return Err(CoreError::PermissionDenied);
        }

        if let Some(session) = st.session.as_mut() {
            session.apply_optimistic_mode(mode);
        }
        st.record_relay(format!("{device_id}: irrigation mode {mode} requested"));

        (device_id, st.mqtt_connected)
    };

    deliver(
        shared,
        mqtt,
        &device_id,
        mqtt::mode_set_topic(&device_id),
        mode.as_str().as_bytes().to_vec(),
        connected,
    )
    .await?;

    info!(device = %device_id, %mode, "irrigation mode command sent");
    Ok(())
}

/// One best-effort publish, classified into the error taxonomy. A dead
/// broker connection is a transient outage (retryable); a dead client
/// channel means the transport itself is gone.
async fn deliver(
    shared: &SharedState,
    mqtt: &AsyncClient,
    device_id: &str,
    topic: String,
    payload: Vec<u8>,
    connected: bool,
) -> CoreResult<()> {
    if !connected {
        let err = CoreError::Unavailable("mqtt broker disconnected".into());
        record_failure(shared, device_id, &err).await;
        return Err(err);
    }

    match mqtt.publish(topic, QoS::AtLeastOnce, false, payload).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let err = CoreError::NetworkError(e.to_string());
            record_failure(shared, device_id, &err).await;
            Err(err)
        }
    }
}

async fn record_failure(shared: &SharedState, device_id: &str, err: &CoreError) {
    error!(device = %device_id, "command delivery failed: {err}");
    let mut st = shared.write().await;
    st.record_error(format!("{device_id}: command failed: {err}"));
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::Transition;
    use crate::registry::DeviceSummary;
    use crate::session::DeviceSession;
    use crate::state::{CoreState, Principal};
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tokio::time::Instant;

    const NOW_MS: i64 = 1_700_000_000_000;

    fn test_mqtt() -> (AsyncClient, rumqttc::EventLoop) {
        let opts = rumqttc::MqttOptions::new("test-relay", "127.0.0.1", 1883);
        AsyncClient::new(opts, 32)
    }

    fn principal() -> Principal {
        Principal {
            user_id: "user-1".into(),
            email: "grower@example.com".into(),
        }
    }

    fn assigned(device_id: &str) -> DeviceSummary {
        DeviceSummary {
            device_id: device_id.into(),
            farm_name: "North Farm".into(),
            location: "west field".into(),
            crop_type: "maize".into(),
            assigned_at: 100,
        }
    }

    /// Shared state with a ready session for `dev-1`, broker connected.
    async fn ready_state(client: &AsyncClient) -> SharedState {
        let mut st = CoreState::new(Some(principal()));
        st.mqtt_connected = true;
        st.devices = vec![assigned("dev-1")];

        let mut session = DeviceSession::open(client, "dev-1").await.unwrap();
        let t = session.apply_meta(NOW_MS - 1_000, NOW_MS, Instant::now());
        assert_eq!(t, Transition::WentOnline);
        st.session = Some(session);

        Arc::new(RwLock::new(st))
    }

    // -- Preconditions --------------------------------------------------------

    #[tokio::test]
    async fn not_ready_without_principal() {
        let (client, _el) = test_mqtt();
        let shared = ready_state(&client).await;
        shared.write().await.principal = None;

        let err = send_relay_command(&shared, &client, RelayState::On)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_ready");

        // No optimistic update happened.
        let st = shared.read().await;
        assert_eq!(st.session.as_ref().unwrap().relay, RelayState::Off);
        // No event was recorded either — nothing was attempted.
        assert!(st.events.is_empty());
    }

    #[tokio::test]
    async fn not_ready_without_session() {
        let (client, _el) = test_mqtt();
        let shared = ready_state(&client).await;
        shared.write().await.session = None;

        let err = send_relay_command(&shared, &client, RelayState::On)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_ready");
    }

    #[tokio::test]
    async fn permission_denied_when_assignment_is_gone() {
        let (client, _el) = test_mqtt();
        let shared = ready_state(&client).await;
        shared.write().await.devices.clear();

        let err = send_relay_command(&shared, &client, RelayState::On)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permission_denied");

        let st = shared.read().await;
        assert_eq!(st.session.as_ref().unwrap().relay, RelayState::Off);
    }

    // -- Success --------------------------------------------------------------

    #[tokio::test]
    async fn command_carries_provenance_and_applies_optimistically() {
        let (client, _el) = test_mqtt();
        let shared = ready_state(&client).await;

        let cmd = send_relay_command(&shared, &client, RelayState::On)
            .await
            .unwrap();

        assert_eq!(cmd.value, RelayState::On);
        assert_eq!(cmd.requested_by, "user-1");
        assert_eq!(cmd.requested_by_email, "grower@example.com");
        assert!(cmd.timestamp > 1_700_000_000_000);

        let st = shared.read().await;
        let session = st.session.as_ref().unwrap();
        assert_eq!(session.relay, RelayState::On);
        assert_eq!(session.reading.relay_status, RelayState::On);
    }

    // -- Failure classification ------------------------------------------------

    #[tokio::test]
    async fn unavailable_when_broker_disconnected() {
        let (client, _el) = test_mqtt();
        let shared = ready_state(&client).await;
        shared.write().await.mqtt_connected = false;

        let err = send_relay_command(&shared, &client, RelayState::On)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unavailable");

        // Optimistic value stays — no rollback; the authoritative stream
        // corrects it later.
        let st = shared.read().await;
        assert_eq!(st.session.as_ref().unwrap().relay, RelayState::On);

        // A specific failure notification was recorded.
        assert!(st
            .events
            .iter()
            .any(|e| e.detail.contains("command failed")));
    }

    // -- Mode ------------------------------------------------------------------

    #[tokio::test]
    async fn mode_command_applies_optimistically() {
        let (client, _el) = test_mqtt();
        let shared = ready_state(&client).await;

        set_irrigation_mode(&shared, &client, IrrigationMode::Auto)
            .await
            .unwrap();

        let st = shared.read().await;
        assert_eq!(st.session.as_ref().unwrap().mode, IrrigationMode::Auto);
    }

    #[tokio::test]
    async fn mode_not_ready_without_session() {
        let (client, _el) = test_mqtt();
        let shared = ready_state(&client).await;
        shared.write().await.session = None;

        let err = set_irrigation_mode(&shared, &client, IrrigationMode::Auto)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_ready");
    }
}
