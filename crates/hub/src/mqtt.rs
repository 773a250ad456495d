use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire enums
// ---------------------------------------------------------------------------

/// On/off state of the remote irrigation relay (pump).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    #[default]
    Off,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::On => "on",
            RelayState::Off => "off",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device irrigation mode: automatic (threshold-driven) or manual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IrrigationMode {
    Auto,
    #[default]
    Manual,
}

impl IrrigationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IrrigationMode::Auto => "auto",
            IrrigationMode::Manual => "manual",
        }
    }
}

impl fmt::Display for IrrigationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Actuator instruction written to `farm/<id>/relay/set`. Immutable once
/// sent; the next user action produces a fresh one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCommand {
    pub value: RelayState,
    pub requested_by: String,
    pub requested_by_email: String,
    /// Issue time, epoch milliseconds.
    pub timestamp: i64,
}

/// Liveness marker published by the device on `farm/<id>/meta`. The number
/// may be epoch seconds, epoch milliseconds, or a device-relative counter;
/// classification happens in `liveness`.
#[derive(Debug, Deserialize)]
pub struct MetaMsg {
    #[serde(rename = "lastSeen", alias = "last_seen")]
    pub last_seen: f64,
}

impl MetaMsg {
    pub fn last_seen_raw(&self) -> i64 {
        self.last_seen as i64
    }
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Inbound topic kinds the hub subscribes to for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTopic {
    Sensors,
    Meta,
    RelayStatus,
    Mode,
}

pub fn sensors_topic(device_id: &str) -> String {
    format!("farm/{device_id}/sensors")
}

pub fn meta_topic(device_id: &str) -> String {
    format!("farm/{device_id}/meta")
}

pub fn relay_status_topic(device_id: &str) -> String {
    format!("farm/{device_id}/relay/status")
}

pub fn relay_set_topic(device_id: &str) -> String {
    format!("farm/{device_id}/relay/set")
}

pub fn mode_topic(device_id: &str) -> String {
    format!("farm/{device_id}/mode")
}

pub fn mode_set_topic(device_id: &str) -> String {
    format!("farm/{device_id}/mode/set")
}

pub fn config_topic(device_id: &str) -> String {
    format!("farm/{device_id}/config")
}

/// Parse an inbound topic into `(device_id, kind)`. Outbound (`.../set`,
/// `.../config`) topics are not recognized — the hub never subscribes to
/// its own command topics.
pub fn parse_device_topic(topic: &str) -> Option<(&str, DeviceTopic)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < 3 || parts[0] != "farm" || parts[1].is_empty() {
        return None;
    }
    let device_id = parts[1];
    match &parts[2..] {
        ["sensors"] => Some((device_id, DeviceTopic::Sensors)),
        ["meta"] => Some((device_id, DeviceTopic::Meta)),
        ["relay", "status"] => Some((device_id, DeviceTopic::RelayStatus)),
        ["mode"] => Some((device_id, DeviceTopic::Mode)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Parse an "on"/"off" payload (case-insensitive, trims whitespace).
pub fn parse_relay_status(payload: &[u8]) -> Result<RelayState, String> {
    let s = String::from_utf8_lossy(payload).trim().to_lowercase();
    match s.as_str() {
        "on" => Ok(RelayState::On),
        "off" => Ok(RelayState::Off),
        _ => Err(format!("unknown relay status '{s}'")),
    }
}

/// Parse an "auto"/"manual" payload (case-insensitive, trims whitespace).
pub fn parse_mode(payload: &[u8]) -> Result<IrrigationMode, String> {
    let s = String::from_utf8_lossy(payload).trim().to_lowercase();
    match s.as_str() {
        "auto" => Ok(IrrigationMode::Auto),
        "manual" => Ok(IrrigationMode::Manual),
        _ => Err(format!("unknown irrigation mode '{s}'")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- parse_device_topic -------------------------------------------------

    #[test]
    fn parse_sensors_topic() {
        assert_eq!(
            parse_device_topic("farm/dev-1/sensors"),
            Some(("dev-1", DeviceTopic::Sensors))
        );
    }

    #[test]
    fn parse_meta_topic() {
        assert_eq!(
            parse_device_topic("farm/dev-1/meta"),
            Some(("dev-1", DeviceTopic::Meta))
        );
    }

    #[test]
    fn parse_relay_status_topic() {
        assert_eq!(
            parse_device_topic("farm/greenhouse-3/relay/status"),
            Some(("greenhouse-3", DeviceTopic::RelayStatus))
        );
    }

    #[test]
    fn parse_mode_topic() {
        assert_eq!(
            parse_device_topic("farm/dev-1/mode"),
            Some(("dev-1", DeviceTopic::Mode))
        );
    }

    #[test]
    fn parse_wrong_prefix() {
        assert_eq!(parse_device_topic("tele/dev-1/sensors"), None);
    }

    #[test]
    fn parse_unknown_suffix() {
        assert_eq!(parse_device_topic("farm/dev-1/unknown"), None);
    }

    #[test]
    fn parse_outbound_topics_rejected() {
        assert_eq!(parse_device_topic("farm/dev-1/relay/set"), None);
        assert_eq!(parse_device_topic("farm/dev-1/mode/set"), None);
        assert_eq!(parse_device_topic("farm/dev-1/config"), None);
    }

    #[test]
    fn parse_too_few_segments() {
        assert_eq!(parse_device_topic("farm/sensors"), None);
    }

    #[test]
    fn parse_empty_device_id() {
        assert_eq!(parse_device_topic("farm//sensors"), None);
    }

    #[test]
    fn parse_empty_string() {
        assert_eq!(parse_device_topic(""), None);
    }

    #[test]
    fn builders_round_trip_through_parser() {
        assert_eq!(
            parse_device_topic(&sensors_topic("d1")),
            Some(("d1", DeviceTopic::Sensors))
        );
        assert_eq!(
            parse_device_topic(&meta_topic("d1")),
            Some(("d1", DeviceTopic::Meta))
        );
        assert_eq!(
            parse_device_topic(&relay_status_topic("d1")),
            Some(("d1", DeviceTopic::RelayStatus))
        );
        assert_eq!(
            parse_device_topic(&mode_topic("d1")),
            Some(("d1", DeviceTopic::Mode))
        );
    }

    // -- parse_relay_status -------------------------------------------------

    #[test]
    fn relay_status_on_lowercase() {
        assert_eq!(parse_relay_status(b"on"), Ok(RelayState::On));
    }

    #[test]
    fn relay_status_off_uppercase() {
        assert_eq!(parse_relay_status(b"OFF"), Ok(RelayState::Off));
    }

    #[test]
    fn relay_status_mixed_case_with_whitespace() {
        assert_eq!(parse_relay_status(b"  On \n"), Ok(RelayState::On));
    }

    #[test]
    fn relay_status_garbage() {
        assert!(parse_relay_status(b"toggle").is_err());
    }

    #[test]
    fn relay_status_empty() {
        assert!(parse_relay_status(b"").is_err());
    }

    // -- parse_mode ----------------------------------------------------------

    #[test]
    fn mode_auto() {
        assert_eq!(parse_mode(b"auto"), Ok(IrrigationMode::Auto));
    }

    #[test]
    fn mode_manual_uppercase() {
        assert_eq!(parse_mode(b"MANUAL"), Ok(IrrigationMode::Manual));
    }

    #[test]
    fn mode_garbage() {
        assert!(parse_mode(b"turbo").is_err());
    }

    // -- RelayCommand wire shape ---------------------------------------------

    #[test]
    fn relay_command_serializes_camel_case() {
        let cmd = RelayCommand {
            value: RelayState::On,
            requested_by: "user-7".into(),
            requested_by_email: "grower@example.com".into(),
            timestamp: 1_700_000_000_123,
        };
        let json = serde_json::to_value(&cmd).unwrap();

        assert_eq!(json["value"], "on");
        assert_eq!(json["requestedBy"], "user-7");
        assert_eq!(json["requestedByEmail"], "grower@example.com");
        assert_eq!(json["timestamp"], 1_700_000_000_123_i64);
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    #[test]
    fn relay_command_round_trips() {
        let cmd = RelayCommand {
            value: RelayState::Off,
            requested_by: "u".into(),
            requested_by_email: "u@e".into(),
            timestamp: 42,
        };
        let back: RelayCommand =
            serde_json::from_str(&serde_json::to_string(&cmd).unwrap()).unwrap();
        assert_eq!(back, cmd);
    }

    // -- MetaMsg -------------------------------------------------------------

    #[test]
    fn meta_accepts_camel_case() {
        let m: MetaMsg = serde_json::from_str(r#"{"lastSeen": 500}"#).unwrap();
        assert_eq!(m.last_seen_raw(), 500);
    }

    #[test]
    fn meta_accepts_snake_case() {
        let m: MetaMsg = serde_json::from_str(r#"{"last_seen": 1700000000}"#).unwrap();
        assert_eq!(m.last_seen_raw(), 1_700_000_000);
    }

    #[test]
    fn meta_accepts_float_millis() {
        let m: MetaMsg = serde_json::from_str(r#"{"lastSeen": 1700000000123.0}"#).unwrap();
        assert_eq!(m.last_seen_raw(), 1_700_000_000_123);
    }

    #[test]
    fn meta_missing_field_fails() {
        assert!(serde_json::from_str::<MetaMsg>(r#"{"seen": 1}"#).is_err());
    }
}
