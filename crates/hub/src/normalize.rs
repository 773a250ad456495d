//! Field normalization: maps raw device telemetry with arbitrary, firmware-
//! specific key spellings onto the canonical sensor schema the dashboard
//! consumes. Pure — same record in, same reading out, no hidden state.
//!
//! Each canonical field carries a static, ordered alias table; the first key
//! present in the raw record wins, and a value of the wrong JSON type is
//! skipped as if absent. Fields with no alias hit get a type-appropriate
//! zero/false/"off" default and are reported in the missing-field
//! diagnostics (operability aid, never an error).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::mqtt::RelayState;

/// Unprocessed payload from a device: a string-keyed JSON object.
pub type RawRecord = Map<String, Value>;

// ---------------------------------------------------------------------------
// Canonical schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GasReadings {
    pub co2: f64,
    pub nh3: f64,
}

/// Normalized sensor snapshot. Superseded wholesale on every update and
/// zeroed wholesale when the device transitions to offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalReading {
    pub soil_moisture_raw: f64,
    pub soil_moisture_pct: f64,
    pub air_temperature: f64,
    pub air_humidity: f64,
    pub soil_temperature: f64,
    pub air_quality_index: f64,
    pub gases: GasReadings,
    pub light_detected: bool,
    pub rain_level_raw: f64,
    pub relay_status: RelayState,
    pub timestamp: i64,
    pub device_online: bool,
}

// ---------------------------------------------------------------------------
// Alias tables — version 1
//
// First entry of each list is the canonical spelling, so normalizing an
// already-canonical record is the identity. Later entries are the snake_case
// and sensor-model spellings observed in the field.
// ---------------------------------------------------------------------------

pub const SOIL_MOISTURE_RAW: &[&str] = &[
    "soilMoistureRaw",
    "soil_moisture_raw",
    "soil_raw",
    "moisture_raw",
    "capacitive_raw",
];
pub const SOIL_MOISTURE_PCT: &[&str] = &[
    "soilMoisturePct",
    "soil_moisture_pct",
    "soil_moisture",
    "moisture_pct",
    "soil_pct",
];
pub const AIR_TEMPERATURE: &[&str] = &[
    "airTemperature",
    "air_temperature",
    "temperature",
    "dht11_temp",
    "dht22_temp",
    "temp",
];
pub const AIR_HUMIDITY: &[&str] = &[
    "airHumidity",
    "air_humidity",
    "humidity",
    "dht11_humidity",
    "dht22_humidity",
    "hum",
];
pub const SOIL_TEMPERATURE: &[&str] = &[
    "soilTemperature",
    "soil_temperature",
    "ds18b20_temp",
    "soil_temp",
];
pub const AIR_QUALITY_INDEX: &[&str] = &[
    "airQualityIndex",
    "air_quality_index",
    "aqi",
    "mq135_aqi",
    "air_quality",
];
pub const GAS_CONTAINER: &[&str] = &["gases", "gas", "gas_readings"];
pub const GAS_CO2: &[&str] = &["co2", "CO2", "gas_co2", "mq135_co2"];
pub const GAS_NH3: &[&str] = &["nh3", "NH3", "gas_nh3", "mq135_nh3"];
pub const LIGHT_DETECTED: &[&str] = &["lightDetected", "light_detected", "light", "ldr"];
pub const RAIN_LEVEL_RAW: &[&str] = &[
    "rainLevelRaw",
    "rain_level_raw",
    "rain_raw",
    "rain_level",
    "rain",
];
pub const RELAY_STATUS: &[&str] = &["relayStatus", "relay_status", "relay", "pump", "pump_status"];
pub const TIMESTAMP: &[&str] = &["timestamp", "ts", "time", "reported_at"];
pub const DEVICE_ONLINE: &[&str] = &["deviceOnline", "device_online", "online"];

/// Numeric canonical fields with their alias lists, for operability docs and
/// exhaustive coverage tests.
pub const NUMERIC_FIELDS: &[(&str, &[&str])] = &[
    ("soilMoistureRaw", SOIL_MOISTURE_RAW),
    ("soilMoisturePct", SOIL_MOISTURE_PCT),
    ("airTemperature", AIR_TEMPERATURE),
    ("airHumidity", AIR_HUMIDITY),
    ("soilTemperature", SOIL_TEMPERATURE),
    ("airQualityIndex", AIR_QUALITY_INDEX),
    ("rainLevelRaw", RAIN_LEVEL_RAW),
];

// ---------------------------------------------------------------------------
// Value extraction
// ---------------------------------------------------------------------------

fn value_as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

fn value_as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

fn value_as_relay(v: &Value) -> Option<RelayState> {
    match v {
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "on" => Some(RelayState::On),
            "off" => Some(RelayState::Off),
            _ => None,
        },
        Value::Bool(true) => Some(RelayState::On),
        Value::Bool(false) => Some(RelayState::Off),
        Value::Number(n) => n.as_f64().map(|f| {
            if f != 0.0 {
                RelayState::On
            } else {
                RelayState::Off
            }
        }),
        _ => None,
    }
}

fn pick<T>(map: &RawRecord, aliases: &[&str], convert: fn(&Value) -> Option<T>) -> Option<T> {
    for key in aliases {
        if let Some(v) = map.get(*key) {
            if let Some(out) = convert(v) {
                return Some(out);
            }
        }
    }
    None
}

/// Tracks which canonical fields found no alias hit while walking one record.
struct FieldPicker<'a> {
    raw: &'a RawRecord,
    missing: Vec<&'static str>,
}

impl<'a> FieldPicker<'a> {
    fn new(raw: &'a RawRecord) -> Self {
        Self {
            raw,
            missing: Vec::new(),
        }
    }

    fn number(&mut self, canonical: &'static str, aliases: &[&str]) -> f64 {
        match pick(self.raw, aliases, value_as_f64) {
            Some(v) => v,
            None => {
                self.missing.push(canonical);
                0.0
            }
        }
    }

    /// Gas fields live inside a nested object in well-behaved payloads, but
    /// some firmware flattens them to the top level.
    fn gas(&mut self, canonical: &'static str, aliases: &[&str]) -> f64 {
        for container in GAS_CONTAINER {
            if let Some(Value::Object(nested)) = self.raw.get(*container) {
                if let Some(v) = pick(nested, aliases, value_as_f64) {
                    return v;
                }
            }
        }
        match pick(self.raw, aliases, value_as_f64) {
            Some(v) => v,
            None => {
                self.missing.push(canonical);
                0.0
            }
        }
    }

    fn boolean(&mut self, canonical: &'static str, aliases: &[&str]) -> bool {
        match pick(self.raw, aliases, value_as_bool) {
            Some(v) => v,
            None => {
                self.missing.push(canonical);
                false
            }
        }
    }

    fn relay(&mut self, canonical: &'static str, aliases: &[&str]) -> RelayState {
        match pick(self.raw, aliases, value_as_relay) {
            Some(v) => v,
            None => {
                self.missing.push(canonical);
                RelayState::Off
            }
        }
    }

    fn integer(&mut self, canonical: &'static str, aliases: &[&str]) -> i64 {
        match pick(self.raw, aliases, value_as_f64) {
            Some(v) => v as i64,
            None => {
                self.missing.push(canonical);
                0
            }
        }
    }

    /// Like `boolean` but never reported missing: `deviceOnline` is owned by
    /// the liveness verdict, not the payload.
    fn flag(&mut self, aliases: &[&str]) -> bool {
        pick(self.raw, aliases, value_as_bool).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub reading: CanonicalReading,
    /// Canonical fields the raw record did not report under any known alias.
    pub missing: Vec<&'static str>,
}

/// Normalize one raw telemetry record. `None` in, `None` out.
pub fn normalize(raw: Option<&RawRecord>) -> Option<Normalized> {
    let raw = raw?;
    let mut p = FieldPicker::new(raw);

    let reading = CanonicalReading {
        soil_moisture_raw: p.number("soilMoistureRaw", SOIL_MOISTURE_RAW),
        soil_moisture_pct: p.number("soilMoisturePct", SOIL_MOISTURE_PCT),
        air_temperature: p.number("airTemperature", AIR_TEMPERATURE),
        air_humidity: p.number("airHumidity", AIR_HUMIDITY),
        soil_temperature: p.number("soilTemperature", SOIL_TEMPERATURE),
        air_quality_index: p.number("airQualityIndex", AIR_QUALITY_INDEX),
        gases: GasReadings {
            co2: p.gas("gases.co2", GAS_CO2),
            nh3: p.gas("gases.nh3", GAS_NH3),
        },
        light_detected: p.boolean("lightDetected", LIGHT_DETECTED),
        rain_level_raw: p.number("rainLevelRaw", RAIN_LEVEL_RAW),
        relay_status: p.relay("relayStatus", RELAY_STATUS),
        timestamp: p.integer("timestamp", TIMESTAMP),
        device_online: p.flag(DEVICE_ONLINE),
    };

    Some(Normalized {
        reading,
        missing: p.missing,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: serde_json::Value) -> RawRecord {
        json.as_object().unwrap().clone()
    }

    /// Look a numeric canonical field up by its spec name.
    fn numeric_value(r: &CanonicalReading, canonical: &str) -> f64 {
        match canonical {
            "soilMoistureRaw" => r.soil_moisture_raw,
            "soilMoisturePct" => r.soil_moisture_pct,
            "airTemperature" => r.air_temperature,
            "airHumidity" => r.air_humidity,
            "soilTemperature" => r.soil_temperature,
            "airQualityIndex" => r.air_quality_index,
            "rainLevelRaw" => r.rain_level_raw,
            other => panic!("unknown numeric field {other}"),
        }
    }

    // -- Basics --------------------------------------------------------------

    #[test]
    fn none_in_none_out() {
        assert!(normalize(None).is_none());
    }

    #[test]
    fn empty_record_yields_defaults_and_full_missing_list() {
        let n = normalize(Some(&raw(serde_json::json!({})))).unwrap();

        assert_eq!(n.reading, CanonicalReading::default());
        assert_eq!(n.reading.relay_status, RelayState::Off);
        assert!(!n.reading.device_online);

        // Every canonical field except deviceOnline is diagnosed as missing.
        for (canonical, _) in NUMERIC_FIELDS {
            assert!(n.missing.contains(canonical), "missing should list {canonical}");
        }
        assert!(n.missing.contains(&"gases.co2"));
        assert!(n.missing.contains(&"gases.nh3"));
        assert!(n.missing.contains(&"lightDetected"));
        assert!(n.missing.contains(&"relayStatus"));
        assert!(n.missing.contains(&"timestamp"));
        assert!(!n.missing.contains(&"deviceOnline"));
    }

    // -- Alias coverage ------------------------------------------------------

    #[test]
    fn every_numeric_alias_is_honored() {
        for (canonical, aliases) in NUMERIC_FIELDS {
            for alias in *aliases {
                let n = normalize(Some(&raw(serde_json::json!({ *alias: 42.5 })))).unwrap();
                assert_eq!(
                    numeric_value(&n.reading, canonical),
                    42.5,
                    "alias {alias} should feed {canonical}"
                );
                assert!(!n.missing.contains(canonical));
            }
        }
    }

    #[test]
    fn every_light_alias_is_honored() {
        for alias in LIGHT_DETECTED {
            let n = normalize(Some(&raw(serde_json::json!({ *alias: true })))).unwrap();
            assert!(n.reading.light_detected, "alias {alias}");
        }
    }

    #[test]
    fn every_relay_alias_is_honored() {
        for alias in RELAY_STATUS {
            let n = normalize(Some(&raw(serde_json::json!({ *alias: "on" })))).unwrap();
            assert_eq!(n.reading.relay_status, RelayState::On, "alias {alias}");
        }
    }

    #[test]
    fn every_timestamp_alias_is_honored() {
        for alias in TIMESTAMP {
            let n = normalize(Some(&raw(serde_json::json!({ *alias: 1_700_000_000 })))).unwrap();
            assert_eq!(n.reading.timestamp, 1_700_000_000, "alias {alias}");
        }
    }

    #[test]
    fn first_present_alias_wins() {
        let n = normalize(Some(&raw(serde_json::json!({
            "airTemperature": 21.0,
            "temperature": 99.0,
        }))))
        .unwrap();
        assert_eq!(n.reading.air_temperature, 21.0);

        let n = normalize(Some(&raw(serde_json::json!({
            "temperature": 22.0,
            "dht11_temp": 99.0,
        }))))
        .unwrap();
        assert_eq!(n.reading.air_temperature, 22.0);
    }

    #[test]
    fn wrong_typed_value_is_skipped() {
        let n = normalize(Some(&raw(serde_json::json!({
            "airTemperature": "scorching",
            "temperature": 31.0,
        }))))
        .unwrap();
        assert_eq!(n.reading.air_temperature, 31.0);
    }

    // -- Gas nesting ---------------------------------------------------------

    #[test]
    fn nested_gases_object() {
        let n = normalize(Some(&raw(serde_json::json!({
            "gases": { "co2": 410.0, "nh3": 1.2 }
        }))))
        .unwrap();
        assert_eq!(n.reading.gases.co2, 410.0);
        assert_eq!(n.reading.gases.nh3, 1.2);
        assert!(!n.missing.contains(&"gases.co2"));
    }

    #[test]
    fn nested_gas_container_aliases() {
        let n = normalize(Some(&raw(serde_json::json!({
            "gas_readings": { "mq135_co2": 500.0 }
        }))))
        .unwrap();
        assert_eq!(n.reading.gases.co2, 500.0);
    }

    #[test]
    fn flat_gas_keys_fallback() {
        let n = normalize(Some(&raw(serde_json::json!({
            "gas_co2": 415.0,
            "nh3": 0.8,
        }))))
        .unwrap();
        assert_eq!(n.reading.gases.co2, 415.0);
        assert_eq!(n.reading.gases.nh3, 0.8);
    }

    // -- Relay value shapes --------------------------------------------------

    #[test]
    fn relay_accepts_bool_and_number() {
        let n = normalize(Some(&raw(serde_json::json!({ "relay": true })))).unwrap();
        assert_eq!(n.reading.relay_status, RelayState::On);

        let n = normalize(Some(&raw(serde_json::json!({ "pump": 0 })))).unwrap();
        assert_eq!(n.reading.relay_status, RelayState::Off);
    }

    #[test]
    fn relay_string_case_insensitive() {
        let n = normalize(Some(&raw(serde_json::json!({ "relayStatus": "ON" })))).unwrap();
        assert_eq!(n.reading.relay_status, RelayState::On);
    }

    #[test]
    fn light_accepts_numeric_flag() {
        let n = normalize(Some(&raw(serde_json::json!({ "ldr": 1 })))).unwrap();
        assert!(n.reading.light_detected);
    }

    // -- Idempotence ---------------------------------------------------------

    #[test]
    fn normalizing_a_canonical_record_is_identity() {
        let original = CanonicalReading {
            soil_moisture_raw: 18342.0,
            soil_moisture_pct: 47.5,
            air_temperature: 26.1,
            air_humidity: 63.0,
            soil_temperature: 19.4,
            air_quality_index: 82.0,
            gases: GasReadings { co2: 412.0, nh3: 1.1 },
            light_detected: true,
            rain_level_raw: 120.0,
            relay_status: RelayState::On,
            timestamp: 1_700_000_000_123,
            device_online: true,
        };

        let as_map = raw(serde_json::to_value(&original).unwrap());
        let n = normalize(Some(&as_map)).unwrap();

        assert_eq!(n.reading, original);
        assert!(n.missing.is_empty(), "unexpected missing: {:?}", n.missing);
    }

    // -- Field scenario ------------------------------------------------------

    #[test]
    fn snake_case_partial_record_scenario() {
        let n = normalize(Some(&raw(serde_json::json!({
            "soil_moisture_pct": 42,
            "dht11_temp": 27,
        }))))
        .unwrap();

        assert_eq!(n.reading.soil_moisture_pct, 42.0);
        assert_eq!(n.reading.air_temperature, 27.0);

        assert_eq!(n.reading.soil_moisture_raw, 0.0);
        assert_eq!(n.reading.air_humidity, 0.0);
        assert_eq!(n.reading.soil_temperature, 0.0);
        assert_eq!(n.reading.air_quality_index, 0.0);
        assert_eq!(n.reading.gases.co2, 0.0);
        assert_eq!(n.reading.gases.nh3, 0.0);
        assert_eq!(n.reading.rain_level_raw, 0.0);
        assert_eq!(n.reading.relay_status, RelayState::Off);
    }

    #[test]
    fn canonical_serde_names_match_consumer_schema() {
        let json = serde_json::to_value(CanonicalReading::default()).unwrap();
        let obj = json.as_object().unwrap();
        for key in [
            "soilMoistureRaw",
            "soilMoisturePct",
            "airTemperature",
            "airHumidity",
            "soilTemperature",
            "airQualityIndex",
            "gases",
            "lightDetected",
            "rainLevelRaw",
            "relayStatus",
            "timestamp",
            "deviceOnline",
        ] {
            assert!(obj.contains_key(key), "schema key {key} missing");
        }
        assert_eq!(obj.len(), 12);
        assert_eq!(json["gases"]["co2"], 0.0);
        assert_eq!(json["relayStatus"], "off");
    }
}
