//! Stateful field-device simulator for local development.
//!
//! Models a mixed sensor stack (capacitive soil probe, DHT-style air
//! temperature/humidity, DS18B20 soil temperature, MQ-135 gas figures,
//! light and rain sensors) with:
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-reading electronic noise
//! - Closed-loop watering response (soil gets wetter while the pump runs)
//!
//! Real fleets never agree on payload key names, so the simulator publishes
//! through a firmware *dialect* that picks a spelling per field, and reports
//! its liveness marker in one of three formats.

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Firmware dialect
// ---------------------------------------------------------------------------

/// Which key spellings the device publishes. Selectable via `DIALECT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// camelCase keys with a nested `gases` object.
    Canonical,
    /// snake_case keys, gas fields flattened to the top level.
    SnakeCase,
    /// Sensor-model names (`dht11_temp`, `mq135_co2`, `ldr`, ...).
    Vendor,
}

impl Dialect {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "canonical" => Self::Canonical,
            "vendor" => Self::Vendor,
            _ => Self::SnakeCase, // default
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canonical => write!(f, "canonical"),
            Self::SnakeCase => write!(f, "snake_case"),
            Self::Vendor => write!(f, "vendor"),
        }
    }
}

// ---------------------------------------------------------------------------
// Liveness marker style
// ---------------------------------------------------------------------------

/// How the device reports `lastSeen`. Selectable via `LAST_SEEN_STYLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastSeenStyle {
    /// Seconds since boot — a device-relative counter.
    Uptime,
    /// Wall-clock epoch seconds.
    EpochSeconds,
    /// Wall-clock epoch milliseconds.
    EpochMillis,
}

impl LastSeenStyle {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "epoch_seconds" | "seconds" => Self::EpochSeconds,
            "epoch_millis" | "millis" => Self::EpochMillis,
            _ => Self::Uptime, // default
        }
    }

    /// Produce a marker value for the current instant.
    pub fn marker(&self, uptime_secs: i64, now_ms: i64) -> i64 {
        match self {
            Self::Uptime => uptime_secs,
            Self::EpochSeconds => now_ms / 1000,
            Self::EpochMillis => now_ms,
        }
    }
}

impl fmt::Display for LastSeenStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uptime => write!(f, "uptime"),
            Self::EpochSeconds => write!(f, "epoch_seconds"),
            Self::EpochMillis => write!(f, "epoch_millis"),
        }
    }
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Capacitive probe calibration endpoints (ADC units). Dry reads high.
const RAW_DRY: f64 = 26000.0;
const RAW_WET: f64 = 12000.0;

pub struct FieldSim {
    dialect: Dialect,

    soil_raw: f64,
    air_temp: f64,
    air_hum: f64,
    soil_temp: f64,
    aqi: f64,
    co2: f64,
    nh3: f64,
    rain: f64,

    /// Pump state; while on, soil moisture rises each tick.
    relay_on: bool,
    ticks: u64,
}

impl FieldSim {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            soil_raw: (RAW_DRY + RAW_WET) / 2.0,
            air_temp: 26.0,
            air_hum: 60.0,
            soil_temp: 20.0,
            aqi: 80.0,
            co2: 420.0,
            nh3: 1.0,
            rain: 40.0,
            relay_on: false,
            ticks: 0,
        }
    }

    pub fn set_relay(&mut self, on: bool) {
        self.relay_on = on;
    }

    pub fn relay_on(&self) -> bool {
        self.relay_on
    }

    /// Advance one sample period.
    pub fn tick(&mut self) {
        self.ticks += 1;

        // Soil: slow drying drift, noise, and watering response.
        self.soil_raw += 15.0 + gaussian(0.0, 120.0);
        if self.relay_on {
            self.soil_raw -= 350.0; // wetter = lower raw
        }
        self.soil_raw = self.soil_raw.clamp(RAW_WET, RAW_DRY);

        // Air / soil climate: mean-reverting walks.
        self.air_temp += 0.05 * (26.0 - self.air_temp) + gaussian(0.0, 0.3);
        self.air_hum += 0.05 * (60.0 - self.air_hum) + gaussian(0.0, 1.0);
        self.air_hum = self.air_hum.clamp(0.0, 100.0);
        self.soil_temp += 0.05 * (20.0 - self.soil_temp) + gaussian(0.0, 0.15);

        // Gas / air quality.
        self.co2 += 0.1 * (420.0 - self.co2) + gaussian(0.0, 5.0);
        self.nh3 = (self.nh3 + gaussian(0.0, 0.05)).max(0.0);
        self.aqi += 0.1 * (80.0 - self.aqi) + gaussian(0.0, 2.0);
        self.aqi = self.aqi.clamp(0.0, 500.0);

        // Rain sensor drifts; occasional shower.
        if fastrand::f32() < 0.02 {
            self.rain = gaussian(400.0, 60.0).clamp(0.0, 1023.0);
        } else {
            self.rain = (self.rain * 0.9 + gaussian(0.0, 5.0)).clamp(0.0, 1023.0);
        }
    }

    /// Soil moisture as a percentage of the calibration range.
    pub fn moisture_pct(&self) -> f64 {
        ((RAW_DRY - self.soil_raw) / (RAW_DRY - RAW_WET) * 100.0).clamp(0.0, 100.0)
    }

    /// Alternates with a long period to mimic day and night.
    fn light_detected(&self) -> bool {
        (self.ticks / 180) % 2 == 0
    }

    /// Build one telemetry payload in this device's dialect.
    pub fn telemetry(&self, ts: i64) -> serde_json::Value {
        let relay = if self.relay_on { "on" } else { "off" };
        match self.dialect {
            Dialect::Canonical => serde_json::json!({
                "soilMoistureRaw": self.soil_raw.round(),
                "soilMoisturePct": (self.moisture_pct() * 10.0).round() / 10.0,
                "airTemperature": (self.air_temp * 10.0).round() / 10.0,
                "airHumidity": (self.air_hum * 10.0).round() / 10.0,
                "soilTemperature": (self.soil_temp * 10.0).round() / 10.0,
                "airQualityIndex": self.aqi.round(),
                "gases": { "co2": self.co2.round(), "nh3": (self.nh3 * 100.0).round() / 100.0 },
                "lightDetected": self.light_detected(),
                "rainLevelRaw": self.rain.round(),
                "relayStatus": relay,
                "timestamp": ts,
            }),
            Dialect::SnakeCase => serde_json::json!({
                "soil_moisture_raw": self.soil_raw.round(),
                "soil_moisture_pct": (self.moisture_pct() * 10.0).round() / 10.0,
                "air_temperature": (self.air_temp * 10.0).round() / 10.0,
                "humidity": (self.air_hum * 10.0).round() / 10.0,
                "soil_temperature": (self.soil_temp * 10.0).round() / 10.0,
                "air_quality_index": self.aqi.round(),
                "gas_co2": self.co2.round(),
                "nh3": (self.nh3 * 100.0).round() / 100.0,
                "light_detected": self.light_detected(),
                "rain_level_raw": self.rain.round(),
                "relay_status": relay,
                "ts": ts,
            }),
            Dialect::Vendor => serde_json::json!({
                "capacitive_raw": self.soil_raw.round(),
                "soil_pct": (self.moisture_pct() * 10.0).round() / 10.0,
                "dht11_temp": self.air_temp.round(),
                "dht11_humidity": self.air_hum.round(),
                "ds18b20_temp": (self.soil_temp * 10.0).round() / 10.0,
                "mq135_aqi": self.aqi.round(),
                "gas": { "mq135_co2": self.co2.round(), "mq135_nh3": (self.nh3 * 100.0).round() / 100.0 },
                "ldr": if self.light_detected() { 1 } else { 0 },
                "rain": self.rain.round(),
                "pump": self.relay_on,
                "time": ts,
            }),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const NOW_MS: i64 = 1_700_000_000_000;

    // -- Dialect / style parsing --------------------------------------------

    #[test]
    fn dialect_from_str() {
        assert_eq!(Dialect::from_str_lossy("canonical"), Dialect::Canonical);
        assert_eq!(Dialect::from_str_lossy("VENDOR"), Dialect::Vendor);
        assert_eq!(Dialect::from_str_lossy("anything"), Dialect::SnakeCase);
    }

    #[test]
    fn last_seen_style_from_str() {
        assert_eq!(
            LastSeenStyle::from_str_lossy("seconds"),
            LastSeenStyle::EpochSeconds
        );
        assert_eq!(
            LastSeenStyle::from_str_lossy("millis"),
            LastSeenStyle::EpochMillis
        );
        assert_eq!(LastSeenStyle::from_str_lossy(""), LastSeenStyle::Uptime);
    }

    // -- Marker magnitudes ----------------------------------------------------

    #[test]
    fn uptime_marker_is_small() {
        let m = LastSeenStyle::Uptime.marker(734, NOW_MS);
        assert_eq!(m, 734);
        assert!(m < 1_000_000_000);
    }

    #[test]
    fn epoch_seconds_marker_is_ten_digits() {
        let m = LastSeenStyle::EpochSeconds.marker(734, NOW_MS);
        assert_eq!(m, 1_700_000_000);
    }

    #[test]
    fn epoch_millis_marker_is_thirteen_digits() {
        let m = LastSeenStyle::EpochMillis.marker(734, NOW_MS);
        assert_eq!(m, NOW_MS);
    }

    // -- Simulation dynamics --------------------------------------------------

    #[test]
    fn values_stay_in_sane_ranges() {
        let mut sim = FieldSim::new(Dialect::SnakeCase);
        for _ in 0..500 {
            sim.tick();
            assert!((0.0..=100.0).contains(&sim.moisture_pct()));
            assert!((0.0..=100.0).contains(&sim.air_hum));
            assert!((0.0..=500.0).contains(&sim.aqi));
            assert!(sim.nh3 >= 0.0);
        }
    }

    #[test]
    fn watering_raises_moisture() {
        let mut dry = FieldSim::new(Dialect::SnakeCase);
        let mut wet = FieldSim::new(Dialect::SnakeCase);
        wet.set_relay(true);

        for _ in 0..50 {
            dry.tick();
            wet.tick();
        }
        assert!(
            wet.moisture_pct() > dry.moisture_pct(),
            "watered plot ({:.1}%) should be wetter than unwatered ({:.1}%)",
            wet.moisture_pct(),
            dry.moisture_pct()
        );
    }

    // -- Payload shapes --------------------------------------------------------

    #[test]
    fn canonical_payload_keys() {
        let sim = FieldSim::new(Dialect::Canonical);
        let v = sim.telemetry(NOW_MS);
        assert!(v["soilMoisturePct"].is_number());
        assert!(v["gases"]["co2"].is_number());
        assert_eq!(v["relayStatus"], "off");
        assert_eq!(v["timestamp"], NOW_MS);
    }

    #[test]
    fn snake_case_payload_keys() {
        let sim = FieldSim::new(Dialect::SnakeCase);
        let v = sim.telemetry(NOW_MS);
        assert!(v["soil_moisture_pct"].is_number());
        assert!(v["gas_co2"].is_number());
        assert!(v["nh3"].is_number());
        assert_eq!(v["relay_status"], "off");
        assert_eq!(v["ts"], NOW_MS);
        assert!(v.get("soilMoisturePct").is_none());
    }

    #[test]
    fn vendor_payload_keys() {
        let mut sim = FieldSim::new(Dialect::Vendor);
        sim.set_relay(true);
        let v = sim.telemetry(NOW_MS);
        assert!(v["capacitive_raw"].is_number());
        assert!(v["dht11_temp"].is_number());
        assert!(v["gas"]["mq135_co2"].is_number());
        assert_eq!(v["pump"], true);
        assert_eq!(v["time"], NOW_MS);
    }
}
