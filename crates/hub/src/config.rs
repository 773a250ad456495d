//! TOML config file loading, validation, and database seeding: the signed-in
//! principal, the device assignments granted to users, and optional
//! per-device threshold defaults. Assignment rows are normally created by an
//! upstream approval workflow; the config file stands in for it here.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::db::{AssignmentRecord, Db, ThresholdConfig};
use crate::liveness::now_epoch_ms;
use crate::registry::{ASSIGNED_STATUSES, MAX_ASSIGNED_DEVICES};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub principal: PrincipalEntry,
    #[serde(default)]
    pub assignments: Vec<AssignmentEntry>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdEntry>,
}

#[derive(Debug, Deserialize)]
pub struct PrincipalEntry {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct AssignmentEntry {
    pub device_id: String,
    pub user_id: String,
    pub status: String,
    pub farm_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub crop_type: String,
    #[serde(default)]
    pub soil_type: String,
    /// Epoch milliseconds; absent or 0 means "stamp at seed time".
    #[serde(default)]
    pub assigned_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct ThresholdEntry {
    pub device_id: String,
    pub soil_moisture_low: f64,
    pub soil_moisture_high: f64,
}

/// Assignment statuses the upstream workflow produces.
const KNOWN_STATUSES: &[&str] = &["active", "approved", "pending", "revoked"];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_principal(&mut errors);
        self.validate_assignments(&mut errors);
        self.validate_thresholds(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_principal(&self, errors: &mut Vec<String>) {
        if self.principal.user_id.trim().is_empty() {
            errors.push("principal: user_id is empty".to_string());
        }
        if !self.principal.email.contains('@') {
            errors.push(format!(
                "principal: email '{}' is not an email address",
                self.principal.email
            ));
        }
    }

    fn validate_assignments(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, a) in self.assignments.iter().enumerate() {
            let ctx = || {
                if a.device_id.is_empty() {
                    format!("assignments[{i}]")
                } else {
                    format!("assignment '{}'", a.device_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if a.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if !seen_ids.insert(&a.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }

            if a.user_id.trim().is_empty() {
                errors.push(format!("{}: user_id is empty", ctx()));
            }

            if a.farm_name.trim().is_empty() {
                errors.push(format!("{}: farm_name is empty", ctx()));
            }

            // ── Status ──────────────────────────────────────────
            if !KNOWN_STATUSES.contains(&a.status.as_str()) {
                errors.push(format!(
                    "{}: unknown status '{}' (allowed: {})",
                    ctx(),
                    a.status,
                    KNOWN_STATUSES.join(", ")
                ));
            }

            if a.assigned_at < 0 {
                errors.push(format!(
                    "{}: assigned_at must not be negative, got {}",
                    ctx(),
                    a.assigned_at
                ));
            }
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let device_ids: HashSet<&str> = self
            .assignments
            .iter()
            .map(|a| a.device_id.as_str())
            .collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, t) in self.thresholds.iter().enumerate() {
            let ctx = || {
                if t.device_id.is_empty() {
                    format!("thresholds[{i}]")
                } else {
                    format!("threshold '{}'", t.device_id)
                }
            };

            if t.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if !device_ids.contains(t.device_id.as_str()) {
                errors.push(format!(
                    "{}: device_id '{}' does not match any assignment",
                    ctx(),
                    t.device_id
                ));
            } else if !seen_ids.insert(&t.device_id) {
                errors.push(format!("{}: duplicate threshold entry", ctx()));
            }
            // Bounds themselves are deliberately unchecked: low/high ordering
            // is a caller concern and the hardware tolerates any values.
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all assignments and threshold defaults from the config into the
/// database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let now = now_epoch_ms();

    for a in &config.assignments {
        db.upsert_assignment(&AssignmentRecord {
            device_id: a.device_id.clone(),
            user_id: a.user_id.clone(),
            status: a.status.clone(),
            farm_name: a.farm_name.clone(),
            location: a.location.clone(),
            crop_type: a.crop_type.clone(),
            soil_type: a.soil_type.clone(),
            assigned_at: if a.assigned_at > 0 { a.assigned_at } else { now },
        })
        .await
        .with_context(|| format!("failed to upsert assignment '{}'", a.device_id))?;
    }

    for t in &config.thresholds {
        db.upsert_thresholds(&ThresholdConfig {
            device_id: t.device_id.clone(),
            soil_moisture_low: t.soil_moisture_low,
            soil_moisture_high: t.soil_moisture_high,
            updated_by: "config".to_string(),
            updated_at: now,
        })
        .await
        .with_context(|| format!("failed to upsert thresholds '{}'", t.device_id))?;
    }

    // The assignment cap binds new requests upstream, not existing seeds —
    // flag overflow loudly but keep going.
    let mut per_user: HashMap<&str, usize> = HashMap::new();
    for a in &config.assignments {
        if ASSIGNED_STATUSES.contains(&a.status.as_str()) {
            *per_user.entry(a.user_id.as_str()).or_default() += 1;
        }
    }
    for (user_id, count) in per_user {
        if count > MAX_ASSIGNED_DEVICES {
            warn!(
                user = %user_id,
                count,
                max = MAX_ASSIGNED_DEVICES,
                "seeded assignments exceed the device cap"
            );
        }
    }

    tracing::info!(
        assignments = config.assignments.len(),
        thresholds = config.thresholds.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
