//! Thin typed CRUD over recurring irrigation rules and moisture thresholds,
//! scoped to one device. Inputs are checked for required-field presence
//! only — threshold ordering and similar business rules belong to callers,
//! since the hardware tolerates any bounds. Every failure surfaces as the
//! generic `WriteFailed` category with the underlying error attached.
//!
//! SQLite is the store of record; after each successful write a retained
//! config snapshot is pushed to the device (best effort, logged).

use anyhow::anyhow;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{Db, ScheduleRule, ThresholdConfig};
use crate::error::{CoreError, CoreResult};
use crate::liveness::now_epoch_ms;
use crate::mqtt;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInput {
    pub start_time: String,
    pub days: String,
    pub duration_min: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdInput {
    pub soil_moisture_low: f64,
    pub soil_moisture_high: f64,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

pub async fn add_schedule(
    db: &Db,
    mqtt: &AsyncClient,
    device_id: &str,
    created_by: &str,
    input: ScheduleInput,
) -> CoreResult<ScheduleRule> {
    if input.start_time.trim().is_empty() {
        return Err(CoreError::WriteFailed(anyhow!("start_time is required")));
    }
    if input.days.trim().is_empty() {
        return Err(CoreError::WriteFailed(anyhow!("days is required")));
    }

    let rule = ScheduleRule {
        id: Uuid::new_v4().to_string(),
        device_id: device_id.to_string(),
        start_time: input.start_time,
        days: input.days,
        duration_min: input.duration_min,
        created_by: created_by.to_string(),
        created_at: now_epoch_ms(),
    };
    db.insert_schedule(&rule).await?;

    push_device_config(db, mqtt, device_id).await;
    Ok(rule)
}

/// Returns whether a rule was actually removed.
pub async fn remove_schedule(
    db: &Db,
    mqtt: &AsyncClient,
    device_id: &str,
    id: &str,
) -> CoreResult<bool> {
    let removed = db.delete_schedule(id, device_id).await? > 0;
    if removed {
        push_device_config(db, mqtt, device_id).await;
    }
    Ok(removed)
}

pub async fn list_schedules(db: &Db, device_id: &str) -> CoreResult<Vec<ScheduleRule>> {
    Ok(db.list_schedules(device_id).await?)
}

pub async fn set_thresholds(
    db: &Db,
    mqtt: &AsyncClient,
    device_id: &str,
    updated_by: &str,
    input: ThresholdInput,
) -> CoreResult<ThresholdConfig> {
    let config = ThresholdConfig {
        device_id: device_id.to_string(),
        soil_moisture_low: input.soil_moisture_low,
        soil_moisture_high: input.soil_moisture_high,
        updated_by: updated_by.to_string(),
        updated_at: now_epoch_ms(),
    };
    db.upsert_thresholds(&config).await?;

    push_device_config(db, mqtt, device_id).await;
    Ok(config)
}

pub async fn get_thresholds(db: &Db, device_id: &str) -> CoreResult<Option<ThresholdConfig>> {
    Ok(db.get_thresholds(device_id).await?)
}

// ---------------------------------------------------------------------------
// Device config push
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceConfigSnapshot {
    thresholds: Option<ThresholdConfig>,
    schedules: Vec<ScheduleRule>,
}

/// Publish the full config snapshot to the device's retained config topic.
/// Best effort: the database already holds the truth, and the next write
/// re-publishes the whole snapshot.
async fn push_device_config(db: &Db, mqtt: &AsyncClient, device_id: &str) {
    let snapshot = DeviceConfigSnapshot {
        thresholds: match db.get_thresholds(device_id).await {
            Ok(t) => t,
            Err(e) => {
                warn!(device = %device_id, "config push: thresholds read failed: {e}");
                return;
            }
        },
        schedules: match db.list_schedules(device_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(device = %device_id, "config push: schedules read failed: {e}");
                return;
            }
        },
    };

    let payload = match serde_json::to_vec(&snapshot) {
        Ok(p) => p,
        Err(e) => {
            warn!(device = %device_id, "config push: encode failed: {e}");
            return;
        }
    };

    match mqtt
        .publish(mqtt::config_topic(device_id), QoS::AtLeastOnce, true, payload)
        .await
    {
        Ok(()) => debug!(device = %device_id, "device config snapshot pushed"),
        Err(e) => warn!(device = %device_id, "config push failed: {e}"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
