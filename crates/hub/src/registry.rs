//! Device assignment registry: which devices the signed-in principal holds,
//! the hard cap on concurrent assignments, and the persisted active-device
//! pointer. Assignment rows themselves are created by an upstream approval
//! workflow; this layer only reads them.

use serde::Serialize;
use sqlx::FromRow;

use crate::db::{AssignmentRecord, Db};
use crate::liveness::now_epoch_ms;

/// Hard cap on concurrently assigned devices per user.
pub const MAX_ASSIGNED_DEVICES: usize = 3;

/// Statuses that count as "effectively assigned".
pub const ASSIGNED_STATUSES: &[&str] = &["active", "approved"];

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

/// Lightweight device summary the dashboard lists.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_id: String,
    pub farm_name: String,
    pub location: String,
    pub crop_type: String,
    /// Epoch milliseconds, server-generated and effectively unique.
    pub assigned_at: i64,
}

/// Per-user pointer to the currently selected device.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSelection {
    pub device_id: String,
    pub last_switched_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub current: usize,
    pub max: usize,
    pub available: usize,
    pub percentage: u8,
}

/// Result of reconciling the stored selection against a fresh assignment
/// list. `fell_back` marks a transparent re-selection, not a user action.
#[derive(Debug)]
pub struct RegistryView {
    pub devices: Vec<DeviceSummary>,
    pub active: Option<ActiveSelection>,
    pub fell_back: bool,
}

// ---------------------------------------------------------------------------
// Pure projections
// ---------------------------------------------------------------------------

pub fn can_request_more_devices(assigned_count: usize) -> bool {
    assigned_count < MAX_ASSIGNED_DEVICES
}

pub fn usage_summary(assigned_count: usize) -> UsageSummary {
    let available = MAX_ASSIGNED_DEVICES.saturating_sub(assigned_count);
    let percentage =
        ((assigned_count as f64 / MAX_ASSIGNED_DEVICES as f64) * 100.0).round() as u8;
    UsageSummary {
        current: assigned_count,
        max: MAX_ASSIGNED_DEVICES,
        available,
        percentage,
    }
}

pub fn summarize(rows: Vec<AssignmentRecord>) -> Vec<DeviceSummary> {
    rows.into_iter()
        .map(|r| DeviceSummary {
            device_id: r.device_id,
            farm_name: r.farm_name,
            location: r.location,
            crop_type: r.crop_type,
            assigned_at: r.assigned_at,
        })
        .collect()
}

/// Pick the device that should be active. `devices` is newest-assigned
/// first. Returns `(device_id, fallback)`: fallback means the stored
/// selection was absent or no longer assigned and the newest device was
/// chosen instead.
pub fn resolve_active(
    devices: &[DeviceSummary],
    stored: Option<&str>,
) -> Option<(String, bool)> {
    if let Some(id) = stored {
        if devices.iter().any(|d| d.device_id == id) {
            return Some((id.to_string(), false));
        }
    }
    devices.first().map(|d| (d.device_id.clone(), true))
}

// ---------------------------------------------------------------------------
// Store-backed operations
// ---------------------------------------------------------------------------

/// Load the principal's assignments and reconcile the active selection,
/// persisting a fallback re-selection when the stored device is gone.
pub async fn refresh(db: &Db, user_id: &str) -> anyhow::Result<RegistryView> {
    let devices = summarize(db.load_assignments(user_id, ASSIGNED_STATUSES).await?);
    let stored = db.get_active(user_id).await?;

    match resolve_active(&devices, stored.as_ref().map(|a| a.device_id.as_str())) {
        Some((_, false)) => Ok(RegistryView {
            devices,
            active: stored,
            fell_back: false,
        }),
        Some((device_id, true)) => {
            let ts = now_epoch_ms();
            db.set_active(user_id, &device_id, ts).await?;
            Ok(RegistryView {
                devices,
                active: Some(ActiveSelection {
                    device_id,
                    last_switched_at: ts,
                }),
                fell_back: true,
            })
        }
        None => Ok(RegistryView {
            devices,
            active: None,
            fell_back: stored.is_some(),
        }),
    }
}

/// Persist an explicit user switch. The target is deliberately NOT checked
/// against the assignment set here: the caller has the exposed list, and a
/// read-before-write would race a concurrent reassignment.
pub async fn switch_active(
    db: &Db,
    user_id: &str,
    device_id: &str,
) -> anyhow::Result<ActiveSelection> {
    let ts = now_epoch_ms();
    db.set_active(user_id, device_id, ts).await?;
    Ok(ActiveSelection {
        device_id: device_id.to_string(),
        last_switched_at: ts,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
