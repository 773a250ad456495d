use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;

use crate::registry::ActiveSelection;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One user-to-device binding, as seeded from config. Created by the
/// upstream request/approval workflow; read-only to the dashboard core
/// beyond seeding.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssignmentRecord {
    pub device_id: String,
    pub user_id: String,
    pub status: String,
    pub farm_name: String,
    pub location: String,
    pub crop_type: String,
    pub soil_type: String,
    /// Epoch milliseconds.
    pub assigned_at: i64,
}

/// A recurring irrigation rule for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRule {
    pub id: String,
    pub device_id: String,
    /// "HH:MM", 24-hour.
    pub start_time: String,
    /// Comma-separated weekday names, or "daily".
    pub days: String,
    pub duration_min: i64,
    pub created_by: String,
    pub created_at: i64,
}

/// Automatic-mode moisture bounds for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdConfig {
    pub device_id: String,
    pub soil_moisture_low: f64,
    pub soil_moisture_high: f64,
    pub updated_by: String,
    pub updated_at: i64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/farmdash/farmdash.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Assignments
    // ----------------------------

    pub async fn upsert_assignment(&self, a: &AssignmentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assignments (
              device_id, user_id, status,
              farm_name, location, crop_type, soil_type,
              assigned_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              user_id=excluded.user_id,
              status=excluded.status,
              farm_name=excluded.farm_name,
              location=excluded.location,
              crop_type=excluded.crop_type,
              soil_type=excluded.soil_type,
              assigned_at=excluded.assigned_at
            "#,
        )
        .bind(&a.device_id)
        .bind(&a.user_id)
        .bind(&a.status)
        .bind(&a.farm_name)
        .bind(&a.location)
        .bind(&a.crop_type)
        .bind(&a.soil_type)
        .bind(a.assigned_at)
        .execute(&self.pool)
        .await
        .context("upsert_assignment failed")?;
        Ok(())
    }

    /// Change one assignment's status (seed/reassignment support).
    pub async fn set_assignment_status(&self, device_id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE assignments SET status = ? WHERE device_id = ?")
            .bind(status)
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("set_assignment_status failed")?;
        Ok(())
    }

    /// Load a user's assignments restricted to `statuses`, newest first.
    /// Rowid breaks ties on equal timestamps (insertion order).
    pub async fn load_assignments(
        &self,
        user_id: &str,
        statuses: &[&str],
    ) -> Result<Vec<AssignmentRecord>> {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            r#"
            SELECT device_id, user_id, status,
                   farm_name, location, crop_type, soil_type,
                   assigned_at
            FROM assignments
            WHERE user_id = ? AND status IN ({placeholders})
            ORDER BY assigned_at DESC, rowid ASC
            "#
        );

        let mut query = sqlx::query_as::<_, AssignmentRecord>(&sql).bind(user_id);
        for status in statuses {
            query = query.bind(*status);
        }

        query
            .fetch_all(&self.pool)
            .await
            .context("load_assignments failed")
    }

    // ----------------------------
    // Active device selection
    // ----------------------------

    pub async fn get_active(&self, user_id: &str) -> Result<Option<ActiveSelection>> {
        sqlx::query_as::<_, ActiveSelection>(
            "SELECT device_id, last_switched_at FROM active_device WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_active failed")
    }

    pub async fn set_active(&self, user_id: &str, device_id: &str, ts: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO active_device (user_id, device_id, last_switched_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
              device_id=excluded.device_id,
              last_switched_at=excluded.last_switched_at
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("set_active failed")?;
        Ok(())
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn insert_schedule(&self, s: &ScheduleRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, device_id, start_time, days, duration_min, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&s.id)
        .bind(&s.device_id)
        .bind(&s.start_time)
        .bind(&s.days)
        .bind(s.duration_min)
        .bind(&s.created_by)
        .bind(s.created_at)
        .execute(&self.pool)
        .await
        .context("insert_schedule failed")?;
        Ok(())
    }

    /// Returns the number of rows removed (0 when the id is unknown or
    /// belongs to another device).
    pub async fn delete_schedule(&self, id: &str, device_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ? AND device_id = ?")
            .bind(id)
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("delete_schedule failed")?;
        Ok(result.rows_affected())
    }

    pub async fn list_schedules(&self, device_id: &str) -> Result<Vec<ScheduleRule>> {
        sqlx::query_as::<_, ScheduleRule>(
            r#"
            SELECT id, device_id, start_time, days, duration_min, created_by, created_at
            FROM schedules
            WHERE device_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("list_schedules failed")
    }

    // ----------------------------
    // Thresholds
    // ----------------------------

    pub async fn upsert_thresholds(&self, t: &ThresholdConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO thresholds (device_id, soil_moisture_low, soil_moisture_high, updated_by, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              soil_moisture_low=excluded.soil_moisture_low,
              soil_moisture_high=excluded.soil_moisture_high,
              updated_by=excluded.updated_by,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(&t.device_id)
        .bind(t.soil_moisture_low)
        .bind(t.soil_moisture_high)
        .bind(&t.updated_by)
        .bind(t.updated_at)
        .execute(&self.pool)
        .await
        .context("upsert_thresholds failed")?;
        Ok(())
    }

    pub async fn get_thresholds(&self, device_id: &str) -> Result<Option<ThresholdConfig>> {
        sqlx::query_as::<_, ThresholdConfig>(
            r#"
            SELECT device_id, soil_moisture_low, soil_moisture_high, updated_by, updated_at
            FROM thresholds
            WHERE device_id = ?
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_thresholds failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
