use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Plant {
    pub id: String,
    pub friendly_name: String,
    pub thingy_id: String,
    pub locality: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub max_power: Option<f64>,
    pub nr_panels: Option<i64>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ThingyRow {
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Maintenance status plus its full start/end history, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaintenanceRecord {
    pub thingy_id: String,
    pub maintenance_status: bool,
    pub maintenance_start: Vec<i64>,
    pub maintenance_end: Vec<i64>,
    pub updated_at: i64,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/thingy/thingy.db"
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
    // Thingy registry
    // ----------------------------

    /// Records an observation of `name` at `now`. Returns `true` on first
    /// contact. Every observed thingy also gets a maintenance row.
    pub async fn register_thingy(&self, name: &str, now: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("register_thingy: begin failed")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO thingies (name, created_at, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("register_thingy: insert failed")?
        .rows_affected()
            == 1;

        if !inserted {
            sqlx::query("UPDATE thingies SET updated_at = ? WHERE name = ?")
                .bind(now)
                .bind(name)
                .execute(&mut *tx)
                .await
                .context("register_thingy: update failed")?;
        }

        sqlx::query(
            r#"
            INSERT INTO maintenance (thingy_id, maintenance_status, updated_at)
            VALUES (?, 0, ?)
            ON CONFLICT(thingy_id) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("register_thingy: maintenance row failed")?;

        tx.commit().await.context("register_thingy: commit failed")?;
        Ok(inserted)
    }

    pub async fn list_thingies(&self) -> Result<Vec<ThingyRow>> {
        sqlx::query_as::<_, ThingyRow>(
            "SELECT name, created_at, updated_at FROM thingies ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .context("list_thingies failed")
    }

    // ----------------------------
    // Maintenance
    // ----------------------------

    pub async fn maintenance_status(&self, thingy_id: &str) -> Result<Option<bool>> {
        let status: Option<i64> =
            sqlx::query_scalar("SELECT maintenance_status FROM maintenance WHERE thingy_id = ?")
                .bind(thingy_id)
                .fetch_optional(&self.pool)
                .await
                .context("maintenance_status failed")?;
        Ok(status.map(|s| s != 0))
    }

    /// Flips the maintenance status of `thingy_id` and appends the matching
    /// start/end event. Returns the new status.
    pub async fn toggle_maintenance(&self, thingy_id: &str, now: i64) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("toggle_maintenance: begin failed")?;

        sqlx::query(
            r#"
            INSERT INTO maintenance (thingy_id, maintenance_status, updated_at)
            VALUES (?, 0, ?)
            ON CONFLICT(thingy_id) DO NOTHING
            "#,
        )
        .bind(thingy_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("toggle_maintenance: ensure row failed")?;

        let current: i64 =
            sqlx::query_scalar("SELECT maintenance_status FROM maintenance WHERE thingy_id = ?")
                .bind(thingy_id)
                .fetch_one(&mut *tx)
                .await
                .context("toggle_maintenance: read failed")?;
        let next = current == 0;

        sqlx::query(
            "UPDATE maintenance SET maintenance_status = ?, updated_at = ? WHERE thingy_id = ?",
        )
        .bind(next)
        .bind(now)
        .bind(thingy_id)
        .execute(&mut *tx)
        .await
        .context("toggle_maintenance: update failed")?;

        sqlx::query("INSERT INTO maintenance_events (thingy_id, kind, ts) VALUES (?, ?, ?)")
            .bind(thingy_id)
            .bind(if next { "start" } else { "end" })
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("toggle_maintenance: history insert failed")?;

        tx.commit().await.context("toggle_maintenance: commit failed")?;
        Ok(next)
    }

    /// Ends maintenance for every thingy currently in maintenance. Rows that
    /// are already out of maintenance are untouched, so repeated calls do not
    /// grow the history. Returns the ids that were reset.
    pub async fn reset_maintenance(&self, now: i64) -> Result<Vec<String>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("reset_maintenance: begin failed")?;

        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT thingy_id FROM maintenance WHERE maintenance_status = 1 ORDER BY thingy_id",
        )
        .fetch_all(&mut *tx)
        .await
        .context("reset_maintenance: select failed")?;

        for id in &ids {
            sqlx::query("INSERT INTO maintenance_events (thingy_id, kind, ts) VALUES (?, 'end', ?)")
                .bind(id)
                .bind(now)
                .execute(&mut *tx)
                .await
                .context("reset_maintenance: history insert failed")?;
        }

        sqlx::query(
            r#"
            UPDATE maintenance
            SET maintenance_status = 0, updated_at = ?
            WHERE maintenance_status = 1
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("reset_maintenance: update failed")?;

        tx.commit().await.context("reset_maintenance: commit failed")?;
        Ok(ids)
    }

    pub async fn maintenance_history(&self, thingy_id: &str) -> Result<Option<MaintenanceRecord>> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT maintenance_status, updated_at FROM maintenance WHERE thingy_id = ?",
        )
        .bind(thingy_id)
        .fetch_optional(&self.pool)
        .await
        .context("maintenance_history: status read failed")?;

        let Some((status, updated_at)) = row else {
            return Ok(None);
        };

        let events: Vec<(String, i64)> = sqlx::query_as(
            "SELECT kind, ts FROM maintenance_events WHERE thingy_id = ? ORDER BY id",
        )
        .bind(thingy_id)
        .fetch_all(&self.pool)
        .await
        .context("maintenance_history: events read failed")?;

        let mut record = MaintenanceRecord {
            thingy_id: thingy_id.to_string(),
            maintenance_status: status != 0,
            maintenance_start: Vec::new(),
            maintenance_end: Vec::new(),
            updated_at,
        };
        for (kind, ts) in events {
            match kind.as_str() {
                "start" => record.maintenance_start.push(ts),
                _ => record.maintenance_end.push(ts),
            }
        }
        Ok(Some(record))
    }

    // ----------------------------
    // Plants
    // ----------------------------

    pub async fn upsert_plant(&self, p: &Plant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plants (
              id, friendly_name, thingy_id, locality,
              lat, lng, max_power, nr_panels
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              friendly_name=excluded.friendly_name,
              thingy_id=excluded.thingy_id,
              locality=excluded.locality,
              lat=excluded.lat,
              lng=excluded.lng,
              max_power=excluded.max_power,
              nr_panels=excluded.nr_panels
            "#,
        )
        .bind(&p.id)
        .bind(&p.friendly_name)
        .bind(&p.thingy_id)
        .bind(&p.locality)
        .bind(p.lat)
        .bind(p.lng)
        .bind(p.max_power)
        .bind(p.nr_panels)
        .execute(&self.pool)
        .await
        .context("upsert_plant failed")?;
        Ok(())
    }

    pub async fn load_plants(&self) -> Result<Vec<Plant>> {
        sqlx::query_as::<_, Plant>(
            r#"
            SELECT id, friendly_name, thingy_id, locality,
                   lat, lng, max_power, nr_panels
            FROM plants
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_plants failed")
    }

    pub async fn get_plant(&self, plant_id: &str) -> Result<Option<Plant>> {
        sqlx::query_as::<_, Plant>(
            r#"
            SELECT id, friendly_name, thingy_id, locality,
                   lat, lng, max_power, nr_panels
            FROM plants
            WHERE id = ?
            "#,
        )
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_plant failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
