//! Postgres query layer for sproutd.
//!
//! All SQL lives here, behind a `Repository` bound to one scoped handle
//! for the duration of one unit of work. Queries are runtime-checked
//! (no live DB needed at compile time).

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::DbHandle;
use crate::error::AppError;

// ═══════════════════════════════════════════════════════════════
// Entity rows
// ═══════════════════════════════════════════════════════════════

/// Row from the station table. `mac_address` is null for stations
/// created by hand before first pairing contact; `user_id` is null
/// until a user claims the station.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Station {
    pub id: i64,
    pub user_id: Option<i64>,
    pub name: String,
    pub location: Option<String>,
    pub mac_address: Option<String>,
    pub pairing_code: Option<String>,
    pub pairing_timeout: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct RefreshToken {
    pub id: i64,
    pub user_id: i64,
    pub email: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

/// Maintenance profile for one plant — narrowed to the columns command
/// dispatch and the report handlers touch.
#[derive(Debug, sqlx::FromRow)]
pub struct Plant {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub min_soil_humidity: Option<f64>,
    pub max_soil_humidity: Option<f64>,
    pub ideal_soil_humidity_after_watering: Option<f64>,
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct ExpressReport {
    pub id: i64,
    pub plant_id: i64,
    pub analysis_type: String,
    pub soil_humidity_mean: Option<f64>,
    pub lumens_mean: Option<f64>,
    pub air_humidity_mean: Option<f64>,
    pub temperature_mean: Option<f64>,
    pub soil_humidity_data: Option<String>,
    pub lumens_data: Option<String>,
    pub air_humidity_data: Option<String>,
    pub temperature_data: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct WateringReport {
    pub id: i64,
    pub plant_id: i64,
    pub soil_humidity_mean: f64,
    pub sigma3: f64,
    pub target_humidity: f64,
    pub soil_humidity_data: Option<String>,
    pub pump_data: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════
// Repository
// ═══════════════════════════════════════════════════════════════

pub struct Repository {
    db: Arc<DbHandle>,
}

impl Repository {
    pub fn new(db: Arc<DbHandle>) -> Self {
        Self { db }
    }

    // ── Stations ────────────────────────────────────────────

    pub async fn list_stations_by_user(&self, user_id: i64) -> Result<Vec<Station>, AppError> {
        self.db
            .fetch_all(
                sqlx::query_as::<_, Station>(
                    "SELECT id, user_id, name, location, mac_address, pairing_code, \
                     pairing_timeout, created_at \
                     FROM station WHERE user_id = $1 ORDER BY id",
                )
                .bind(user_id),
            )
            .await
    }

    pub async fn get_station_by_mac(&self, mac: &str) -> Result<Option<Station>, AppError> {
        self.db
            .fetch_optional(
                sqlx::query_as::<_, Station>(
                    "SELECT id, user_id, name, location, mac_address, pairing_code, \
                     pairing_timeout, created_at \
                     FROM station WHERE mac_address = $1",
                )
                .bind(mac),
            )
            .await
    }

    pub async fn get_station_by_pairing_code(
        &self,
        code: &str,
    ) -> Result<Option<Station>, AppError> {
        self.db
            .fetch_optional(
                sqlx::query_as::<_, Station>(
                    "SELECT id, user_id, name, location, mac_address, pairing_code, \
                     pairing_timeout, created_at \
                     FROM station WHERE pairing_code = $1",
                )
                .bind(code),
            )
            .await
    }

    /// Returns the new station id.
    pub async fn create_station(
        &self,
        user_id: Option<i64>,
        name: &str,
        location: Option<&str>,
        mac_address: Option<&str>,
        pairing_code: Option<&str>,
        pairing_timeout: Option<DateTime<Utc>>,
    ) -> Result<i64, AppError> {
        self.db
            .fetch_scalar(
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO station \
                     (user_id, name, location, mac_address, pairing_code, pairing_timeout) \
                     VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                )
                .bind(user_id)
                .bind(name)
                .bind(location)
                .bind(mac_address)
                .bind(pairing_code)
                .bind(pairing_timeout),
            )
            .await
    }

    /// Overwrite a station's pairing code and window.
    pub async fn set_pairing_code(
        &self,
        station_id: i64,
        code: &str,
        timeout: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let affected = self
            .db
            .execute(
                sqlx::query(
                    "UPDATE station SET pairing_code = $2, pairing_timeout = $3 WHERE id = $1",
                )
                .bind(station_id)
                .bind(code)
                .bind(timeout),
            )
            .await?;
        Ok(affected > 0)
    }

    /// Conditional claim: assigns the owner and clears the code/window
    /// only while the code still matches, so concurrent claims can't
    /// both win. Returns the affected-row count for the caller to judge.
    pub async fn claim_station(
        &self,
        station_id: i64,
        code: &str,
        user_id: i64,
    ) -> Result<u64, AppError> {
        self.db
            .execute(
                sqlx::query(
                    "UPDATE station \
                     SET user_id = $1, pairing_code = NULL, pairing_timeout = NULL \
                     WHERE id = $2 AND pairing_code = $3",
                )
                .bind(user_id)
                .bind(station_id)
                .bind(code),
            )
            .await
    }

    /// A user owns at most one station; drop the rest after a claim.
    pub async fn delete_other_user_stations(
        &self,
        user_id: i64,
        keep_station_id: i64,
    ) -> Result<u64, AppError> {
        self.db
            .execute(
                sqlx::query("DELETE FROM station WHERE user_id = $1 AND id != $2")
                    .bind(user_id)
                    .bind(keep_station_id),
            )
            .await
    }

    // ── Plants ──────────────────────────────────────────────

    pub async fn get_plant_by_id(&self, id: i64) -> Result<Option<Plant>, AppError> {
        self.db
            .fetch_optional(
                sqlx::query_as::<_, Plant>(
                    "SELECT id, user_id, name, min_soil_humidity, max_soil_humidity, \
                     ideal_soil_humidity_after_watering \
                     FROM plant WHERE id = $1",
                )
                .bind(id),
            )
            .await
    }

    // ── Reports ─────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_express_report(
        &self,
        plant_id: i64,
        soil_humidity_mean: Option<f64>,
        temperature_mean: Option<f64>,
        air_humidity_mean: Option<f64>,
        lumens_mean: Option<f64>,
        soil_humidity_data: Option<&str>,
        temperature_data: Option<&str>,
        air_humidity_data: Option<&str>,
        lumens_data: Option<&str>,
    ) -> Result<i64, AppError> {
        self.db
            .fetch_scalar(
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO express_analysis_report \
                     (plant_id, analysis_type, soil_humidity_mean, lumens_mean, \
                      air_humidity_mean, temperature_mean, soil_humidity_data, lumens_data, \
                      air_humidity_data, temperature_data) \
                     VALUES ($1, 'express', $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
                )
                .bind(plant_id)
                .bind(soil_humidity_mean)
                .bind(lumens_mean)
                .bind(air_humidity_mean)
                .bind(temperature_mean)
                .bind(soil_humidity_data)
                .bind(lumens_data)
                .bind(air_humidity_data)
                .bind(temperature_data),
            )
            .await
    }

    /// Ownership enforced through the plant join.
    pub async fn get_express_report(
        &self,
        report_id: i64,
        user_id: i64,
    ) -> Result<Option<ExpressReport>, AppError> {
        self.db
            .fetch_optional(
                sqlx::query_as::<_, ExpressReport>(
                    "SELECT r.id, r.plant_id, r.analysis_type, r.soil_humidity_mean, \
                     r.lumens_mean, r.air_humidity_mean, r.temperature_mean, \
                     r.soil_humidity_data, r.lumens_data, r.air_humidity_data, \
                     r.temperature_data, r.created_at \
                     FROM express_analysis_report r \
                     JOIN plant p ON r.plant_id = p.id \
                     WHERE r.id = $1 AND p.user_id = $2",
                )
                .bind(report_id)
                .bind(user_id),
            )
            .await
    }

    pub async fn create_watering_report(
        &self,
        plant_id: i64,
        soil_humidity_mean: f64,
        sigma3: f64,
        target_humidity: f64,
        soil_humidity_data: Option<&str>,
        pump_data: Option<&str>,
    ) -> Result<i64, AppError> {
        self.db
            .fetch_scalar(
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO watering_report \
                     (plant_id, soil_humidity_mean, sigma3, target_humidity, \
                      soil_humidity_data, pump_data) \
                     VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                )
                .bind(plant_id)
                .bind(soil_humidity_mean)
                .bind(sigma3)
                .bind(target_humidity)
                .bind(soil_humidity_data)
                .bind(pump_data),
            )
            .await
    }

    pub async fn get_watering_report(
        &self,
        report_id: i64,
        user_id: i64,
    ) -> Result<Option<WateringReport>, AppError> {
        self.db
            .fetch_optional(
                sqlx::query_as::<_, WateringReport>(
                    "SELECT r.id, r.plant_id, r.soil_humidity_mean, r.sigma3, \
                     r.target_humidity, r.soil_humidity_data, r.pump_data, r.created_at \
                     FROM watering_report r \
                     JOIN plant p ON r.plant_id = p.id \
                     WHERE r.id = $1 AND p.user_id = $2",
                )
                .bind(report_id)
                .bind(user_id),
            )
            .await
    }

    // ── Refresh tokens ──────────────────────────────────────

    pub async fn create_refresh_token(
        &self,
        user_id: i64,
        email: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        self.db
            .fetch_scalar(
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO refresh_tokens (user_id, email, expires_at, revoked) \
                     VALUES ($1, $2, $3, FALSE) RETURNING id",
                )
                .bind(user_id)
                .bind(email)
                .bind(expires_at),
            )
            .await
    }

    pub async fn get_refresh_token(&self, id: i64) -> Result<Option<RefreshToken>, AppError> {
        self.db
            .fetch_optional(
                sqlx::query_as::<_, RefreshToken>(
                    "SELECT id, user_id, email, expires_at, revoked \
                     FROM refresh_tokens WHERE id = $1",
                )
                .bind(id),
            )
            .await
    }

    pub async fn delete_refresh_token(&self, id: i64) -> Result<bool, AppError> {
        let affected = self
            .db
            .execute(sqlx::query("DELETE FROM refresh_tokens WHERE id = $1").bind(id))
            .await?;
        Ok(affected > 0)
    }

    /// Rotation: the old record dies, a fresh one is born. Runs inside
    /// the caller's request transaction.
    pub async fn rotate_refresh_token(
        &self,
        old_id: i64,
        user_id: i64,
        email: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        self.delete_refresh_token(old_id).await?;
        self.create_refresh_token(user_id, email, expires_at).await
    }
}
