//! Analysis reports.
//!
//! Stations push raw sample series over the broker; the listener
//! dispatches them here. Express analysis is a short sweep (up to 60
//! samples per channel) whose means we compute server-side; a watering
//! report is the station's own summary of a watering run (up to 600
//! samples), stored as given. Series are kept verbatim as compact JSON
//! text, nulls included, so the frontend can redraw exactly what the
//! station saw.

use std::sync::Arc;

use axum::extract::Path;
use axum::{Extension, Json};

use crate::auth::CurrentUser;
use crate::db::DbHandle;
use crate::error::AppError;
use crate::repo::{ExpressReport, Repository, WateringReport};

const EXPRESS_MAX_SAMPLES: usize = 60;
const WATERING_MAX_SAMPLES: usize = 600;

/// Broker payload for `(command, express_analysis, compute_report)`.
/// Entries are nullable; a dropped sample stays in the series as null.
#[derive(Debug, serde::Deserialize)]
pub struct ExpressAnalysisPayload {
    pub plant_id: i64,
    pub humidity: Vec<Option<f64>>,
    pub temperature: Vec<Option<f64>>,
    pub air_humidity: Vec<Option<f64>>,
}

/// Broker payload for `(command, watering, compute_report)`. The station
/// computes its own mean and spread; we only bound-check and store.
#[derive(Debug, serde::Deserialize)]
pub struct WateringReportPayload {
    pub plant_id: i64,
    pub humidity: Vec<Option<f64>>,
    pub pump: Vec<Option<f64>>,
    pub sigma3: f64,
    pub mean: f64,
    pub target_humidity: f64,
}

// ═══════════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════════

fn check_series(
    field: &str,
    values: &[Option<f64>],
    max_len: usize,
    min: f64,
    max: f64,
) -> Result<(), AppError> {
    check_len(field, values, max_len)?;
    for value in values.iter().flatten() {
        if !(min..=max).contains(value) {
            return Err(AppError::Validation(format!(
                "{field} sample {value} outside {min}..={max}"
            )));
        }
    }
    Ok(())
}

fn check_len(field: &str, values: &[Option<f64>], max_len: usize) -> Result<(), AppError> {
    if values.len() > max_len {
        return Err(AppError::Validation(format!(
            "{field} holds more than {max_len} samples"
        )));
    }
    Ok(())
}

fn check_percent(field: &str, value: f64) -> Result<(), AppError> {
    if !(0.0..=100.0).contains(&value) {
        return Err(AppError::Validation(format!(
            "{field} {value} outside 0..=100"
        )));
    }
    Ok(())
}

fn validate_express(payload: &ExpressAnalysisPayload) -> Result<(), AppError> {
    if payload.plant_id < 0 {
        return Err(AppError::Validation("plant_id must be non-negative".into()));
    }
    check_series("humidity", &payload.humidity, EXPRESS_MAX_SAMPLES, 0.0, 100.0)?;
    check_series(
        "temperature",
        &payload.temperature,
        EXPRESS_MAX_SAMPLES,
        -100.0,
        200.0,
    )?;
    // Air humidity arrives from an uncalibrated sensor; length-bounded only.
    check_len("air_humidity", &payload.air_humidity, EXPRESS_MAX_SAMPLES)
}

fn validate_watering(payload: &WateringReportPayload) -> Result<(), AppError> {
    if payload.plant_id < 0 {
        return Err(AppError::Validation("plant_id must be non-negative".into()));
    }
    check_series("humidity", &payload.humidity, WATERING_MAX_SAMPLES, 0.0, 100.0)?;
    check_series("pump", &payload.pump, WATERING_MAX_SAMPLES, 0.0, 100.0)?;
    check_percent("sigma3", payload.sigma3)?;
    check_percent("mean", payload.mean)?;
    check_percent("target_humidity", payload.target_humidity)
}

/// Mean over the present samples; `None` when every sample is null.
fn mean_of(values: &[Option<f64>]) -> Option<f64> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    }
}

// ═══════════════════════════════════════════════════════════════
// Broker-driven creation
// ═══════════════════════════════════════════════════════════════

/// Compute and store an express report. Returns the new report id.
/// No lumens sensor ships yet; its mean and series are recorded null.
pub async fn create_express_report(
    repo: &Repository,
    payload: &ExpressAnalysisPayload,
) -> Result<i64, AppError> {
    validate_express(payload)?;

    let soil_mean = mean_of(&payload.humidity);
    let temp_mean = mean_of(&payload.temperature);
    let air_mean = mean_of(&payload.air_humidity);

    let soil_json = serde_json::to_string(&payload.humidity)?;
    let temp_json = serde_json::to_string(&payload.temperature)?;
    let air_json = serde_json::to_string(&payload.air_humidity)?;

    repo.create_express_report(
        payload.plant_id,
        soil_mean,
        temp_mean,
        air_mean,
        None,
        Some(&soil_json),
        Some(&temp_json),
        Some(&air_json),
        None,
    )
    .await
}

/// Store a watering report as reported by the station.
pub async fn create_watering_report(
    repo: &Repository,
    payload: &WateringReportPayload,
) -> Result<i64, AppError> {
    validate_watering(payload)?;

    let soil_json = serde_json::to_string(&payload.humidity)?;
    let pump_json = serde_json::to_string(&payload.pump)?;

    repo.create_watering_report(
        payload.plant_id,
        payload.mean,
        payload.sigma3,
        payload.target_humidity,
        Some(&soil_json),
        Some(&pump_json),
    )
    .await
}

// ═══════════════════════════════════════════════════════════════
// HTTP retrieval
// ═══════════════════════════════════════════════════════════════

pub async fn get_express_report(
    user: CurrentUser,
    Extension(db): Extension<Arc<DbHandle>>,
    Path(report_id): Path<i64>,
) -> Result<Json<ExpressReport>, AppError> {
    let repo = Repository::new(db);
    let report = repo
        .get_express_report(report_id, user.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("report {report_id} not found")))?;
    Ok(Json(report))
}

pub async fn get_watering_report(
    user: CurrentUser,
    Extension(db): Extension<Arc<DbHandle>>,
    Path(report_id): Path<i64>,
) -> Result<Json<WateringReport>, AppError> {
    let repo = Repository::new(db);
    let report = repo
        .get_watering_report(report_id, user.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("report {report_id} not found")))?;
    Ok(Json(report))
}
