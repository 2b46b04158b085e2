//! Station HTTP surface: listing, manual creation, claiming by pairing
//! code, and command dispatch over the broker.
//!
//! Stations are addressed by their hardware (mac) id on the wire; the
//! numeric row id only shows up in response bodies. Pairing state never
//! leaves the server: list and create responses carry id, name,
//! location and hardware address, nothing else.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::CurrentUser;
use crate::db::DbHandle;
use crate::error::AppError;
use crate::pairing;
use crate::repo::{Plant, Repository, Station};
use crate::state::AppState;

const FIELD_MAX_LEN: usize = 100;
const MAX_COMMAND_DURATION_SECS: i64 = 120;

#[derive(Debug, Serialize)]
pub struct StationOut {
    pub id: i64,
    pub name: String,
    pub location: Option<String>,
    pub mac_address: Option<String>,
}

impl From<Station> for StationOut {
    fn from(station: Station) -> Self {
        Self {
            id: station.id,
            name: station.name,
            location: station.location,
            mac_address: station.mac_address,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// List / create
// ═══════════════════════════════════════════════════════════════

pub async fn list_stations(
    user: CurrentUser,
    Extension(db): Extension<Arc<DbHandle>>,
) -> Result<Json<Vec<StationOut>>, AppError> {
    let repo = Repository::new(db);
    let stations = repo.list_stations_by_user(user.user_id).await?;
    Ok(Json(stations.into_iter().map(StationOut::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateStationIn {
    pub name: String,
    pub location: String,
}

pub async fn create_station(
    user: CurrentUser,
    Extension(db): Extension<Arc<DbHandle>>,
    Json(input): Json<CreateStationIn>,
) -> Result<(StatusCode, Json<StationOut>), AppError> {
    check_field("name", &input.name)?;
    check_field("location", &input.location)?;

    let repo = Repository::new(db);
    let id = repo
        .create_station(
            Some(user.user_id),
            &input.name,
            Some(&input.location),
            None,
            None,
            None,
        )
        .await?;
    tracing::info!(station_id = id, user_id = user.user_id, "station created");

    let out = StationOut {
        id,
        name: input.name,
        location: Some(input.location),
        mac_address: None,
    };
    Ok((StatusCode::CREATED, Json(out)))
}

fn check_field(field: &str, value: &str) -> Result<(), AppError> {
    if value.is_empty() || value.len() > FIELD_MAX_LEN {
        return Err(AppError::Validation(format!(
            "{field} must be 1..={FIELD_MAX_LEN} characters"
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
// Pairing claim
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct PairStationIn {
    pub pairing_code: String,
}

pub async fn pair_station(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Extension(db): Extension<Arc<DbHandle>>,
    Json(input): Json<PairStationIn>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    pairing::validate_claim_code(&input.pairing_code)?;
    tracing::info!(user_id = user.user_id, "pairing claim received");

    let repo = Repository::new(db);
    pairing::claim_station(
        &repo,
        state.broker.as_ref(),
        user.user_id,
        &input.pairing_code,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(json!({ "status": "paired" }))))
}

// ═══════════════════════════════════════════════════════════════
// Command dispatch
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    SendAllData,
    ExpressAnalysis,
    Watering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Start,
    Stop,
}

#[derive(Debug, Deserialize)]
pub struct SendCommandIn {
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub action: CommandAction,
    pub plant_id: i64,
    #[serde(default)]
    pub duration: Option<i64>,
}

/// The envelope a station receives on its own topic. The maintenance
/// thresholds ride along so the station can act without a follow-up
/// query.
fn command_envelope(input: &SendCommandIn, plant: &Plant) -> Value {
    let mut payload = json!({
        "type": "command",
        "activity": input.command_type,
        "action": input.action,
        "plant_id": input.plant_id,
    });
    if let Some(duration) = input.duration {
        payload["duration"] = json!(duration);
    }
    payload["data"] = json!({
        "max_soil_humidity": plant.max_soil_humidity,
        "min_soil_humidity": plant.min_soil_humidity,
        "ideal_soil_humidity_after_watering": plant.ideal_soil_humidity_after_watering,
    });
    payload
}

pub async fn send_command(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Extension(db): Extension<Arc<DbHandle>>,
    Path(station_id): Path<String>,
    Json(input): Json<SendCommandIn>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if let Some(duration) = input.duration {
        if duration > MAX_COMMAND_DURATION_SECS {
            return Err(AppError::Validation(format!(
                "duration must not exceed {MAX_COMMAND_DURATION_SECS}"
            )));
        }
    }

    let repo = Repository::new(db);

    // A station someone else owns reads as absent.
    let station = repo
        .get_station_by_mac(&station_id)
        .await?
        .filter(|s| s.user_id == Some(user.user_id))
        .ok_or_else(|| AppError::NotFound(format!("station {station_id} not found")))?;

    let plant = repo
        .get_plant_by_id(input.plant_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("plant {} not found", input.plant_id)))?;
    if plant.user_id != user.user_id {
        return Err(AppError::IllegalArgument(format!(
            "plant {} does not belong to the caller",
            input.plant_id
        )));
    }

    let broker = state.broker.as_ref().ok_or(AppError::BrokerUnavailable)?;
    broker.publish_json(
        &format!("stations/{station_id}"),
        &command_envelope(&input, &plant),
    )?;
    tracing::info!(
        station_id = station.id,
        plant_id = plant.id,
        command = ?input.command_type,
        "command dispatched"
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Command sent successfully" })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plant() -> Plant {
        Plant {
            id: 3,
            user_id: 1,
            name: "Basilic".into(),
            min_soil_humidity: Some(35.0),
            max_soil_humidity: Some(70.0),
            ideal_soil_humidity_after_watering: Some(55.0),
        }
    }

    #[test]
    fn command_types_use_wire_names() {
        let parsed: CommandType = serde_json::from_str("\"send_all_data\"").unwrap();
        assert_eq!(parsed, CommandType::SendAllData);
        assert_eq!(
            serde_json::to_string(&CommandType::ExpressAnalysis).unwrap(),
            "\"express_analysis\""
        );
        assert!(serde_json::from_str::<CommandType>("\"reboot\"").is_err());
    }

    #[test]
    fn envelope_carries_thresholds_and_omits_absent_duration() {
        let input = SendCommandIn {
            command_type: CommandType::Watering,
            action: CommandAction::Start,
            plant_id: 3,
            duration: None,
        };
        let envelope = command_envelope(&input, &plant());

        assert_eq!(envelope["type"], "command");
        assert_eq!(envelope["activity"], "watering");
        assert_eq!(envelope["action"], "start");
        assert_eq!(envelope["plant_id"], 3);
        assert!(envelope.get("duration").is_none());
        assert_eq!(envelope["data"]["max_soil_humidity"], 70.0);
        assert_eq!(envelope["data"]["min_soil_humidity"], 35.0);
        assert_eq!(envelope["data"]["ideal_soil_humidity_after_watering"], 55.0);
    }

    #[test]
    fn envelope_includes_duration_when_present() {
        let input = SendCommandIn {
            command_type: CommandType::ExpressAnalysis,
            action: CommandAction::Start,
            plant_id: 3,
            duration: Some(60),
        };
        let envelope = command_envelope(&input, &plant());
        assert_eq!(envelope["duration"], 60);
    }

    #[test]
    fn station_fields_are_length_bounded() {
        assert!(check_field("name", "Aurore").is_ok());
        assert!(matches!(
            check_field("name", ""),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            check_field("location", &"x".repeat(101)),
            Err(AppError::Validation(_))
        ));
    }
}
