//! Station pairing.
//!
//! A station announces itself over the broker with a short-lived code;
//! a signed-in user types that code into the app and claims the station
//! over HTTP. Station rows spring into existence on first contact, so
//! claiming works even for hardware nobody registered by hand.
//!
//! Code issue runs on the broker thread (errors logged, never fatal);
//! the claim runs inside an authenticated request transaction.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::broker::BrokerClient;
use crate::error::AppError;
use crate::repo::Repository;

/// How long an issued code stays claimable.
pub const PAIRING_WINDOW_SECS: i64 = 120;

const CODE_MAX_LEN: usize = 12;
const HARDWARE_ID_MAX_LEN: usize = 64;

/// Broker payload for `(command, pair_user, register_code)`. The
/// listener injects `station_id` from the topic when the firmware
/// leaves it out of the body.
#[derive(Debug, Deserialize)]
pub struct RegisterCodePayload {
    pub pairing_code: String,
    pub station_id: String,
}

pub fn validate_claim_code(code: &str) -> Result<(), AppError> {
    if code.is_empty() || code.len() > CODE_MAX_LEN {
        return Err(AppError::Validation(format!(
            "pairing code must be 1..={CODE_MAX_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_register_code(payload: &RegisterCodePayload) -> Result<(), AppError> {
    validate_claim_code(&payload.pairing_code)?;
    if payload.station_id.is_empty() || payload.station_id.len() > HARDWARE_ID_MAX_LEN {
        return Err(AppError::Validation(format!(
            "hardware id must be 1..={HARDWARE_ID_MAX_LEN} characters"
        )));
    }
    Ok(())
}

/// Issue (or refresh) a pairing code for a hardware address. First
/// contact from an unknown address creates an unowned placeholder row.
pub async fn issue_code(repo: &Repository, payload: &RegisterCodePayload) -> Result<(), AppError> {
    validate_register_code(payload)?;

    let timeout = Utc::now() + Duration::seconds(PAIRING_WINDOW_SECS);
    match repo.get_station_by_mac(&payload.station_id).await? {
        Some(station) => {
            repo.set_pairing_code(station.id, &payload.pairing_code, timeout)
                .await?;
            tracing::info!(station_id = station.id, "pairing code refreshed");
        }
        None => {
            let name = placeholder_name(&payload.station_id);
            let station_id = repo
                .create_station(
                    None,
                    &name,
                    Some("Auto-paired"),
                    Some(&payload.station_id),
                    Some(&payload.pairing_code),
                    Some(timeout),
                )
                .await?;
            tracing::info!(station_id, "station auto-created for pairing");
        }
    }
    Ok(())
}

/// Claim the station carrying `pairing_code` for `user_id`.
///
/// Exactly one of two concurrent claims can win: the ownership write is
/// conditioned on the code still being present, and the loser finds the
/// code gone (not-found) or the row contested (conflict). A winner keeps
/// at most this one station; the rest of their fleet is dropped. On
/// success the station hears `confirm_pair` on its own topic.
pub async fn claim_station(
    repo: &Repository,
    broker: Option<&BrokerClient>,
    user_id: i64,
    pairing_code: &str,
) -> Result<(), AppError> {
    let station = repo
        .get_station_by_pairing_code(pairing_code)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("station with pairing code {pairing_code} not found"))
        })?;

    check_pairing_window(station.pairing_timeout, pairing_code)?;

    let affected = repo
        .claim_station(station.id, pairing_code, user_id)
        .await?;
    if affected == 0 {
        // Someone else got between our read and our write.
        return match repo.get_station_by_pairing_code(pairing_code).await? {
            None => Err(AppError::NotFound(format!(
                "station with pairing code {pairing_code} not found"
            ))),
            Some(contested) => Err(AppError::Conflict(format!(
                "station {} could not be claimed",
                contested.id
            ))),
        };
    }

    let deleted = repo
        .delete_other_user_stations(user_id, station.id)
        .await?;
    if deleted > 0 {
        tracing::info!(user_id, deleted, "removed previously owned stations");
    }

    match &station.mac_address {
        Some(mac) => {
            let broker = broker.ok_or(AppError::BrokerUnavailable)?;
            let payload = serde_json::json!({
                "type": "command",
                "activity": "pair_user",
                "action": "confirm_pair",
            });
            broker.publish_json(&format!("stations/{mac}"), &payload)?;
        }
        None => tracing::warn!(
            station_id = station.id,
            "claimed station has no hardware address, skipping confirm_pair"
        ),
    }

    Ok(())
}

fn check_pairing_window(
    timeout: Option<DateTime<Utc>>,
    pairing_code: &str,
) -> Result<(), AppError> {
    let timeout = timeout.ok_or_else(|| {
        AppError::IllegalState(format!("no pairing window open for code {pairing_code}"))
    })?;
    if timeout < Utc::now() {
        return Err(AppError::IllegalState(format!(
            "pairing window expired for code {pairing_code}"
        )));
    }
    Ok(())
}

fn placeholder_name(hardware_id: &str) -> String {
    let tail: String = hardware_id
        .chars()
        .rev()
        .take(6)
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    format!("Station-{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_name_uses_the_address_tail() {
        assert_eq!(placeholder_name("AABBCCDDEEFF"), "Station-DDEEFF");
        assert_eq!(placeholder_name("ABC"), "Station-ABC");
    }

    #[test]
    fn window_must_have_been_opened() {
        let err = check_pairing_window(None, "123456");
        assert!(matches!(err, Err(AppError::IllegalState(_))));
    }

    #[test]
    fn expired_window_is_illegal_state_not_not_found() {
        let past = Utc::now() - Duration::seconds(1);
        let err = check_pairing_window(Some(past), "123456");
        match err {
            Err(AppError::IllegalState(msg)) => assert!(msg.contains("expired")),
            other => panic!("expected IllegalState, got {other:?}"),
        }
    }

    #[test]
    fn open_window_passes() {
        let future = Utc::now() + Duration::seconds(PAIRING_WINDOW_SECS);
        assert!(check_pairing_window(Some(future), "123456").is_ok());
    }

    #[test]
    fn register_code_bounds() {
        let ok = RegisterCodePayload {
            pairing_code: "123456".into(),
            station_id: "AABBCCDDEEFF".into(),
        };
        assert!(validate_register_code(&ok).is_ok());

        let empty_code = RegisterCodePayload {
            pairing_code: String::new(),
            station_id: "AABBCCDDEEFF".into(),
        };
        assert!(matches!(
            validate_register_code(&empty_code),
            Err(AppError::Validation(_))
        ));

        let long_code = RegisterCodePayload {
            pairing_code: "x".repeat(13),
            station_id: "AABBCCDDEEFF".into(),
        };
        assert!(matches!(
            validate_register_code(&long_code),
            Err(AppError::Validation(_))
        ));

        let long_mac = RegisterCodePayload {
            pairing_code: "123456".into(),
            station_id: "x".repeat(65),
        };
        assert!(matches!(
            validate_register_code(&long_mac),
            Err(AppError::Validation(_))
        ));
    }
}
