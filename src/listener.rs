//! Broker listener thread.
//!
//! Owns the MQTT network loop on a dedicated OS thread and dispatches
//! everything published under `stations/#`. Recognized command triples
//! run a use case against the database (blocking only this thread);
//! everything that parses is then re-broadcast to the station's live
//! WebSocket listeners, whatever its shape, so new firmware messages
//! reach the frontend before the backend learns their meaning.
//!
//! Nothing here is allowed to kill the thread: bad payloads and failed
//! branches are logged and dropped.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use axum::extract::ws::Message;
use rumqttc::{Connection, Event, Packet, Publish};
use serde_json::Value;

use crate::broker::BrokerClient;
use crate::db::with_db;
use crate::pairing::{self, RegisterCodePayload};
use crate::repo::Repository;
use crate::reports::{self, ExpressAnalysisPayload, WateringReportPayload};
use crate::state::AppState;

const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
enum Dispatch {
    ExpressAnalysis,
    Watering,
    RegisterCode,
}

/// Start the listener thread. Runs until the process exits.
pub fn spawn(
    state: Arc<AppState>,
    broker: BrokerClient,
    connection: Connection,
) -> thread::JoinHandle<()> {
    thread::spawn(move || run(state, broker, connection))
}

fn run(state: Arc<AppState>, broker: BrokerClient, mut connection: Connection) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Subscriptions do not survive a reconnect.
                tracing::info!("connected to MQTT broker");
                if let Err(error) = broker.subscribe("stations/#") {
                    tracing::error!(%error, "failed to subscribe to station topics");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => handle_publish(&state, &publish),
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(%error, "MQTT connection lost, retrying");
                thread::sleep(RECONNECT_PAUSE);
            }
        }
    }
}

fn handle_publish(state: &Arc<AppState>, publish: &Publish) {
    let station_id = extract_station_id(&publish.topic);
    let payload = String::from_utf8_lossy(&publish.payload);

    let Some(message) = parse_json_object(&payload) else {
        tracing::warn!(topic = %publish.topic, "non-JSON message received");
        return;
    };

    tracing::info!(
        topic = %publish.topic,
        msg_type = message
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown"),
        "broker message"
    );

    match classify(&message) {
        Some(Dispatch::ExpressAnalysis) => run_express(state, station_id.as_deref(), &message),
        Some(Dispatch::Watering) => run_watering(state, station_id.as_deref(), &message),
        Some(Dispatch::RegisterCode) => run_register_code(state, station_id.as_deref(), &message),
        None => {}
    }

    // Forward-compatibility fallback: whatever it was, the station's
    // live listeners get to see it.
    rebroadcast(state, station_id.as_deref(), &message);
}

// ═══════════════════════════════════════════════════════════════
// Message classification
// ═══════════════════════════════════════════════════════════════

fn classify(message: &Value) -> Option<Dispatch> {
    let triple = (
        message.get("type")?.as_str()?,
        message.get("activity")?.as_str()?,
        message.get("action")?.as_str()?,
    );
    match triple {
        ("command", "express_analysis", "compute_report") => Some(Dispatch::ExpressAnalysis),
        ("command", "watering", "compute_report") => Some(Dispatch::Watering),
        ("command", "pair_user", "register_code") => Some(Dispatch::RegisterCode),
        _ => None,
    }
}

/// `stations/7/...` (or the singular form some firmware builds use)
/// names station 7; anything else names nobody.
fn extract_station_id(topic: &str) -> Option<String> {
    let mut parts = topic.split('/');
    let head = parts.next()?;
    if head != "station" && head != "stations" {
        return None;
    }
    parts
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

fn parse_json_object(payload: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value.is_object().then_some(value)
}

// ═══════════════════════════════════════════════════════════════
// Command branches
// ═══════════════════════════════════════════════════════════════

fn run_express(state: &Arc<AppState>, station_id: Option<&str>, message: &Value) {
    let data = message.get("data").cloned().unwrap_or(Value::Null);
    let payload: ExpressAnalysisPayload = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(%error, "malformed express_analysis payload");
            return;
        }
    };

    let outcome = state.bridge.block_on(with_db(&state.db, |db| async move {
        reports::create_express_report(&Repository::new(db), &payload).await
    }));

    match outcome {
        Ok(report_id) => {
            tracing::info!(report_id, "express report stored");
            confirm_report(state, station_id, "express_analysis", report_id);
        }
        Err(error) => tracing::warn!(%error, "express_analysis processing failed"),
    }
}

fn run_watering(state: &Arc<AppState>, station_id: Option<&str>, message: &Value) {
    let data = message.get("data").cloned().unwrap_or(Value::Null);
    let payload: WateringReportPayload = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(%error, "malformed watering payload");
            return;
        }
    };

    let outcome = state.bridge.block_on(with_db(&state.db, |db| async move {
        reports::create_watering_report(&Repository::new(db), &payload).await
    }));

    match outcome {
        Ok(report_id) => {
            tracing::info!(report_id, "watering report stored");
            confirm_report(state, station_id, "watering", report_id);
        }
        Err(error) => tracing::warn!(%error, "watering processing failed"),
    }
}

fn run_register_code(state: &Arc<AppState>, station_id: Option<&str>, message: &Value) {
    let mut data = message.get("data").cloned().unwrap_or(Value::Null);
    // The station id comes from the topic, whatever the body says.
    if let Value::Object(map) = &mut data {
        let injected = match station_id {
            Some(id) => Value::String(id.to_string()),
            None => Value::Null,
        };
        map.insert("station_id".to_string(), injected);
    }

    let payload: RegisterCodePayload = match serde_json::from_value(data) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(%error, "malformed register_code payload");
            return;
        }
    };

    let outcome = state.bridge.block_on(with_db(&state.db, |db| async move {
        pairing::issue_code(&Repository::new(db), &payload).await
    }));

    if let Err(error) = outcome {
        tracing::warn!(%error, "register_code processing failed");
    }
}

// ═══════════════════════════════════════════════════════════════
// Outbound notifications (through the bridge)
// ═══════════════════════════════════════════════════════════════

fn report_confirmation(activity: &str, report_id: i64) -> String {
    serde_json::json!({
        "type": "command",
        "activity": activity,
        "action": "present_report",
        "data": { "report_id": report_id },
    })
    .to_string()
}

fn confirm_report(state: &Arc<AppState>, station_id: Option<&str>, activity: &str, report_id: i64) {
    let Some(station_id) = station_id else {
        tracing::debug!(activity, report_id, "no station in topic, confirmation dropped");
        return;
    };
    notify_station(state, station_id, report_confirmation(activity, report_id));
}

fn notify_station(state: &Arc<AppState>, station_id: &str, text: String) {
    let bridge = state.bridge.clone();
    let state = state.clone();
    let station = station_id.to_string();
    bridge.schedule("notify-station", async move {
        state.registry.broadcast(&station, Message::Text(text.into()));
        Ok(())
    });
}

fn rebroadcast(state: &Arc<AppState>, station_id: Option<&str>, message: &Value) {
    let text = message.to_string();
    match station_id {
        Some(station_id) => notify_station(state, station_id, text),
        None => {
            let bridge = state.bridge.clone();
            let state = state.clone();
            bridge.schedule("broadcast-all", async move {
                state.registry.broadcast_all(Message::Text(text.into()));
                Ok(())
            });
        }
    }
}
