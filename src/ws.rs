//! Live telemetry endpoint — one WebSocket per station watcher.
//!
//! Flow per connection:
//! 1. Accept the upgrade first; a close code can't be delivered to a
//!    connection that was never accepted
//! 2. Validate the token, then the caller's claim to the station
//! 3. Register in the station registry and stream
//! 4. On any exit: unregister and release the DB lease, exactly once
//!
//! Close codes: 4001 expired token, 4002 malformed token, 4003 missing
//! token or no right to the station, 1011 no database.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use jsonwebtoken::errors::ErrorKind;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth;
use crate::db::{CommitPolicy, DbHandle};
use crate::registry::StationClient;
use crate::repo::Repository;
use crate::state::AppState;

pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;
pub const CLOSE_TOKEN_INVALID: u16 = 4002;
pub const CLOSE_UNAUTHORIZED: u16 = 4003;
pub const CLOSE_DB_UNAVAILABLE: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for GET /ws/stations/{station_id} — upgrades to
/// WebSocket. `station_id` is the hardware address the station
/// publishes under.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(station_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, station_id, query.token))
}

/// Per-connection state machine.
async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    station_id: String,
    token: Option<String>,
) {
    // ── Phase 1: authenticate ───────────────────────────────
    // No token means no DB work at all.
    let Some(token) = token else {
        close(&mut socket, CLOSE_UNAUTHORIZED, "Missing token").await;
        return;
    };

    let db = match state.db.handle(CommitPolicy::Defer).await {
        Ok(handle) => Arc::new(handle),
        Err(error) => {
            warn!(%error, "no database for live connection");
            close(&mut socket, CLOSE_DB_UNAVAILABLE, "Database unavailable").await;
            return;
        }
    };

    let user_id = match authorize(&state, &db, &station_id, &token).await {
        Ok(user_id) => user_id,
        Err(rejection) => {
            db.release().await;
            close(&mut socket, rejection.code, rejection.reason).await;
            return;
        }
    };

    // ── Phase 2: register and stream ────────────────────────
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    state.registry.register(
        &station_id,
        StationClient {
            conn_id,
            user_id,
            tx,
        },
    );
    info!(station = %station_id, user_id, %conn_id, "live connection registered");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                // Fan out to every watcher of this station, the sender
                // included, through the fire-and-forget bridge.
                let fanout = state.clone();
                let station = station_id.clone();
                let outbound = format!("Broadcast: {text}");
                state.bridge.schedule("ws-broadcast", async move {
                    fanout
                        .registry
                        .broadcast(&station, Message::Text(outbound.into()));
                    Ok(())
                });
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) => { /* axum auto-pongs */ }
            Ok(_) => { /* binary frames ignored */ }
            Err(error) => {
                warn!(station = %station_id, %conn_id, "live connection errored: {error}");
                break;
            }
        }
    }

    // ── Phase 3: teardown ───────────────────────────────────
    state.registry.unregister(&station_id, conn_id);
    db.release().await;
    // The registry entry held the last sender; the writer drains and exits.
    let _ = writer.await;
    info!(station = %station_id, %conn_id, "live connection closed");
}

// ═══════════════════════════════════════════════════════════════
// Authorization
// ═══════════════════════════════════════════════════════════════

struct Rejection {
    code: u16,
    reason: &'static str,
}

/// An expired token is the one decode failure worth telling apart: the
/// client can fix it by refreshing. Everything else is just invalid.
fn token_rejection(error: &jsonwebtoken::errors::Error) -> Rejection {
    if matches!(error.kind(), ErrorKind::ExpiredSignature) {
        Rejection {
            code: CLOSE_TOKEN_EXPIRED,
            reason: "Token expired",
        }
    } else {
        Rejection {
            code: CLOSE_TOKEN_INVALID,
            reason: "Invalid token",
        }
    }
}

async fn authorize(
    state: &Arc<AppState>,
    db: &Arc<DbHandle>,
    station_id: &str,
    token: &str,
) -> Result<i64, Rejection> {
    let claims = auth::decode_access_token(&state.config.jwt_secret, token)
        .map_err(|error| token_rejection(&error))?;

    let user_id = auth::user_id_from_claims(&claims).map_err(|_| Rejection {
        code: CLOSE_TOKEN_INVALID,
        reason: "Invalid token",
    })?;

    let repo = Repository::new(db.clone());
    let station = repo.get_station_by_mac(station_id).await.map_err(|error| {
        warn!(%error, "station lookup failed");
        Rejection {
            code: CLOSE_DB_UNAVAILABLE,
            reason: "Database unavailable",
        }
    })?;

    match station {
        Some(s) if s.user_id == Some(user_id) => Ok(user_id),
        // An unknown station and someone else's station read the same.
        _ => Err(Rejection {
            code: CLOSE_UNAUTHORIZED,
            reason: "Unauthorized station access",
        }),
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(error) = socket.send(Message::Close(Some(frame))).await {
        warn!(code, "failed to deliver close frame: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "ws-test-secret";

    #[test]
    fn expired_token_gets_its_own_close_code() {
        let token = auth::issue_access_token(SECRET, 5, None, -30).unwrap();
        let error = auth::decode_access_token(SECRET, &token).unwrap_err();
        let rejection = token_rejection(&error);
        assert_eq!(rejection.code, CLOSE_TOKEN_EXPIRED);
        assert_eq!(rejection.reason, "Token expired");
    }

    #[test]
    fn malformed_token_is_invalid_not_expired() {
        let error = auth::decode_access_token(SECRET, "not-a-jwt").unwrap_err();
        let rejection = token_rejection(&error);
        assert_eq!(rejection.code, CLOSE_TOKEN_INVALID);
        assert_eq!(rejection.reason, "Invalid token");
    }

    #[test]
    fn wrong_signature_is_invalid_not_expired() {
        let token = auth::issue_access_token("other-secret", 5, None, 60).unwrap();
        let error = auth::decode_access_token(SECRET, &token).unwrap_err();
        assert_eq!(token_rejection(&error).code, CLOSE_TOKEN_INVALID);
    }
}
