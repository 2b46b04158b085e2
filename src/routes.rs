//! Route table and middleware assembly.

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::{auth, db, reports, stations, ws};

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Everything under /api runs inside one request transaction,
    // committed (pooled connections only) when the handler returns.
    let api = Router::new()
        .route(
            "/stations",
            get(stations::list_stations).post(stations::create_station),
        )
        .route("/stations-pairing", put(stations::pair_station))
        .route(
            "/stations/{station_id}/command",
            post(stations::send_command),
        )
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route(
            "/reports/express/{report_id}",
            get(reports::get_express_report),
        )
        .route(
            "/reports/watering/{report_id}",
            get(reports::get_watering_report),
        )
        .layer(middleware::from_fn_with_state(state.clone(), db::db_session));

    // WebSocket endpoint (auth via query param, not bearer header).
    let ws_routes = Router::new().route("/ws/stations/{station_id}", get(ws::ws_handler));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api)
        .merge(ws_routes)
        .merge(health)
        .layer(cors_layer(&state.config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Browser frontend runs on its own origin and sends the refresh
/// cookie, so origins are enumerated rather than wildcarded.
fn cors_layer(origins: &[String]) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parse_origins(origins)))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::COOKIE])
        .allow_credentials(true)
}

/// A misconfigured entry must not take the others down with it, but it
/// must leave a trace.
fn parse_origins(origins: &[String]) -> Vec<HeaderValue> {
    origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect()
}

/// Liveness probe. No auth, no DB.
async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparseable_origin_is_dropped_not_fatal() {
        let parsed = parse_origins(&[
            "https://app.example".into(),
            "https://bad\nvalue".into(),
            "https://second.example".into(),
        ]);
        assert_eq!(
            parsed,
            vec![
                HeaderValue::from_static("https://app.example"),
                HeaderValue::from_static("https://second.example"),
            ],
        );
    }

    #[test]
    fn all_origins_survive_when_well_formed() {
        let parsed = parse_origins(&["https://localhost:4200".into(), "https://localhost".into()]);
        assert_eq!(parsed.len(), 2);
    }
}
