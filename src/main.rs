//! sproutd — Sprout backend server.
//!
//! Wires together config, Postgres, the MQTT listener thread, and the
//! HTTP/WebSocket surface. Everything of substance lives in the
//! library crate.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use sproutd::{broker, config, db, listener, routes, state};

#[tokio::main]
async fn main() {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = config::Config::from_env();

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true)
        .init();

    info!("sproutd starting");

    // ── Postgres ────────────────────────────────────────────
    let pool = PgPoolOptions::new()
        .min_connections(config.pg_pool_min)
        .max_connections(config.pg_pool_max)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to Postgres");

    info!("running migrations");
    sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
        .execute(&pool)
        .await
        .expect("failed to run migrations");
    info!("database ready");

    // ── Broker ──────────────────────────────────────────────
    let broker_parts = match &config.mqtt_host {
        Some(host) => {
            info!(host = %host, port = config.mqtt_port, "MQTT broker configured");
            Some(broker::connect(host, config.mqtt_port))
        }
        None => {
            warn!("MQTT_HOST not set; pairing claims and command dispatch are disabled");
            None
        }
    };
    let (broker_client, connection) = match broker_parts {
        Some((client, connection)) => (Some(client), Some(connection)),
        None => (None, None),
    };

    // ── Shared state ────────────────────────────────────────
    let state = state::AppState::new(
        db::ConnectionPool::new(pool),
        broker_client.clone(),
        config.clone(),
    );

    // ── Broker listener thread ──────────────────────────────
    if let (Some(client), Some(connection)) = (broker_client, connection) {
        listener::spawn(Arc::clone(&state), client, connection);
    }

    // ── Routes, bind & serve ────────────────────────────────
    let app = routes::build_router(Arc::clone(&state));

    let tcp = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind");

    info!(addr = %config.listen_addr, "sproutd listening");

    axum::serve(tcp, app).await.expect("server error");
}
