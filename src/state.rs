//! Shared server state — the pool manager, the live-connection
//! registry, and the bridge to the runtime.

use std::sync::Arc;

use crate::bridge::TaskBridge;
use crate::broker::BrokerClient;
use crate::config::Config;
use crate::db::ConnectionPool;
use crate::registry::StationRegistry;

/// Shared state accessible from all handlers and the broker thread.
pub struct AppState {
    pub db: ConnectionPool,
    /// Live WebSocket connections keyed by station hardware id.
    pub registry: StationRegistry,
    /// Schedules async work from the broker thread onto the runtime.
    pub bridge: TaskBridge,
    /// Publish half of the MQTT client; `None` when running without a
    /// broker (reduced mode: no pairing claim, no command dispatch).
    pub broker: Option<BrokerClient>,
    pub config: Config,
}

impl AppState {
    /// Must be called from within the runtime; the bridge captures it
    /// here.
    pub fn new(db: ConnectionPool, broker: Option<BrokerClient>, config: Config) -> Arc<Self> {
        Arc::new(Self {
            db,
            registry: StationRegistry::new(),
            bridge: TaskBridge::current(),
            broker,
            config,
        })
    }
}
