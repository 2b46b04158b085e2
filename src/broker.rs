//! MQTT broker client.
//!
//! Thin wrapper over the synchronous rumqttc client. Publishing and
//! subscribing only enqueue onto the client's request channel; the
//! network loop itself is driven by the listener thread (see
//! `listener`), which owns the `Connection` half.

use std::time::Duration;

use rumqttc::{Client, Connection, MqttOptions, QoS};
use uuid::Uuid;

use crate::error::AppError;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;

/// The whole link runs fire-and-forget. Report inserts are not
/// idempotent, so a redelivered publish must never happen.
const LINK_QOS: QoS = QoS::AtMostOnce;

/// Cloneable publish handle, shared by HTTP controllers and the pairing
/// flow. Safe to call from any thread.
#[derive(Clone)]
pub struct BrokerClient {
    client: Client,
}

impl BrokerClient {
    pub fn subscribe(&self, filter: &str) -> Result<(), AppError> {
        self.client.subscribe(filter, LINK_QOS)?;
        Ok(())
    }

    pub fn publish_json(&self, topic: &str, payload: &serde_json::Value) -> Result<(), AppError> {
        let body = serde_json::to_vec(payload)?;
        self.client.publish(topic, LINK_QOS, false, body)?;
        Ok(())
    }
}

/// Build the client/connection pair. No network traffic happens until
/// the returned `Connection` is iterated.
pub fn connect(host: &str, port: u16) -> (BrokerClient, Connection) {
    let client_id = format!("sproutd-{}", Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(KEEP_ALIVE);

    let (client, connection) = Client::new(options, REQUEST_CAPACITY);
    (BrokerClient { client }, connection)
}
