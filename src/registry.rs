//! Live-connection registry.
//!
//! Maps a station id to the set of WebSocket clients currently watching
//! it. Entries are tracked per connection, not per user: the same user
//! can watch one station from several tabs, and each tab gets its own
//! sender. An id with no remaining clients is removed from the map
//! entirely, so the registry never accumulates empty keys.

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One registered WebSocket client. The `tx` half feeds the connection's
/// writer task; dropping the receiver marks the client dead and the next
/// broadcast prunes it.
#[derive(Clone)]
pub struct StationClient {
    pub conn_id: Uuid,
    pub user_id: i64,
    pub tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
pub struct StationRegistry {
    clients: DashMap<String, Vec<StationClient>>,
}

impl StationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, station_id: &str, client: StationClient) {
        self.clients
            .entry(station_id.to_string())
            .or_default()
            .push(client);
    }

    /// Drop one connection from a station's set. The key disappears with
    /// its last client.
    pub fn unregister(&self, station_id: &str, conn_id: Uuid) {
        if let Some(mut entry) = self.clients.get_mut(station_id) {
            entry.retain(|c| c.conn_id != conn_id);
        }
        self.clients
            .remove_if(station_id, |_, clients| clients.is_empty());
    }

    /// Send `message` to every client watching `station_id`. Works on a
    /// snapshot of the set, so a send never holds the map lock; clients
    /// whose channel is closed are pruned afterwards. Returns how many
    /// clients the message actually reached.
    pub fn broadcast(&self, station_id: &str, message: Message) -> usize {
        let snapshot = match self.clients.get(station_id) {
            Some(entry) => entry.value().clone(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut dead: Vec<Uuid> = Vec::new();
        for client in &snapshot {
            if client.tx.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(client.conn_id);
            }
        }

        if !dead.is_empty() {
            tracing::info!(
                station_id,
                dropped = dead.len(),
                "pruning closed live connections"
            );
            if let Some(mut entry) = self.clients.get_mut(station_id) {
                entry.retain(|c| !dead.contains(&c.conn_id));
            }
            self.clients
                .remove_if(station_id, |_, clients| clients.is_empty());
        }
        delivered
    }

    /// Send `message` to every client of every station. Used for broker
    /// traffic whose topic names no station.
    pub fn broadcast_all(&self, message: Message) -> usize {
        // Keys first, so the per-station broadcast never runs under the
        // map's iteration lock.
        let stations: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        stations
            .iter()
            .map(|s| self.broadcast(s, message.clone()))
            .sum()
    }

    pub fn client_count(&self, station_id: &str) -> usize {
        self.clients.get(station_id).map(|e| e.len()).unwrap_or(0)
    }
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn client(user_id: i64) -> (StationClient, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = StationClient {
            conn_id: Uuid::new_v4(),
            user_id,
            tx,
        };
        (client, rx)
    }

    #[test]
    fn broadcast_reaches_every_client() {
        let registry = StationRegistry::new();
        let (a, mut rx_a) = client(1);
        let (b, mut rx_b) = client(2);
        registry.register("7", a);
        registry.register("7", b);

        let delivered = registry.broadcast("7", Message::Text("Broadcast: hello".into()));
        assert_eq!(delivered, 2);
        assert!(
            matches!(rx_a.try_recv(), Ok(Message::Text(t)) if t.as_str() == "Broadcast: hello")
        );
        assert!(
            matches!(rx_b.try_recv(), Ok(Message::Text(t)) if t.as_str() == "Broadcast: hello")
        );
    }

    #[test]
    fn broadcast_to_unknown_station_is_a_no_op() {
        let registry = StationRegistry::new();
        assert_eq!(registry.broadcast("404", Message::Text("x".into())), 0);
    }

    #[test]
    fn dead_clients_are_pruned_without_touching_live_ones() {
        let registry = StationRegistry::new();
        let (a, rx_a) = client(1);
        let (b, mut rx_b) = client(2);
        registry.register("7", a);
        registry.register("7", b);

        drop(rx_a);
        let delivered = registry.broadcast("7", Message::Text("ping".into()));
        assert_eq!(delivered, 1);
        assert_eq!(registry.client_count("7"), 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn last_dead_client_removes_the_key() {
        let registry = StationRegistry::new();
        let (a, rx_a) = client(1);
        registry.register("7", a);
        drop(rx_a);

        assert_eq!(registry.broadcast("7", Message::Text("ping".into())), 0);
        assert!(!registry.clients.contains_key("7"));
    }

    #[test]
    fn unregister_removes_only_the_matching_connection() {
        let registry = StationRegistry::new();
        let (a, _rx_a) = client(1);
        let (b, _rx_b) = client(1);
        let a_id = a.conn_id;
        registry.register("7", a);
        registry.register("7", b);

        registry.unregister("7", a_id);
        assert_eq!(registry.client_count("7"), 1);

        let survivor = registry.clients.get("7").unwrap().value()[0].conn_id;
        assert_ne!(survivor, a_id);
    }

    #[test]
    fn unregister_last_client_removes_the_key() {
        let registry = StationRegistry::new();
        let (a, _rx_a) = client(1);
        let a_id = a.conn_id;
        registry.register("7", a);

        registry.unregister("7", a_id);
        assert!(!registry.clients.contains_key("7"));
    }

    #[test]
    fn broadcast_all_reaches_every_station() {
        let registry = StationRegistry::new();
        let (a, mut rx_a) = client(1);
        let (b, mut rx_b) = client(2);
        registry.register("7", a);
        registry.register("8", b);

        assert_eq!(registry.broadcast_all(Message::Text("wide".into())), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn station_can_be_repopulated_after_removal() {
        let registry = StationRegistry::new();
        let (a, rx_a) = client(1);
        registry.register("7", a);
        drop(rx_a);
        registry.broadcast("7", Message::Text("ping".into()));

        let (b, mut rx_b) = client(2);
        registry.register("7", b);
        assert_eq!(registry.broadcast("7", Message::Text("back".into())), 1);
        assert!(rx_b.try_recv().is_ok());
    }
}
