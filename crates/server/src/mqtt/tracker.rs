//! Connection tracker: single-owner state for active MQTT connections.
//!
//! All access goes through the command channel; the tracker task owns the
//! map outright. A 10-second timer samples the stored MQTT clients and
//! updates the connected-client gauge per (client, profile).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;
use ubergang_common::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    Mqtt,
    MqttTls,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionType::Mqtt => write!(f, "mqtt"),
            ConnectionType::MqttTls => write!(f, "mqtt-tls"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectedInfo {
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
    pub connection_type: ConnectionType,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisconnectedInfo {
    pub remote_addr: String,
    pub disconnected_at: DateTime<Utc>,
}

/// Public snapshot of one client's connection state.
#[derive(Debug, Clone, Serialize)]
pub struct ClientConnectionState {
    pub connected: Option<ConnectedInfo>,
    pub disconnected: Option<DisconnectedInfo>,
}

enum Command {
    Add {
        client_id: String,
        connection_type: ConnectionType,
        remote_addr: String,
        closer: Arc<Notify>,
        reply: oneshot::Sender<i64>,
    },
    Remove {
        client_id: String,
        conn_id: i64,
    },
    Query {
        reply: oneshot::Sender<HashMap<String, ClientConnectionState>>,
    },
    Disconnect {
        client_id: String,
    },
}

struct ConnectedEntry {
    conn_id: i64,
    remote_addr: String,
    connected_at: DateTime<Utc>,
    connection_type: ConnectionType,
    closer: Arc<Notify>,
}

struct Entry {
    connected: Option<ConnectedEntry>,
    disconnected: Option<DisconnectedInfo>,
}

/// Handle to the tracker task. Cheap to clone.
#[derive(Clone)]
pub struct Tracker {
    tx: mpsc::Sender<Command>,
}

impl Tracker {
    /// Spawn the tracker task.
    pub fn spawn(db: Db) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run(db, rx));
        Self { tx }
    }

    /// Register a connection; any existing connection for the client id is
    /// closed first. Returns the fresh connection id.
    pub async fn add_connection(
        &self,
        client_id: &str,
        connection_type: ConnectionType,
        remote_addr: &str,
        closer: Arc<Notify>,
    ) -> i64 {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Add {
                client_id: client_id.to_string(),
                connection_type,
                remote_addr: remote_addr.to_string(),
                closer,
                reply,
            })
            .await;
        rx.await.unwrap_or(0)
    }

    /// Transition to disconnected, but only if `conn_id` still matches, so a
    /// stale remove after a replacement does not overwrite live state.
    pub async fn remove_connection(&self, client_id: &str, conn_id: i64) {
        let _ = self
            .tx
            .send(Command::Remove {
                client_id: client_id.to_string(),
                conn_id,
            })
            .await;
    }

    pub async fn get_connections(&self) -> HashMap<String, ClientConnectionState> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Query { reply }).await;
        rx.await.unwrap_or_default()
    }

    /// Force-close the client's underlying connection. The owning task then
    /// performs the normal remove.
    pub async fn disconnect(&self, client_id: &str) {
        let _ = self
            .tx
            .send(Command::Disconnect {
                client_id: client_id.to_string(),
            })
            .await;
    }
}

async fn run(db: Db, mut rx: mpsc::Receiver<Command>) {
    let mut entries: HashMap<String, Entry> = HashMap::new();
    let mut next_conn_id: i64 = 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { return };
                match cmd {
                    Command::Add { client_id, connection_type, remote_addr, closer, reply } => {
                        next_conn_id += 1;
                        if let Some(entry) = entries.get(&client_id) {
                            if let Some(connected) = &entry.connected {
                                debug!("Replacing live connection for {client_id}");
                                connected.closer.notify_one();
                            }
                        }
                        entries.insert(client_id, Entry {
                            connected: Some(ConnectedEntry {
                                conn_id: next_conn_id,
                                remote_addr,
                                connected_at: Utc::now(),
                                connection_type,
                                closer,
                            }),
                            disconnected: None,
                        });
                        let _ = reply.send(next_conn_id);
                    }
                    Command::Remove { client_id, conn_id } => {
                        if let Some(entry) = entries.get_mut(&client_id) {
                            let matches = entry
                                .connected
                                .as_ref()
                                .map(|c| c.conn_id == conn_id)
                                .unwrap_or(false);
                            if matches {
                                let connected = entry.connected.take().unwrap();
                                entry.disconnected = Some(DisconnectedInfo {
                                    remote_addr: connected.remote_addr,
                                    disconnected_at: Utc::now(),
                                });
                            }
                        }
                    }
                    Command::Query { reply } => {
                        let snapshot = entries
                            .iter()
                            .map(|(client_id, entry)| {
                                (client_id.clone(), ClientConnectionState {
                                    connected: entry.connected.as_ref().map(|c| ConnectedInfo {
                                        remote_addr: c.remote_addr.clone(),
                                        connected_at: c.connected_at,
                                        connection_type: c.connection_type,
                                    }),
                                    disconnected: entry.disconnected.clone(),
                                })
                            })
                            .collect();
                        let _ = reply.send(snapshot);
                    }
                    Command::Disconnect { client_id } => {
                        if let Some(entry) = entries.get(&client_id) {
                            if let Some(connected) = &entry.connected {
                                // Closing triggers the normal remove path.
                                connected.closer.notify_one();
                            }
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                for client in db.list_mqtt_clients() {
                    let connected = entries
                        .get(&client.id)
                        .map(|e| e.connected.is_some())
                        .unwrap_or(false);
                    metrics::gauge!(
                        "ubermqtt_client_connected",
                        "account" => client.id.clone(),
                        "profile" => client.profile_id.clone(),
                    )
                    .set(if connected { 1.0 } else { 0.0 });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_returns_fresh_ids() {
        let tracker = Tracker::spawn(Db::open_memory().unwrap());
        let a = tracker
            .add_connection("c1", ConnectionType::Mqtt, "1.2.3.4:5", Arc::new(Notify::new()))
            .await;
        let b = tracker
            .add_connection("c2", ConnectionType::Mqtt, "1.2.3.4:6", Arc::new(Notify::new()))
            .await;
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_replacement_closes_previous_connection() {
        let tracker = Tracker::spawn(Db::open_memory().unwrap());
        let first_closer = Arc::new(Notify::new());
        let notified = {
            let closer = first_closer.clone();
            tokio::spawn(async move { closer.notified().await })
        };
        let first = tracker
            .add_connection("c1", ConnectionType::Mqtt, "1.2.3.4:5", first_closer)
            .await;
        let second = tracker
            .add_connection("c1", ConnectionType::MqttTls, "1.2.3.4:6", Arc::new(Notify::new()))
            .await;
        assert_ne!(first, second);
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("first connection should be closed")
            .unwrap();

        // The tracker reports the second connection.
        let state = tracker.get_connections().await;
        let entry = state.get("c1").unwrap();
        assert_eq!(
            entry.connected.as_ref().unwrap().connection_type,
            ConnectionType::MqttTls
        );
    }

    #[tokio::test]
    async fn test_stale_remove_ignored() {
        let tracker = Tracker::spawn(Db::open_memory().unwrap());
        let first = tracker
            .add_connection("c1", ConnectionType::Mqtt, "1.2.3.4:5", Arc::new(Notify::new()))
            .await;
        let _second = tracker
            .add_connection("c1", ConnectionType::Mqtt, "1.2.3.4:6", Arc::new(Notify::new()))
            .await;

        // The replaced connection's deferred remove must not clobber state.
        tracker.remove_connection("c1", first).await;
        let state = tracker.get_connections().await;
        assert!(state.get("c1").unwrap().connected.is_some());
    }

    #[tokio::test]
    async fn test_matching_remove_transitions_to_disconnected() {
        let tracker = Tracker::spawn(Db::open_memory().unwrap());
        let id = tracker
            .add_connection("c1", ConnectionType::Mqtt, "1.2.3.4:5", Arc::new(Notify::new()))
            .await;
        tracker.remove_connection("c1", id).await;
        let state = tracker.get_connections().await;
        let entry = state.get("c1").unwrap();
        assert!(entry.connected.is_none());
        assert_eq!(entry.disconnected.as_ref().unwrap().remote_addr, "1.2.3.4:5");
    }

    #[tokio::test]
    async fn test_force_disconnect_notifies() {
        let tracker = Tracker::spawn(Db::open_memory().unwrap());
        let closer = Arc::new(Notify::new());
        let notified = {
            let closer = closer.clone();
            tokio::spawn(async move { closer.notified().await })
        };
        tracker
            .add_connection("c1", ConnectionType::Mqtt, "1.2.3.4:5", closer)
            .await;
        tracker.disconnect("c1").await;
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("disconnect should close the connection")
            .unwrap();
    }
}
