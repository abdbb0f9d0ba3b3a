//! MQTT broker-proxy.
//!
//! Accepts client connections on plain TCP and TLS, authenticates them
//! against stored MQTT client records, compiles the profile ACL, and splices
//! packets to the upstream broker with SUBSCRIBE/SUBACK/PUBLISH rewriting.

pub mod acl;
pub mod codec;
pub mod conn;
pub mod publisher;
pub mod tracker;

use crate::backends::BoxedStream;
use crate::tls::TlsManager;
use acl::Acl;
use codec::Packet;
use conn::{connection_refused, server_unavailable, Splice};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{info, warn};
use tracker::{ConnectionType, Tracker};
use ubergang_common::{Db, Error, MqttClient, Result};

pub struct MqttProxy {
    db: Db,
    tracker: Tracker,
    tls: Arc<TlsManager>,
    broker_address: String,
}

impl MqttProxy {
    pub fn new(db: Db, tracker: Tracker, tls: Arc<TlsManager>, broker_address: String) -> Self {
        Self {
            db,
            tracker,
            tls,
            broker_address,
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Spawn both listeners.
    pub fn start(self: &Arc<Self>, port: u16, tls_port: u16) {
        let proxy = self.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy.listen(port).await {
                tracing::error!("MQTT listener failed: {e}");
            }
        });
        let proxy = self.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy.listen_tls(tls_port).await {
                tracing::error!("MQTT TLS listener failed: {e}");
            }
        });
    }

    async fn listen(self: Arc<Self>, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Starting MQTT proxy server on :{port}");
        loop {
            let (stream, peer) = listener.accept().await?;
            let proxy = self.clone();
            tokio::spawn(async move {
                proxy
                    .handle_client(
                        ConnectionType::Mqtt,
                        Box::new(stream) as BoxedStream,
                        peer.to_string(),
                    )
                    .await;
            });
        }
    }

    async fn listen_tls(self: Arc<Self>, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Starting MQTT TLS proxy server on :{port}");
        loop {
            let (stream, peer) = listener.accept().await?;
            let proxy = self.clone();
            tokio::spawn(async move {
                let tls_stream = match proxy.tls.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("mqtt: TLS handshake failed from {peer}: {e}");
                        metrics::counter!("ubermqtt_connection_errors_total", "error" => "tls_handshake")
                            .increment(1);
                        return;
                    }
                };
                proxy
                    .handle_client(
                        ConnectionType::MqttTls,
                        Box::new(tls_stream) as BoxedStream,
                        peer.to_string(),
                    )
                    .await;
            });
        }
    }

    async fn handle_client(
        &self,
        connection_type: ConnectionType,
        mut stream: BoxedStream,
        remote_addr: String,
    ) {
        info!("mqtt: Accepted {connection_type} connection from {remote_addr}");

        let mut connect = match codec::read_packet(&mut stream).await {
            Ok(Packet::Connect(connect)) => connect,
            Ok(_) => {
                warn!("mqtt: first packet wasn't CONNECT - closing ({remote_addr})");
                metrics::counter!("ubermqtt_connection_errors_total", "error" => "read_connect")
                    .increment(1);
                return;
            }
            Err(e) => {
                warn!("mqtt: Failed to read CONNECT packet: {e} from {remote_addr}");
                metrics::counter!("ubermqtt_connection_errors_total", "error" => "read_connect")
                    .increment(1);
                return;
            }
        };

        let username = connect.username.clone().unwrap_or_default();
        let password = connect
            .password
            .clone()
            .map(|p| String::from_utf8_lossy(&p).into_owned())
            .unwrap_or_default();

        let (acl, client) = match self.authorize_connection(&username, &password) {
            Ok(out) => out,
            Err(e) => {
                warn!("mqtt: Failed to authorize connection ({username}): {e} from {remote_addr}");
                metrics::counter!("ubermqtt_connection_errors_total", "error" => "failed_auth")
                    .increment(1);
                let _ = codec::write_packet(&mut stream, &Packet::Connack(connection_refused()))
                    .await;
                return;
            }
        };

        let mut broker_stream = match TcpStream::connect(&self.broker_address).await {
            Ok(s) => s,
            Err(e) => {
                warn!("mqtt: Failed to connect to broker: {e}");
                metrics::counter!("ubermqtt_connection_errors_total", "error" => "connect_broker")
                    .increment(1);
                let _ = codec::write_packet(&mut stream, &Packet::Connack(server_unavailable()))
                    .await;
                return;
            }
        };

        let closer = Arc::new(Notify::new());
        let conn_id = self
            .tracker
            .add_connection(&client.id, connection_type, &remote_addr, closer.clone())
            .await;

        // The upstream broker is trusted locally: strip the credentials and
        // namespace the client id.
        connect.username = None;
        connect.password = None;
        connect.client_id = format!("ug-{}", client.id);

        if let Some(will) = &connect.will {
            let class = acl.validate_publish_topic(&will.topic);
            info!(
                "mqtt/c{conn_id}/{}: will topic set to {} ({})",
                client.id,
                will.topic,
                class.as_str()
            );
            if class != acl::Classification::Allowed {
                info!("mqtt/c{conn_id}/{}: aborting connection as will topic not allowed", client.id);
                let _ = codec::write_packet(&mut stream, &Packet::Connack(server_unavailable()))
                    .await;
                self.tracker.remove_connection(&client.id, conn_id).await;
                return;
            }
        }

        if codec::write_packet(&mut broker_stream, &Packet::Connect(connect))
            .await
            .is_err()
        {
            let _ = codec::write_packet(&mut stream, &Packet::Connack(server_unavailable())).await;
            self.tracker.remove_connection(&client.id, conn_id).await;
            return;
        }

        let connack = match codec::read_packet(&mut broker_stream).await {
            Ok(Packet::Connack(connack)) => connack,
            other => {
                warn!("mqtt/c{conn_id}/{}: failed to read CONNACK from broker: {other:?}", client.id);
                let _ = codec::write_packet(&mut stream, &Packet::Connack(server_unavailable()))
                    .await;
                self.tracker.remove_connection(&client.id, conn_id).await;
                return;
            }
        };
        let return_code = connack.return_code;
        if codec::write_packet(&mut stream, &Packet::Connack(connack))
            .await
            .is_err()
            || return_code != 0
        {
            if return_code != 0 {
                info!("mqtt/c{conn_id}/{}: CONNACK return code: {return_code} - exiting", client.id);
            }
            self.tracker.remove_connection(&client.id, conn_id).await;
            return;
        }

        metrics::counter!(
            "ubermqtt_connection_success_total",
            "account" => client.id.clone(),
            "profile" => client.profile_id.clone(),
        )
        .increment(1);

        let client_id = client.id.clone();
        info!("mqtt/c{conn_id}/{client_id}: serving client");
        Splice {
            conn_id,
            client,
            acl,
            closer,
        }
        .run(stream, broker_stream)
        .await;

        self.tracker.remove_connection(&client_id, conn_id).await;
    }

    fn authorize_connection(&self, username: &str, password: &str) -> Result<(Acl, MqttClient)> {
        let client = self.db.get_mqtt_client(username)?;
        if client.password != password {
            return Err(Error::NotAuthorized("invalid password".into()));
        }
        let profile = self.db.get_mqtt_profile(&client.profile_id)?;
        let acl = Acl::new(&client, &profile)?;
        Ok((acl, client))
    }
}
