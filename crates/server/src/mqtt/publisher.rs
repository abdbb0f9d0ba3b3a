//! Server-side MQTT publisher.
//!
//! Maintains one persistent connection to the upstream broker for the script
//! router's `mqtt.publish`. Reconnects with backoff; publishes are
//! fire-and-forget at the protocol level.

use super::codec::{self, Connect, Packet, Publish};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ubergang_common::{Error, Result};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

struct PublishCmd {
    topic: String,
    payload: Vec<u8>,
    qos: u8,
    retain: bool,
}

#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<PublishCmd>,
    connected: Arc<AtomicBool>,
}

impl Publisher {
    /// Spawn the connection-management task.
    pub fn spawn(broker_address: String) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let connected = Arc::new(AtomicBool::new(false));
        info!("mqtt/publisher: connecting to broker at {broker_address}");
        tokio::spawn(run(broker_address, rx, connected.clone()));
        Self { tx, connected }
    }

    pub fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<()> {
        if !self.is_connected() {
            metrics::counter!("ubermqtt_publisher_errors_total", "error_type" => "not_connected")
                .increment(1);
            return Err(Error::Internal("not connected to broker".into()));
        }
        self.tx
            .try_send(PublishCmd {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos,
                retain,
            })
            .map_err(|_| {
                metrics::counter!("ubermqtt_publisher_errors_total", "error_type" => "queue_full")
                    .increment(1);
                Error::Internal("publish queue full".into())
            })?;
        metrics::counter!("ubermqtt_publisher_success_total").increment(1);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

async fn run(
    broker_address: String,
    mut rx: mpsc::Receiver<PublishCmd>,
    connected: Arc<AtomicBool>,
) {
    let client_id = format!("ubergang-server-{:08x}", rand::thread_rng().gen::<u32>());
    let mut backoff = Duration::from_secs(1);

    loop {
        match connect(&broker_address, &client_id).await {
            Ok(stream) => {
                info!("mqtt/publisher: connected to broker at {broker_address}");
                connected.store(true, Ordering::Relaxed);
                metrics::gauge!("ubermqtt_publisher_connected").set(1.0);
                backoff = Duration::from_secs(1);

                serve(stream, &mut rx).await;

                connected.store(false, Ordering::Relaxed);
                metrics::gauge!("ubermqtt_publisher_connected").set(0.0);
                warn!("mqtt/publisher: connection lost, reconnecting");
            }
            Err(e) => {
                debug!("mqtt/publisher: connect failed: {e} (will retry)");
            }
        }
        metrics::counter!("ubermqtt_publisher_reconnects_total").increment(1);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn connect(broker_address: &str, client_id: &str) -> std::io::Result<TcpStream> {
    let mut stream = tokio::time::timeout(
        Duration::from_secs(5),
        TcpStream::connect(broker_address),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"))??;

    let connect = Connect {
        protocol_name: "MQTT".into(),
        protocol_level: 4,
        clean_session: true,
        keep_alive: KEEP_ALIVE.as_secs() as u16,
        client_id: client_id.to_string(),
        will: None,
        username: None,
        password: None,
    };
    codec::write_packet(&mut stream, &Packet::Connect(connect)).await?;
    match codec::read_packet(&mut stream).await? {
        Packet::Connack(ack) if ack.return_code == 0 => Ok(stream),
        Packet::Connack(ack) => Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("CONNACK return code {}", ack.return_code),
        )),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "expected CONNACK",
        )),
    }
}

/// Pump publishes out and keepalives through until the connection dies. The
/// broker side is drained by its own task; packet reads must not share a
/// select loop or a cancelled partial read would desync the framing.
async fn serve(stream: TcpStream, rx: &mut mpsc::Receiver<PublishCmd>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = tokio::spawn(async move {
        let mut read_half = read_half;
        loop {
            match codec::read_packet(&mut read_half).await {
                // Acks and ping responses need no bookkeeping here.
                Ok(Packet::Puback { .. } | Packet::Pingresp) => {}
                Ok(other) => debug!("mqtt/publisher: ignoring {other:?}"),
                Err(_) => return,
            }
        }
    });

    let mut next_packet_id: u16 = 0;
    let mut keepalive = tokio::time::interval(KEEP_ALIVE / 2);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { reader.abort(); return };
                next_packet_id = next_packet_id.wrapping_add(1).max(1);
                let publish = Publish {
                    dup: false,
                    qos: cmd.qos.min(1),
                    retain: cmd.retain,
                    topic: cmd.topic,
                    packet_id: (cmd.qos > 0).then_some(next_packet_id),
                    payload: cmd.payload,
                };
                if codec::write_packet(&mut write_half, &Packet::Publish(publish)).await.is_err() {
                    metrics::counter!("ubermqtt_publisher_errors_total", "error_type" => "publish_failed")
                        .increment(1);
                    reader.abort();
                    return;
                }
            }
            _ = keepalive.tick() => {
                if codec::write_packet(&mut write_half, &Packet::Pingreq).await.is_err() {
                    reader.abort();
                    return;
                }
            }
            _ = &mut reader => {
                return;
            }
        }
    }
}
