//! The bi-directional splice between an authenticated client and the broker.

use super::acl::{Acl, Classification};
use super::codec::{self, Connack, Packet, Suback, Subscribe};
use crate::backends::BoxedStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use ubergang_common::MqttClient;

struct PendingSubscription {
    client_subscribe: Subscribe,
    broker_subscribe: Subscribe,
}

pub struct Splice {
    pub conn_id: i64,
    pub client: MqttClient,
    pub acl: Acl,
    pub closer: Arc<Notify>,
}

type ClientWriter = Arc<tokio::sync::Mutex<WriteHalf<BoxedStream>>>;

impl Splice {
    /// Run the splice until either side closes or a force-disconnect fires.
    /// CONNECT/CONNACK have already been exchanged.
    pub async fn run(self, client_stream: BoxedStream, broker_stream: TcpStream) {
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (broker_read, broker_write) = tokio::io::split(Box::new(broker_stream) as BoxedStream);
        let client_write: ClientWriter = Arc::new(tokio::sync::Mutex::new(client_write));
        let pending = Arc::new(Mutex::new(HashMap::new()));

        let closer = self.closer.clone();
        tokio::select! {
            _ = self.client_to_broker(client_read, broker_write, client_write.clone(), pending.clone()) => {}
            _ = self.broker_to_client(broker_read, client_write.clone(), pending) => {}
            _ = closer.notified() => {
                info!("mqtt/c{}/{}: force disconnect", self.conn_id, self.client.id);
            }
        }
        let _ = client_write.lock().await.shutdown().await;
    }

    async fn client_to_broker(
        &self,
        mut client_read: ReadHalf<BoxedStream>,
        mut broker_write: WriteHalf<BoxedStream>,
        client_write: ClientWriter,
        pending: Arc<Mutex<HashMap<u16, PendingSubscription>>>,
    ) {
        let client_id = &self.client.id;
        let profile_id = &self.client.profile_id;
        loop {
            let packet = match codec::read_packet(&mut client_read).await {
                Ok(packet) => packet,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        debug!("mqtt/c{}/{}: failed to read packet: {e}", self.conn_id, client_id);
                    }
                    return;
                }
            };
            metrics::counter!("ubermqtt_packets_client_total").increment(1);

            let forward = match packet {
                Packet::Subscribe(subscribe) => {
                    let mut allowed = Vec::new();
                    for (topic, qos) in &subscribe.topics {
                        let class = self.acl.validate_subscribe_topic(topic);
                        if class == Classification::Allowed {
                            allowed.push((topic.clone(), *qos));
                        }
                        metrics::counter!(
                            "ubermqtt_subscribe_topics_total",
                            "account" => client_id.clone(),
                            "profile" => profile_id.clone(),
                            "topic_class" => class.as_str(),
                        )
                        .increment(1);
                        info!(
                            "mqtt/c{}/{}: subscribe to {topic} ({})",
                            self.conn_id,
                            client_id,
                            class.as_str()
                        );
                    }
                    let broker_subscribe = Subscribe {
                        packet_id: subscribe.packet_id,
                        topics: allowed,
                    };
                    if broker_subscribe.topics.is_empty() {
                        // Nothing survives the ACL: answer locally with the
                        // requested QoS values so the client sees a silent
                        // drop, and leave the broker alone.
                        debug!("mqtt/c{}/{}: subscribe contains no valid topics", self.conn_id, client_id);
                        let ack = create_client_suback(&subscribe, &broker_subscribe, None);
                        let mut w = client_write.lock().await;
                        if codec::write_packet(&mut *w, &Packet::Suback(ack)).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    pending.lock().insert(
                        subscribe.packet_id,
                        PendingSubscription {
                            client_subscribe: subscribe,
                            broker_subscribe: broker_subscribe.clone(),
                        },
                    );
                    Packet::Subscribe(broker_subscribe)
                }
                Packet::Publish(mut publish) => {
                    let class = self.acl.validate_publish_topic(&publish.topic);
                    if class == Classification::Blocked {
                        publish.topic =
                            format!("_ug/pub/blocked/{}/{}", client_id, publish.topic);
                    }
                    metrics::counter!(
                        "ubermqtt_publish_total",
                        "account" => client_id.clone(),
                        "profile" => profile_id.clone(),
                        "topic_class" => class.as_str(),
                    )
                    .increment(1);
                    Packet::Publish(publish)
                }
                Packet::Disconnect => {
                    let _ = codec::write_packet(&mut broker_write, &Packet::Disconnect).await;
                    info!("mqtt/c{}/{}: received DISCONNECT - closing connection", self.conn_id, client_id);
                    return;
                }
                p @ (Packet::Puback { .. }
                | Packet::Pubrec { .. }
                | Packet::Pubrel { .. }
                | Packet::Pubcomp { .. }
                | Packet::Unsubscribe(_)
                | Packet::Pingreq) => p,
                other => {
                    warn!("mqtt/c{}/{}: unexpected packet: {other:?}", self.conn_id, client_id);
                    continue;
                }
            };

            if codec::write_packet(&mut broker_write, &forward).await.is_err() {
                return;
            }
        }
    }

    async fn broker_to_client(
        &self,
        mut broker_read: ReadHalf<BoxedStream>,
        client_write: ClientWriter,
        pending: Arc<Mutex<HashMap<u16, PendingSubscription>>>,
    ) {
        let client_id = &self.client.id;
        loop {
            let packet = match codec::read_packet(&mut broker_read).await {
                Ok(packet) => packet,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        warn!("mqtt/c{}/{}/broker: failed to read packet: {e}", self.conn_id, client_id);
                    }
                    return;
                }
            };
            metrics::counter!("ubermqtt_packets_broker_total").increment(1);

            let forward = match packet {
                Packet::Suback(ack) => {
                    let entry = pending.lock().remove(&ack.packet_id);
                    match entry {
                        None => {
                            warn!(
                                "mqtt/c{}/{}: received unsolicited SUBACK from broker (id {})",
                                self.conn_id, client_id, ack.packet_id
                            );
                            continue;
                        }
                        Some(sub) => Packet::Suback(create_client_suback(
                            &sub.client_subscribe,
                            &sub.broker_subscribe,
                            Some(&ack),
                        )),
                    }
                }
                Packet::Publish(publish) => {
                    metrics::counter!(
                        "ubermqtt_subscribe_messages_total",
                        "account" => client_id.clone(),
                        "profile" => self.client.profile_id.clone(),
                    )
                    .increment(1);
                    Packet::Publish(publish)
                }
                p @ (Packet::Puback { .. }
                | Packet::Pubrec { .. }
                | Packet::Pubrel { .. }
                | Packet::Pubcomp { .. }
                | Packet::Unsuback { .. }
                | Packet::Pingresp) => p,
                other => {
                    warn!("mqtt/c{}/{}/broker: unexpected packet: {other:?}", self.conn_id, client_id);
                    continue;
                }
            };

            let mut w = client_write.lock().await;
            if codec::write_packet(&mut *w, &forward).await.is_err() {
                return;
            }
        }
    }
}

pub fn connection_refused() -> Connack {
    Connack::refused(codec::CONNACK_NOT_AUTHORIZED)
}

pub fn server_unavailable() -> Connack {
    Connack::refused(codec::CONNACK_SERVER_UNAVAILABLE)
}

/// Build the client-visible SUBACK: broker-granted codes for topics that went
/// upstream, the originally requested QoS for blocked topics (so the client
/// experiences a silent drop rather than an error).
fn create_client_suback(
    client_sub: &Subscribe,
    broker_sub: &Subscribe,
    broker_ack: Option<&Suback>,
) -> Suback {
    let mut broker_granted: HashMap<&str, u8> = HashMap::new();
    if let Some(ack) = broker_ack {
        for (idx, (topic, _)) in broker_sub.topics.iter().enumerate() {
            let code = ack.return_codes.get(idx).copied().unwrap_or_else(|| {
                warn!("broker SUBACK missing return code for {topic}");
                0x80
            });
            broker_granted.insert(topic.as_str(), code);
        }
    }

    Suback {
        packet_id: client_sub.packet_id,
        return_codes: client_sub
            .topics
            .iter()
            .map(|(topic, qos)| broker_granted.get(topic.as_str()).copied().unwrap_or(*qos))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe(id: u16, topics: &[(&str, u8)]) -> Subscribe {
        Subscribe {
            packet_id: id,
            topics: topics.iter().map(|(t, q)| (t.to_string(), *q)).collect(),
        }
    }

    #[test]
    fn test_suback_mixes_broker_and_requested_codes() {
        let client_sub = subscribe(7, &[("C1/in", 1), ("C1/foo", 2)]);
        let broker_sub = subscribe(7, &[("C1/in", 1)]);
        let broker_ack = Suback {
            packet_id: 7,
            return_codes: vec![0],
        };
        let ack = create_client_suback(&client_sub, &broker_sub, Some(&broker_ack));
        assert_eq!(ack.packet_id, 7);
        // Broker's code for the granted topic, requested QoS for the blocked one.
        assert_eq!(ack.return_codes, vec![0, 2]);
    }

    #[test]
    fn test_suback_all_blocked_uses_requested_qos() {
        let client_sub = subscribe(3, &[("x", 0), ("y", 1), ("z", 2)]);
        let broker_sub = subscribe(3, &[]);
        let ack = create_client_suback(&client_sub, &broker_sub, None);
        assert_eq!(ack.return_codes, vec![0, 1, 2]);
    }

    #[test]
    fn test_suback_short_broker_answer_fails_topic() {
        let client_sub = subscribe(9, &[("a", 1), ("b", 1)]);
        let broker_sub = subscribe(9, &[("a", 1), ("b", 1)]);
        let broker_ack = Suback {
            packet_id: 9,
            return_codes: vec![1],
        };
        let ack = create_client_suback(&client_sub, &broker_sub, Some(&broker_ack));
        assert_eq!(ack.return_codes, vec![1, 0x80]);
    }
}
