//! MQTT 3.1.1 packet codec.
//!
//! The proxy rewrites CONNECT, SUBSCRIBE and SUBACK packets in flight, so it
//! needs full packet framing rather than a client library. Packets re-encode
//! from their parsed form; remaining lengths are always recomputed.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const CONNACK_SERVER_UNAVAILABLE: u8 = 0x03;
pub const CONNACK_NOT_AUTHORIZED: u8 = 0x05;

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connack {
    pub session_present: bool,
    pub return_code: u8,
}

impl Connack {
    pub fn refused(return_code: u8) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic: String,
    /// Present when qos > 0.
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    /// (topic filter, requested qos) pairs.
    pub topics: Vec<(String, u8)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

fn malformed(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Read one packet from the stream.
pub async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Packet> {
    let first = r.read_u8().await?;
    let mut remaining: usize = 0;
    let mut shift = 0u32;
    loop {
        let byte = r.read_u8().await?;
        remaining |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(malformed("remaining length too long"));
        }
    }
    let mut body = vec![0u8; remaining];
    r.read_exact(&mut body).await?;
    decode(first, &body)
}

/// Encode and write one packet.
pub async fn write_packet<W: AsyncWrite + Unpin>(w: &mut W, packet: &Packet) -> io::Result<()> {
    w.write_all(&encode(packet)).await?;
    w.flush().await
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> io::Result<u8> {
        if self.remaining() < 1 {
            return Err(malformed("truncated packet"));
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> io::Result<u16> {
        Ok(((self.u8()? as u16) << 8) | self.u8()? as u16)
    }

    fn bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = self.u16()? as usize;
        if self.remaining() < len {
            return Err(malformed("truncated field"));
        }
        let v = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(v)
    }

    fn string(&mut self) -> io::Result<String> {
        String::from_utf8(self.bytes()?).map_err(|_| malformed("invalid UTF-8 string"))
    }

    fn rest(&mut self) -> Vec<u8> {
        let v = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        v
    }
}

fn decode(first: u8, body: &[u8]) -> io::Result<Packet> {
    let packet_type = first >> 4;
    let flags = first & 0x0f;
    let mut r = Reader::new(body);

    match packet_type {
        1 => {
            let protocol_name = r.string()?;
            let protocol_level = r.u8()?;
            let connect_flags = r.u8()?;
            let keep_alive = r.u16()?;
            let client_id = r.string()?;
            let will = if connect_flags & 0x04 != 0 {
                Some(Will {
                    topic: r.string()?,
                    message: r.bytes()?,
                    qos: (connect_flags >> 3) & 0x03,
                    retain: connect_flags & 0x20 != 0,
                })
            } else {
                None
            };
            let username = if connect_flags & 0x80 != 0 {
                Some(r.string()?)
            } else {
                None
            };
            let password = if connect_flags & 0x40 != 0 {
                Some(r.bytes()?)
            } else {
                None
            };
            Ok(Packet::Connect(Connect {
                protocol_name,
                protocol_level,
                clean_session: connect_flags & 0x02 != 0,
                keep_alive,
                client_id,
                will,
                username,
                password,
            }))
        }
        2 => Ok(Packet::Connack(Connack {
            session_present: r.u8()? & 0x01 != 0,
            return_code: r.u8()?,
        })),
        3 => {
            let qos = (flags >> 1) & 0x03;
            let topic = r.string()?;
            let packet_id = if qos > 0 { Some(r.u16()?) } else { None };
            Ok(Packet::Publish(Publish {
                dup: flags & 0x08 != 0,
                qos,
                retain: flags & 0x01 != 0,
                topic,
                packet_id,
                payload: r.rest(),
            }))
        }
        4 => Ok(Packet::Puback {
            packet_id: r.u16()?,
        }),
        5 => Ok(Packet::Pubrec {
            packet_id: r.u16()?,
        }),
        6 => Ok(Packet::Pubrel {
            packet_id: r.u16()?,
        }),
        7 => Ok(Packet::Pubcomp {
            packet_id: r.u16()?,
        }),
        8 => {
            let packet_id = r.u16()?;
            let mut topics = Vec::new();
            while r.remaining() > 0 {
                let topic = r.string()?;
                let qos = r.u8()? & 0x03;
                topics.push((topic, qos));
            }
            Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
        }
        9 => {
            let packet_id = r.u16()?;
            Ok(Packet::Suback(Suback {
                packet_id,
                return_codes: r.rest(),
            }))
        }
        10 => {
            let packet_id = r.u16()?;
            let mut topics = Vec::new();
            while r.remaining() > 0 {
                topics.push(r.string()?);
            }
            Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
        }
        11 => Ok(Packet::Unsuback {
            packet_id: r.u16()?,
        }),
        12 => Ok(Packet::Pingreq),
        13 => Ok(Packet::Pingresp),
        14 => Ok(Packet::Disconnect),
        _ => Err(malformed("unknown packet type")),
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.u16(v.len() as u16);
        self.buf.extend_from_slice(v);
    }

    fn string(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }
}

/// Encode a packet with a freshly computed remaining length.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut w = Writer::new();
    let first: u8 = match packet {
        Packet::Connect(c) => {
            w.string(&c.protocol_name);
            w.u8(c.protocol_level);
            let mut flags = 0u8;
            if c.clean_session {
                flags |= 0x02;
            }
            if let Some(will) = &c.will {
                flags |= 0x04 | (will.qos << 3);
                if will.retain {
                    flags |= 0x20;
                }
            }
            if c.password.is_some() {
                flags |= 0x40;
            }
            if c.username.is_some() {
                flags |= 0x80;
            }
            w.u8(flags);
            w.u16(c.keep_alive);
            w.string(&c.client_id);
            if let Some(will) = &c.will {
                w.string(&will.topic);
                w.bytes(&will.message);
            }
            if let Some(username) = &c.username {
                w.string(username);
            }
            if let Some(password) = &c.password {
                w.bytes(password);
            }
            0x10
        }
        Packet::Connack(c) => {
            w.u8(c.session_present as u8);
            w.u8(c.return_code);
            0x20
        }
        Packet::Publish(p) => {
            w.string(&p.topic);
            if p.qos > 0 {
                w.u16(p.packet_id.unwrap_or(0));
            }
            w.buf.extend_from_slice(&p.payload);
            0x30 | ((p.dup as u8) << 3) | (p.qos << 1) | p.retain as u8
        }
        Packet::Puback { packet_id } => {
            w.u16(*packet_id);
            0x40
        }
        Packet::Pubrec { packet_id } => {
            w.u16(*packet_id);
            0x50
        }
        Packet::Pubrel { packet_id } => {
            w.u16(*packet_id);
            0x62
        }
        Packet::Pubcomp { packet_id } => {
            w.u16(*packet_id);
            0x70
        }
        Packet::Subscribe(s) => {
            w.u16(s.packet_id);
            for (topic, qos) in &s.topics {
                w.string(topic);
                w.u8(*qos);
            }
            0x82
        }
        Packet::Suback(s) => {
            w.u16(s.packet_id);
            w.buf.extend_from_slice(&s.return_codes);
            0x90
        }
        Packet::Unsubscribe(u) => {
            w.u16(u.packet_id);
            for topic in &u.topics {
                w.string(topic);
            }
            0xa2
        }
        Packet::Unsuback { packet_id } => {
            w.u16(*packet_id);
            0xb0
        }
        Packet::Pingreq => 0xc0,
        Packet::Pingresp => 0xd0,
        Packet::Disconnect => 0xe0,
    };

    let mut out = Vec::with_capacity(w.buf.len() + 5);
    out.push(first);
    let mut remaining = w.buf.len();
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if remaining == 0 {
            break;
        }
    }
    out.extend_from_slice(&w.buf);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(packet: Packet) -> Packet {
        let encoded = encode(&packet);
        let mut cursor = std::io::Cursor::new(encoded);
        read_packet(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_round_trip() {
        let connect = Packet::Connect(Connect {
            protocol_name: "MQTT".into(),
            protocol_level: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: "sensor-7".into(),
            will: Some(Will {
                topic: "sensor-7/status".into(),
                message: b"offline".to_vec(),
                qos: 1,
                retain: true,
            }),
            username: Some("sensor-7".into()),
            password: Some(b"hunter2".to_vec()),
        });
        assert_eq!(round_trip(connect.clone()).await, connect);
    }

    #[tokio::test]
    async fn test_connect_rewrite_recomputes_length() {
        let mut connect = Connect {
            protocol_name: "MQTT".into(),
            protocol_level: 4,
            clean_session: true,
            keep_alive: 30,
            client_id: "c".into(),
            will: None,
            username: Some("user".into()),
            password: Some(b"pass".to_vec()),
        };
        connect.username = None;
        connect.password = None;
        connect.client_id = "ug-c".into();
        let decoded = round_trip(Packet::Connect(connect.clone())).await;
        assert_eq!(decoded, Packet::Connect(connect));
    }

    #[tokio::test]
    async fn test_publish_qos_levels() {
        let qos0 = Packet::Publish(Publish {
            dup: false,
            qos: 0,
            retain: false,
            topic: "a/b".into(),
            packet_id: None,
            payload: b"x".to_vec(),
        });
        assert_eq!(round_trip(qos0.clone()).await, qos0);

        let qos1 = Packet::Publish(Publish {
            dup: true,
            qos: 1,
            retain: true,
            topic: "a/b".into(),
            packet_id: Some(99),
            payload: vec![0, 1, 2, 3],
        });
        assert_eq!(round_trip(qos1.clone()).await, qos1);
    }

    #[tokio::test]
    async fn test_subscribe_suback() {
        let sub = Packet::Subscribe(Subscribe {
            packet_id: 7,
            topics: vec![("a/in".into(), 1), ("a/#".into(), 2)],
        });
        assert_eq!(round_trip(sub.clone()).await, sub);

        let ack = Packet::Suback(Suback {
            packet_id: 7,
            return_codes: vec![1, 0x80],
        });
        assert_eq!(round_trip(ack.clone()).await, ack);
    }

    #[tokio::test]
    async fn test_large_remaining_length() {
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: 0,
            retain: false,
            topic: "big".into(),
            packet_id: None,
            payload: vec![0xab; 100_000],
        });
        assert_eq!(round_trip(publish.clone()).await, publish);
    }

    #[tokio::test]
    async fn test_control_packets() {
        for packet in [
            Packet::Pingreq,
            Packet::Pingresp,
            Packet::Disconnect,
            Packet::Puback { packet_id: 3 },
            Packet::Pubrel { packet_id: 4 },
            Packet::Unsuback { packet_id: 5 },
        ] {
            assert_eq!(round_trip(packet.clone()).await, packet);
        }
    }
}
