//! MQTT 3.1.1 (v4) protocol implementation.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::topic::{validate_topic, validate_topic_filter};
use crate::types::{ConnectFlags, ConnectReturnCode, PacketType, QoS};

use super::codec::{
    read_binary_slice, read_fixed_header, read_string, read_u16, variable_int_len,
    write_binary, write_fixed_header, write_string,
};
use super::{PROTOCOL_LEVEL, PROTOCOL_NAME};

/// MQTT 3.1.1 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Only present on the wire when `qos > 0`.
    pub pkid: u16,
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

/// Subscribe filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReasonCode>,
}

/// Subscribe reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReasonCode {
    Success(QoS),
    Failure,
}

impl SubscribeReasonCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x80 => Some(SubscribeReasonCode::Failure),
            v => QoS::from_u8(v).map(SubscribeReasonCode::Success),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReasonCode::Success(qos) => qos as u8,
            SubscribeReasonCode::Failure => 0x80,
        }
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

/// UNSUBACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
}

// ============================================================================
// Packet parsing
// ============================================================================

impl Packet {
    /// Parse a packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the fixed header or body is still incomplete,
    /// `Ok(Some((packet, consumed)))` once a whole packet is buffered.
    pub fn read(buf: &[u8], max_size: usize) -> Result<Option<(Packet, usize)>> {
        let Some(header) = read_fixed_header(buf)? else {
            return Ok(None);
        };

        if matches!(
            header.packet_type,
            PacketType::PubAck | PacketType::PubRec | PacketType::PubRel | PacketType::PubComp
        ) {
            return Err(ProtocolError::UnsupportedPacketType(header.packet_type as u8).into());
        }

        let total_len = header.header_length + header.remaining_length as usize;
        if total_len > max_size {
            return Err(ProtocolError::PacketTooLarge { size: total_len, max: max_size }.into());
        }

        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[header.header_length..total_len];

        let packet = match header.packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(body)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(body)?),
            PacketType::Publish => Packet::Publish(Publish::read(header.flags, body)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(body)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(body)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::read(body)?),
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::read(body)?),
            PacketType::PingReq => read_empty(body, Packet::PingReq)?,
            PacketType::PingResp => read_empty(body, Packet::PingResp)?,
            PacketType::Disconnect => read_empty(body, Packet::Disconnect)?,
            other => return Err(ProtocolError::UnsupportedPacketType(other as u8).into()),
        };

        Ok(Some((packet, total_len)))
    }

    /// Write packet to buffer.
    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        buf.reserve(self.size());
        match self {
            Packet::Connect(p) => p.write(buf),
            Packet::ConnAck(p) => p.write(buf),
            Packet::Publish(p) => p.write(buf),
            Packet::Subscribe(p) => p.write(buf),
            Packet::SubAck(p) => p.write(buf),
            Packet::Unsubscribe(p) => p.write(buf),
            Packet::UnsubAck(p) => p.write(buf),
            Packet::PingReq => write_fixed_header(buf, PacketType::PingReq, 0, 0),
            Packet::PingResp => write_fixed_header(buf, PacketType::PingResp, 0, 0),
            Packet::Disconnect => write_fixed_header(buf, PacketType::Disconnect, 0, 0),
        }
    }

    /// Encode into a fresh buffer, refusing packets larger than `max_size`.
    pub fn encode(&self, max_size: usize) -> Result<Bytes> {
        let size = self.size();
        if size > max_size {
            return Err(ProtocolError::PacketTooLarge { size, max: max_size }.into());
        }
        let mut buf = BytesMut::with_capacity(size);
        self.write(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Calculate packet size.
    pub fn size(&self) -> usize {
        match self {
            Packet::Connect(p) => p.size(),
            Packet::ConnAck(_) => 4,
            Packet::Publish(p) => p.size(),
            Packet::Subscribe(p) => p.size(),
            Packet::SubAck(p) => p.size(),
            Packet::Unsubscribe(p) => p.size(),
            Packet::UnsubAck(_) => 4,
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 2,
        }
    }

    /// Packet type, for logging.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

fn read_empty(body: &[u8], packet: Packet) -> Result<Packet> {
    if !body.is_empty() {
        return Err(ProtocolError::MalformedPacket("unexpected body").into());
    }
    Ok(packet)
}

fn total_size(remaining: usize) -> usize {
    1 + variable_int_len(remaining as u32) + remaining
}

// ============================================================================
// Individual packet implementations
// ============================================================================

impl Connect {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut pos = 0;

        // Protocol name
        let (name, len) = read_string(buf)?;
        if name != PROTOCOL_NAME {
            return Err(ProtocolError::MalformedPacket("bad protocol name").into());
        }
        pos += len;

        // Protocol level, connect flags, keep alive
        if buf.len() < pos + 4 {
            return Err(ProtocolError::MalformedPacket("truncated connect header").into());
        }
        if buf[pos] != PROTOCOL_LEVEL {
            return Err(ProtocolError::MalformedPacket("unsupported protocol level").into());
        }
        let flags = ConnectFlags::decode(buf[pos + 1])
            .ok_or(ProtocolError::MalformedPacket("invalid connect flags"))?;
        let keep_alive = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]);
        pos += 4;

        // Client ID
        let (client_id, len) = read_string(&buf[pos..])?;
        pos += len;

        // Will fields are skipped, this client never acts on them.
        if flags.will {
            let (_, len) = read_string(&buf[pos..])?;
            pos += len;
            let (_, len) = read_binary_slice(&buf[pos..])?;
            pos += len;
        }

        let username = if flags.username {
            let (u, len) = read_string(&buf[pos..])?;
            pos += len;
            Some(u)
        } else {
            None
        };

        let password = if flags.password {
            let (p, len) = read_binary_slice(&buf[pos..])?;
            pos += len;
            Some(Bytes::copy_from_slice(p))
        } else {
            None
        };

        if pos != buf.len() {
            return Err(ProtocolError::MalformedPacket("trailing bytes in connect").into());
        }

        Ok(Connect {
            client_id,
            keep_alive,
            clean_session: flags.clean_session,
            username,
            password,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let mut pos = write_fixed_header(buf, PacketType::Connect, 0, self.remaining_length())?;

        pos += write_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_LEVEL);

        let flags = ConnectFlags {
            clean_session: self.clean_session,
            username: self.username.is_some(),
            password: self.password.is_some(),
            ..Default::default()
        };
        buf.put_u8(flags.encode());
        buf.put_u16(self.keep_alive);
        pos += 4;

        pos += write_string(buf, &self.client_id)?;

        if let Some(ref username) = self.username {
            pos += write_string(buf, username)?;
        }
        if let Some(ref password) = self.password {
            pos += write_binary(buf, password)?;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2 + 4 + 1 + 1 + 2; // protocol name + level + flags + keep_alive
        len += 2 + self.client_id.len();

        if let Some(ref username) = self.username {
            len += 2 + username.len();
        }
        if let Some(ref password) = self.password {
            len += 2 + password.len();
        }

        len
    }

    pub fn size(&self) -> usize {
        total_size(self.remaining_length())
    }
}

impl ConnAck {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() != 2 {
            return Err(ProtocolError::MalformedPacket("connack length").into());
        }
        if buf[0] & 0xFE != 0 {
            return Err(ProtocolError::MalformedPacket("connack reserved bits").into());
        }

        let session_present = buf[0] & 0x01 != 0;
        let code = ConnectReturnCode::from_u8(buf[1]).ok_or(ProtocolError::InvalidReturnCode(buf[1]))?;

        Ok(ConnAck { session_present, code })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        write_fixed_header(buf, PacketType::ConnAck, 0, 2)?;
        buf.put_u8(if self.session_present { 0x01 } else { 0x00 });
        buf.put_u8(self.code as u8);
        Ok(4)
    }
}

impl Publish {
    pub fn read(flags: u8, buf: &[u8]) -> Result<Self> {
        let dup = flags & 0x08 != 0;
        let qos = QoS::from_u8((flags >> 1) & 0x03).ok_or(ProtocolError::InvalidQoS((flags >> 1) & 0x03))?;
        let retain = flags & 0x01 != 0;

        if dup && qos == QoS::AtMostOnce {
            return Err(ProtocolError::MalformedPacket("dup set on qos 0 publish").into());
        }

        let (topic, mut pos) = read_string(buf)?;
        validate_topic(&topic)?;

        let pkid = if qos != QoS::AtMostOnce {
            let id = read_u16(&buf[pos..]).ok_or(ProtocolError::MalformedPacket("missing packet id"))?;
            if id == 0 {
                return Err(ProtocolError::MalformedPacket("zero packet id").into());
            }
            pos += 2;
            id
        } else {
            0
        };

        let payload = Bytes::copy_from_slice(&buf[pos..]);

        Ok(Publish { topic, payload, qos, retain, dup, pkid })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }

        let mut pos = write_fixed_header(buf, PacketType::Publish, flags, self.remaining_length())?;
        pos += write_string(buf, &self.topic)?;

        if self.qos != QoS::AtMostOnce {
            buf.put_u16(self.pkid);
            pos += 2;
        }

        buf.put_slice(&self.payload);
        pos += self.payload.len();

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2 + self.topic.len() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len
    }

    pub fn size(&self) -> usize {
        total_size(self.remaining_length())
    }
}

impl Subscribe {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let pkid = read_nonzero_pkid(buf)?;
        let mut pos = 2;

        let mut filters = Vec::new();
        while pos < buf.len() {
            let (path, len) = read_string(&buf[pos..])?;
            validate_topic_filter(&path)?;
            pos += len;

            let Some(&options) = buf.get(pos) else {
                return Err(ProtocolError::MalformedPacket("missing requested qos").into());
            };
            if options & 0xFC != 0 {
                return Err(ProtocolError::MalformedPacket("subscribe options reserved bits").into());
            }
            let qos = QoS::from_u8(options).ok_or(ProtocolError::InvalidQoS(options))?;
            pos += 1;

            filters.push(SubscribeFilter { path, qos });
        }

        if filters.is_empty() {
            return Err(ProtocolError::MalformedPacket("subscribe without filters").into());
        }

        Ok(Subscribe { pkid, filters })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let mut pos = write_fixed_header(buf, PacketType::Subscribe, 0x02, self.remaining_length())?;

        buf.put_u16(self.pkid);
        pos += 2;

        for filter in &self.filters {
            pos += write_string(buf, &filter.path)?;
            buf.put_u8(filter.qos as u8);
            pos += 1;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        2 + self.filters.iter().map(|f| 2 + f.path.len() + 1).sum::<usize>()
    }

    pub fn size(&self) -> usize {
        total_size(self.remaining_length())
    }
}

impl SubAck {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let pkid = read_nonzero_pkid(buf)?;

        if buf.len() == 2 {
            return Err(ProtocolError::MalformedPacket("suback without return codes").into());
        }

        let return_codes = buf[2..]
            .iter()
            .map(|&b| SubscribeReasonCode::from_u8(b).ok_or(ProtocolError::MalformedPacket("invalid suback return code")))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(SubAck { pkid, return_codes })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let pos = write_fixed_header(buf, PacketType::SubAck, 0, self.remaining_length())?;
        buf.put_u16(self.pkid);
        for code in &self.return_codes {
            buf.put_u8(code.to_u8());
        }
        Ok(pos + self.remaining_length())
    }

    fn remaining_length(&self) -> usize {
        2 + self.return_codes.len()
    }

    pub fn size(&self) -> usize {
        total_size(self.remaining_length())
    }
}

impl Unsubscribe {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let pkid = read_nonzero_pkid(buf)?;
        let mut pos = 2;

        let mut topics = Vec::new();
        while pos < buf.len() {
            let (filter, len) = read_string(&buf[pos..])?;
            validate_topic_filter(&filter)?;
            pos += len;
            topics.push(filter);
        }

        if topics.is_empty() {
            return Err(ProtocolError::MalformedPacket("unsubscribe without filters").into());
        }

        Ok(Unsubscribe { pkid, topics })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let mut pos = write_fixed_header(buf, PacketType::Unsubscribe, 0x02, self.remaining_length())?;

        buf.put_u16(self.pkid);
        pos += 2;

        for t in &self.topics {
            pos += write_string(buf, t)?;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        2 + self.topics.iter().map(|t| 2 + t.len()).sum::<usize>()
    }

    pub fn size(&self) -> usize {
        total_size(self.remaining_length())
    }
}

impl UnsubAck {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() != 2 {
            return Err(ProtocolError::MalformedPacket("unsuback length").into());
        }
        Ok(UnsubAck { pkid: read_nonzero_pkid(buf)? })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        write_fixed_header(buf, PacketType::UnsubAck, 0, 2)?;
        buf.put_u16(self.pkid);
        Ok(4)
    }
}

fn read_nonzero_pkid(buf: &[u8]) -> Result<u16> {
    match read_u16(buf) {
        Some(0) => Err(ProtocolError::MalformedPacket("zero packet id").into()),
        Some(pkid) => Ok(pkid),
        None => Err(ProtocolError::MalformedPacket("missing packet id").into()),
    }
}

// ============================================================================
// Packet constructors
// ============================================================================

/// Create a CONNECT packet.
pub fn create_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&[u8]>,
    keep_alive: u16,
    clean_session: bool,
) -> Packet {
    Packet::Connect(Connect {
        client_id: client_id.to_string(),
        keep_alive,
        clean_session,
        username: username.map(str::to_string),
        // A password is only legal alongside a user name.
        password: username.and(password).map(Bytes::copy_from_slice),
    })
}

/// Create a CONNACK packet.
pub fn create_connack(session_present: bool, code: ConnectReturnCode) -> Packet {
    Packet::ConnAck(ConnAck { session_present, code })
}

/// Create a PUBLISH packet (QoS 0).
pub fn create_publish(topic: &str, payload: Bytes, retain: bool) -> Packet {
    Packet::Publish(Publish {
        topic: topic.to_string(),
        payload,
        qos: QoS::AtMostOnce,
        retain,
        dup: false,
        pkid: 0,
    })
}

/// Create a SUBSCRIBE packet.
pub fn create_subscribe(pkid: u16, filters: &[(&str, QoS)]) -> Packet {
    Packet::Subscribe(Subscribe {
        pkid,
        filters: filters
            .iter()
            .map(|(path, qos)| SubscribeFilter { path: path.to_string(), qos: *qos })
            .collect(),
    })
}

/// Create a SUBACK packet.
pub fn create_suback(pkid: u16, return_codes: Vec<SubscribeReasonCode>) -> Packet {
    Packet::SubAck(SubAck { pkid, return_codes })
}

/// Create an UNSUBSCRIBE packet.
pub fn create_unsubscribe(pkid: u16, topics: &[&str]) -> Packet {
    Packet::Unsubscribe(Unsubscribe {
        pkid,
        topics: topics.iter().map(|t| t.to_string()).collect(),
    })
}

/// Create an UNSUBACK packet.
pub fn create_unsuback(pkid: u16) -> Packet {
    Packet::UnsubAck(UnsubAck { pkid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    const MAX_TEST_SIZE: usize = 1024;

    fn encode(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        let written = packet.write(&mut buf).unwrap();
        assert_eq!(written, buf.len());
        assert_eq!(written, packet.size());
        buf
    }

    fn decode(buf: &[u8]) -> Packet {
        let (packet, consumed) = Packet::read(buf, usize::MAX).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        packet
    }

    fn protocol_error(buf: &[u8]) -> ProtocolError {
        match Packet::read(buf, usize::MAX) {
            Err(Error::Protocol(e)) => e,
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_connect() {
        let packet = create_connect("id-123456", Some("user"), Some(b"pass"), 60, true);
        let buf = encode(&packet);
        assert_eq!(&buf[..2], &[0x10, 33]);
        assert_eq!(&buf[2..10], b"\x00\x04MQTT\x04\xC2");
        assert_eq!(decode(&buf), packet);
    }

    #[test]
    fn test_connect_password_requires_username() {
        let Packet::Connect(connect) = create_connect("c", None, Some(b"pass"), 0, true) else {
            panic!("expected connect");
        };
        assert!(connect.password.is_none());
    }

    #[test]
    fn test_connack() {
        let buf = encode(&create_connack(false, ConnectReturnCode::Accepted));
        assert_eq!(&buf[..], &[0x20, 0x02, 0x00, 0x00]);

        match decode(&[0x20, 0x02, 0x00, 0x05]) {
            Packet::ConnAck(ack) => assert_eq!(ack.code, ConnectReturnCode::NotAuthorized),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(protocol_error(&[0x20, 0x02, 0x00, 0x06]), ProtocolError::InvalidReturnCode(6));
        assert!(matches!(protocol_error(&[0x20, 0x02, 0x02, 0x00]), ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn test_publish_payload_sizes() {
        for size in [0usize, 1, 127, 128, 16383, 16384] {
            let payload = Bytes::from(vec![0xA5u8; size]);
            let packet = create_publish("a/b", payload.clone(), false);
            let buf = encode(&packet);

            match decode(&buf) {
                Packet::Publish(p) => {
                    assert_eq!(p.topic, "a/b");
                    assert_eq!(p.payload, payload);
                    assert_eq!(p.qos, QoS::AtMostOnce);
                    assert!(!p.retain);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_publish_wire_format() {
        let buf = encode(&create_publish("a/b", Bytes::from_static(b"hi"), true));
        assert_eq!(&buf[..], b"\x31\x07\x00\x03a/bhi");
    }

    #[test]
    fn test_publish_qos1_inbound() {
        let buf = b"\x32\x07\x00\x01t\x00\x0Axy";
        match decode(buf) {
            Packet::Publish(p) => {
                assert_eq!(p.qos, QoS::AtLeastOnce);
                assert_eq!(p.pkid, 10);
                assert_eq!(&p.payload[..], b"xy");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_publish_invalid_topic() {
        // wildcard in a topic name
        let err = protocol_error(b"\x30\x05\x00\x03a/#");
        assert!(matches!(err, ProtocolError::InvalidTopic(_)));

        // empty topic
        let err = protocol_error(b"\x30\x02\x00\x00");
        assert!(matches!(err, ProtocolError::InvalidTopic(_)));
    }

    #[test]
    fn test_incremental_decode() {
        let mut stream = BytesMut::new();
        create_publish("sensors/1/temp", Bytes::from_static(b"21.5"), false)
            .write(&mut stream)
            .unwrap();
        Packet::PingResp.write(&mut stream).unwrap();

        let mut fed = Vec::new();
        let mut packets = Vec::new();
        for &byte in stream.iter() {
            fed.push(byte);
            while let Some((packet, consumed)) = Packet::read(&fed, MAX_TEST_SIZE).unwrap() {
                fed.drain(..consumed);
                packets.push(packet);
            }
        }

        assert!(fed.is_empty());
        assert_eq!(packets.len(), 2);
        assert!(matches!(packets[0], Packet::Publish(ref p) if p.topic == "sensors/1/temp"));
        assert_eq!(packets[1], Packet::PingResp);
    }

    #[test]
    fn test_subscribe() {
        let packet = create_subscribe(7, &[("sensors/+/temp", QoS::AtMostOnce), ("alerts/#", QoS::AtMostOnce)]);
        let buf = encode(&packet);
        assert_eq!(buf[0], 0x82);
        assert_eq!(decode(&buf), packet);
    }

    #[test]
    fn test_subscribe_invalid() {
        // filter with # not in last level
        let err = protocol_error(b"\x82\x08\x00\x01\x00\x03#/a\x00");
        assert!(matches!(err, ProtocolError::InvalidTopicFilter(_)));

        // zero packet id
        let err = protocol_error(b"\x82\x06\x00\x00\x00\x01a\x00");
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));

        // no filters at all
        let err = protocol_error(b"\x82\x02\x00\x01");
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn test_suback() {
        let packet = create_suback(7, vec![SubscribeReasonCode::Success(QoS::AtMostOnce), SubscribeReasonCode::Failure]);
        let buf = encode(&packet);
        assert_eq!(&buf[..], &[0x90, 0x04, 0x00, 0x07, 0x00, 0x80]);
        assert_eq!(decode(&buf), packet);

        let err = protocol_error(&[0x90, 0x03, 0x00, 0x07, 0x03]);
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn test_unsubscribe() {
        let packet = create_unsubscribe(9, &["a/b", "c/+"]);
        let buf = encode(&packet);
        assert_eq!(buf[0], 0xA2);
        assert_eq!(decode(&buf), packet);

        let buf = encode(&create_unsuback(9));
        assert_eq!(&buf[..], &[0xB0, 0x02, 0x00, 0x09]);
        assert_eq!(decode(&buf), Packet::UnsubAck(UnsubAck { pkid: 9 }));
    }

    #[test]
    fn test_simple_packets() {
        assert_eq!(&encode(&Packet::PingReq)[..], &[0xC0, 0x00]);
        assert_eq!(&encode(&Packet::PingResp)[..], &[0xD0, 0x00]);
        assert_eq!(&encode(&Packet::Disconnect)[..], &[0xE0, 0x00]);

        assert!(matches!(protocol_error(&[0xD0, 0x01, 0x00]), ProtocolError::MalformedPacket(_)));
    }

    #[test]
    fn test_unsupported_qos_flows() {
        for first in [0x40u8, 0x50, 0x62, 0x70] {
            assert_eq!(protocol_error(&[first, 0x02, 0x00, 0x01]), ProtocolError::UnsupportedPacketType(first >> 4));
        }
    }

    #[test]
    fn test_incomplete() {
        let buf = encode(&create_publish("a/b", Bytes::from_static(b"hello"), false));
        for end in 0..buf.len() {
            assert!(Packet::read(&buf[..end], usize::MAX).unwrap().is_none());
        }
    }

    #[test]
    fn test_packet_too_large() {
        let packet = create_publish("a/b", Bytes::from(vec![0u8; 200]), false);
        let buf = encode(&packet);

        // rejected from the header alone
        match Packet::read(&buf[..3], 100) {
            Err(Error::Protocol(ProtocolError::PacketTooLarge { max: 100, .. })) => {}
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            packet.encode(100),
            Err(Error::Protocol(ProtocolError::PacketTooLarge { .. }))
        ));
        assert_eq!(packet.encode(1024).unwrap().len(), buf.len());
    }
}
