//! Common types for mqttc.

use bytes::Bytes;
use std::fmt;

/// Quality of Service level.
///
/// Only QoS 0 is sent by this crate; the other levels exist so inbound
/// packets and broker grants can be represented faithfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery.
    AtLeastOnce = 1,
    /// Exactly once delivery.
    ExactlyOnce = 2,
}

impl QoS {
    /// Parse the two QoS bits. Returns `None` for the reserved value 3.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// MQTT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// QoS the message was delivered with.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
}

impl Message {
    /// Create a new QoS 0 message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Payload as UTF-8, if it is valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// CONNACK return code (MQTT 3.1.1, section 3.2.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNamePassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ConnectReturnCode::Accepted),
            1 => Some(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Some(ConnectReturnCode::IdentifierRejected),
            3 => Some(ConnectReturnCode::ServerUnavailable),
            4 => Some(ConnectReturnCode::BadUserNamePassword),
            5 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ConnectReturnCode::Accepted => "accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectReturnCode::IdentifierRejected => "identifier rejected",
            ConnectReturnCode::ServerUnavailable => "server unavailable",
            ConnectReturnCode::BadUserNamePassword => "bad user name or password",
            ConnectReturnCode::NotAuthorized => "not authorized",
        };
        write!(f, "{}", reason)
    }
}

/// Control packet type (upper nibble of the first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }

    /// Flags the fixed header must carry for this type (PUBLISH excluded).
    pub fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}

/// Parsed fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
    /// Bytes used by the fixed header itself (type byte + varint).
    pub header_length: usize,
}

/// CONNECT flags byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectFlags {
    pub username: bool,
    pub password: bool,
    pub will_retain: bool,
    pub will_qos: QoS,
    pub will: bool,
    pub clean_session: bool,
}

impl ConnectFlags {
    pub fn encode(&self) -> u8 {
        let mut b = 0u8;
        if self.username {
            b |= 0x80;
        }
        if self.password {
            b |= 0x40;
        }
        if self.will_retain {
            b |= 0x20;
        }
        b |= (self.will_qos as u8) << 3;
        if self.will {
            b |= 0x04;
        }
        if self.clean_session {
            b |= 0x02;
        }
        b
    }

    /// Returns `None` when the reserved bit is set or the will bits are inconsistent.
    pub fn decode(b: u8) -> Option<Self> {
        if b & 0x01 != 0 {
            return None;
        }
        let will = b & 0x04 != 0;
        let will_qos = QoS::from_u8((b >> 3) & 0x03)?;
        let will_retain = b & 0x20 != 0;
        if !will && (will_qos != QoS::AtMostOnce || will_retain) {
            return None;
        }
        let username = b & 0x80 != 0;
        let password = b & 0x40 != 0;
        if password && !username {
            return None;
        }
        Some(Self {
            username,
            password,
            will_retain,
            will_qos,
            will,
            clean_session: b & 0x02 != 0,
        })
    }
}

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Disconnected => write!(f, "disconnected"),
            State::Connecting => write!(f, "connecting"),
            State::Connected => write!(f, "connected"),
            State::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Advisory notifications produced while pumping the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Broker acknowledged a SUBSCRIBE.
    SubAck {
        pkid: u16,
        /// Granted QoS per filter, or 0x80 for failure.
        return_codes: Vec<u8>,
    },
    /// Broker acknowledged an UNSUBSCRIBE.
    UnsubAck { pkid: u16 },
    /// No SUBACK / UNSUBACK arrived within the ack timeout.
    AckTimeout { pkid: u16 },
    /// The connection dropped without a local disconnect.
    ConnectionLost { reason: String },
}
