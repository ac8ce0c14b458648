//! Error types for mqttc.

use std::io;

use crate::types::ConnectReturnCode;

/// Result type alias for mqttc.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqttc operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport (byte stream) failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Malformed packet, or invalid topic / filter supplied.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Broker refused the CONNECT.
    #[error("connection rejected: {0}")]
    ConnectRejected(ConnectReturnCode),

    /// Operation requires a connected session.
    #[error("not connected")]
    NotConnected,

    /// Operation not allowed in the current session state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The background session task has stopped.
    #[error("session task shut down")]
    Shutdown,
}

impl Error {
    /// Whether this error always terminates the connection it occurred on.
    ///
    /// `Protocol` is not counted: rejected local input (bad topic, QoS > 0,
    /// oversized publish) leaves the session up, while the same kinds decoded
    /// from broker bytes abort it. Check the session state to tell them apart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ConnectRejected(_) | Error::ConnectionClosed | Error::Timeout(_)
        )
    }
}

/// Wire-level and input validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Reserved packet type (0 or 15).
    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),

    /// Packet type that this client never handles (QoS 1/2 flows).
    #[error("unsupported packet type {0}")]
    UnsupportedPacketType(u8),

    /// Reserved fixed header flags were not as required.
    #[error("invalid flags {flags:#04x} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    /// Remaining length used more than four bytes.
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    /// Packet is structurally broken.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// Packet exceeds the configured maximum size.
    #[error("packet too large: {size} > {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// String field was not valid UTF-8.
    #[error("invalid utf-8 string")]
    InvalidUtf8,

    /// QoS bits outside 0..=2.
    #[error("invalid qos {0}")]
    InvalidQoS(u8),

    /// QoS level this client does not implement.
    #[error("unsupported qos {0}")]
    UnsupportedQoS(u8),

    /// CONNACK return code outside 0..=5.
    #[error("invalid connect return code {0}")]
    InvalidReturnCode(u8),

    /// Invalid topic name.
    #[error("invalid topic name: {0:?}")]
    InvalidTopic(String),

    /// Invalid topic filter.
    #[error("invalid topic filter: {0:?}")]
    InvalidTopicFilter(String),

    /// String does not fit a 2-byte length prefix.
    #[error("string too long: {0} bytes")]
    StringTooLong(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ConnectRejected(ConnectReturnCode::BadUserNamePassword);
        assert_eq!(err.to_string(), "connection rejected: bad user name or password");

        let err = Error::from(ProtocolError::InvalidTopicFilter("a/#/b".to_string()));
        assert!(err.to_string().contains("a/#/b"));
        assert!(!err.is_fatal());

        let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(err.is_fatal());

        // decode errors abort the session, but the kind alone can't say so
        assert!(!Error::from(ProtocolError::MalformedRemainingLength).is_fatal());
        assert!(Error::Timeout("no PINGRESP".to_string()).is_fatal());
    }
}
