//! MQTT protocol encoding and decoding.
//!
//! This module provides packet encoding and decoding for MQTT 3.1.1 (v4).

pub mod codec;
pub mod v4;

pub use codec::*;

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Protocol name for MQTT.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;
