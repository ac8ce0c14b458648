//! MQTT packet encoding/decoding utilities.
//!
//! Low-level primitives shared by the v4 packet codec: the remaining-length
//! varint, big-endian u16, length-prefixed strings and the fixed header.
//!
//! Readers work on a slice that holds a complete packet body, so running out
//! of bytes there is a malformed packet, not an incomplete one. Only
//! [`read_variable_int`] and [`read_fixed_header`] can report "need more".

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::types::{FixedHeader, PacketType, QoS};

/// Largest value the 4-byte remaining-length varint can carry.
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Read a variable-length integer (remaining length encoding).
///
/// Returns `Ok(Some((value, bytes_consumed)))`, `Ok(None)` if more bytes are
/// needed, or an error when a fourth byte still has its continuation bit set.
pub fn read_variable_int(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut multiplier = 1u32;
    let mut value = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        value += (byte & 0x7F) as u32 * multiplier;

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }

        if i == 3 {
            return Err(ProtocolError::MalformedRemainingLength.into());
        }

        multiplier *= 128;
    }

    Ok(None)
}

/// Write a variable-length integer.
///
/// Returns the number of bytes written.
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize> {
    if value > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PacketTooLarge {
            size: value as usize,
            max: MAX_REMAINING_LENGTH as usize,
        }
        .into());
    }

    let mut written = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;

        if value > 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);
        written += 1;

        if value == 0 {
            return Ok(written);
        }
    }
}

/// Calculate the number of bytes needed for a variable-length integer.
pub const fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Read a 2-byte big-endian u16.
pub fn read_u16(buf: &[u8]) -> Option<u16> {
    if buf.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Read a UTF-8 string (2-byte length prefix + data).
pub fn read_string(buf: &[u8]) -> Result<(String, usize)> {
    let (bytes, consumed) = read_binary_slice(buf)?;
    let s = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    if s.contains('\0') {
        return Err(ProtocolError::MalformedPacket("string contains NUL").into());
    }
    Ok((s.to_string(), consumed))
}

/// Read binary data as a slice (2-byte length prefix + data).
pub fn read_binary_slice(buf: &[u8]) -> Result<(&[u8], usize)> {
    let len = read_u16(buf).ok_or(ProtocolError::MalformedPacket("truncated length prefix"))? as usize;

    if buf.len() < 2 + len {
        return Err(ProtocolError::MalformedPacket("truncated field").into());
    }

    Ok((&buf[2..2 + len], 2 + len))
}

/// Write a UTF-8 string (2-byte length prefix + data).
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<usize> {
    write_binary(buf, s.as_bytes())
}

/// Write binary data (2-byte length prefix + data).
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<usize> {
    let len = data.len();
    if len > u16::MAX as usize {
        return Err(ProtocolError::StringTooLong(len).into());
    }

    buf.put_u16(len as u16);
    buf.put_slice(data);

    Ok(2 + len)
}

/// Parse a fixed header from buffer.
///
/// The type and flags are validated as soon as the first byte is present, so
/// a bad stream is rejected without waiting for the rest of the packet.
pub fn read_fixed_header(buf: &[u8]) -> Result<Option<FixedHeader>> {
    let Some(&first_byte) = buf.first() else {
        return Ok(None);
    };

    let packet_type_byte = first_byte >> 4;
    let flags = first_byte & 0x0F;

    let packet_type = PacketType::from_u8(packet_type_byte)
        .ok_or(ProtocolError::InvalidPacketType(packet_type_byte))?;

    match packet_type.required_flags() {
        Some(required) if flags != required => {
            return Err(ProtocolError::InvalidFlags { packet_type: packet_type_byte, flags }.into());
        }
        None => {
            let qos = (flags >> 1) & 0x03;
            if QoS::from_u8(qos).is_none() {
                return Err(ProtocolError::InvalidQoS(qos).into());
            }
        }
        _ => {}
    }

    let Some((remaining_length, var_len)) = read_variable_int(&buf[1..])? else {
        return Ok(None);
    };

    Ok(Some(FixedHeader {
        packet_type,
        flags,
        remaining_length,
        header_length: 1 + var_len,
    }))
}

/// Write a fixed header to buffer.
pub fn write_fixed_header(
    buf: &mut BytesMut,
    packet_type: PacketType,
    flags: u8,
    remaining_length: usize,
) -> Result<usize> {
    if remaining_length > MAX_REMAINING_LENGTH as usize {
        return Err(ProtocolError::PacketTooLarge {
            size: remaining_length,
            max: MAX_REMAINING_LENGTH as usize,
        }
        .into());
    }

    buf.put_u8(((packet_type as u8) << 4) | (flags & 0x0F));
    let var_len = write_variable_int(buf, remaining_length as u32)?;

    Ok(1 + var_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn malformed(result: Result<impl std::fmt::Debug>) -> ProtocolError {
        match result {
            Err(Error::Protocol(e)) => e,
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_variable_int() {
        for value in [0, 1, 127, 128, 16383, 16384, 2097151, 2097152, 268435455] {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            let (decoded, consumed) = read_variable_int(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(written, consumed);
            assert_eq!(written, variable_int_len(value));
        }
    }

    #[test]
    fn test_variable_int_boundaries() {
        let mut buf = BytesMut::new();
        write_variable_int(&mut buf, 127).unwrap();
        assert_eq!(&buf[..], &[0x7F]);

        buf.clear();
        write_variable_int(&mut buf, 128).unwrap();
        assert_eq!(&buf[..], &[0x80, 0x01]);

        buf.clear();
        write_variable_int(&mut buf, 268_435_455).unwrap();
        assert_eq!(&buf[..], &[0xFF, 0xFF, 0xFF, 0x7F]);

        buf.clear();
        assert!(write_variable_int(&mut buf, 268_435_456).is_err());
    }

    #[test]
    fn test_variable_int_incomplete() {
        assert!(read_variable_int(&[]).unwrap().is_none());
        assert!(read_variable_int(&[0x80]).unwrap().is_none());
        assert!(read_variable_int(&[0xFF, 0xFF, 0xFF]).unwrap().is_none());
    }

    #[test]
    fn test_variable_int_fifth_byte() {
        let err = malformed(read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]));
        assert_eq!(err, ProtocolError::MalformedRemainingLength);

        // even before the fifth byte arrives
        let err = malformed(read_variable_int(&[0x80, 0x80, 0x80, 0x80]));
        assert_eq!(err, ProtocolError::MalformedRemainingLength);
    }

    #[test]
    fn test_u16() {
        assert_eq!(read_u16(&[0x12, 0x34]), Some(0x1234));
        assert_eq!(read_u16(&[0x12]), None);
    }

    #[test]
    fn test_string() {
        let mut buf = BytesMut::new();
        let len = write_string(&mut buf, "hello").unwrap();
        assert_eq!(len, 7); // 2 + 5

        let (s, consumed) = read_string(&buf).unwrap();
        assert_eq!(s, "hello");
        assert_eq!(consumed, 7);
    }

    #[test]
    fn test_string_errors() {
        // length says 5, only 2 bytes follow
        let err = malformed(read_string(&[0x00, 0x05, b'h', b'i']));
        assert!(matches!(err, ProtocolError::MalformedPacket(_)));

        let err = malformed(read_string(&[0x00, 0x02, 0xC3, 0x28]));
        assert_eq!(err, ProtocolError::InvalidUtf8);

        let long = "x".repeat(u16::MAX as usize + 1);
        let err = malformed(write_string(&mut BytesMut::new(), &long));
        assert_eq!(err, ProtocolError::StringTooLong(65536));
    }

    #[test]
    fn test_fixed_header() {
        assert!(read_fixed_header(&[]).unwrap().is_none());
        // type known, length still missing
        assert!(read_fixed_header(&[0x30]).unwrap().is_none());

        let header = read_fixed_header(&[0x30, 0x80, 0x01]).unwrap().unwrap();
        assert_eq!(header.packet_type, PacketType::Publish);
        assert_eq!(header.remaining_length, 128);
        assert_eq!(header.header_length, 3);

        let header = read_fixed_header(&[0x82, 0x05]).unwrap().unwrap();
        assert_eq!(header.packet_type, PacketType::Subscribe);
    }

    #[test]
    fn test_fixed_header_invalid() {
        assert_eq!(malformed(read_fixed_header(&[0x00])), ProtocolError::InvalidPacketType(0));
        assert_eq!(malformed(read_fixed_header(&[0xF0])), ProtocolError::InvalidPacketType(15));
        assert_eq!(
            malformed(read_fixed_header(&[0x80, 0x00])),
            ProtocolError::InvalidFlags { packet_type: 8, flags: 0 }
        );
        assert_eq!(
            malformed(read_fixed_header(&[0xC1, 0x00])),
            ProtocolError::InvalidFlags { packet_type: 12, flags: 1 }
        );
        // PUBLISH with QoS 3
        assert_eq!(malformed(read_fixed_header(&[0x36, 0x00])), ProtocolError::InvalidQoS(3));
    }

    #[test]
    fn test_write_fixed_header() {
        let mut buf = BytesMut::new();
        let len = write_fixed_header(&mut buf, PacketType::Subscribe, 0x02, 300).unwrap();
        assert_eq!(len, 3);
        assert_eq!(&buf[..], &[0x82, 0xAC, 0x02]);
    }
}
