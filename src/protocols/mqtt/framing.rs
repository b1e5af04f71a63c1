//! MQTT 3.1.1 wire framing
//!
//! Packet builders for the control packets the engine emits, plus the
//! remaining-length varint codec. Strings on the wire are prefixed with a
//! two-byte big-endian length; the remaining-length field is little-endian
//! base-128 with bit 7 as the continuation bit, at most four bytes.

use bytes::{BufMut, BytesMut};

/// Packet type byte: CONNECT
pub const CONNECT: u8 = 0x10;
/// Packet type byte: CONNACK
pub const CONNACK: u8 = 0x20;
/// Packet type byte: PUBLISH (flags OR-ed in)
pub const PUBLISH: u8 = 0x30;
/// Packet type byte: PUBACK
pub const PUBACK: u8 = 0x40;
/// Packet type byte: SUBSCRIBE (reserved flags 0b0010)
pub const SUBSCRIBE: u8 = 0x82;
/// Packet type byte: SUBACK
pub const SUBACK: u8 = 0x90;
/// Packet type byte: UNSUBSCRIBE (reserved flags 0b0010)
pub const UNSUBSCRIBE: u8 = 0xA2;
/// Packet type byte: UNSUBACK
pub const UNSUBACK: u8 = 0xB0;
/// Packet type byte: DISCONNECT
pub const DISCONNECT: u8 = 0xE0;

/// Largest encodable remaining length (four 7-bit groups)
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Quality-of-service level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Clamp an integer QoS to a valid level
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }
}

/// Encode a remaining-length value into its varint form
pub fn encode_remaining_length(mut value: u32, buf: &mut BytesMut) {
    debug_assert!(value <= MAX_REMAINING_LENGTH);
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a remaining-length varint; returns (value, bytes consumed).
///
/// `None` when the buffer ends mid-varint or the encoding exceeds the
/// four-byte limit.
pub fn decode_remaining_length(buf: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    let mut multiplier: u32 = 1;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return None;
        }
        value += (byte & 0x7F) as u32 * multiplier;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        multiplier *= 128;
    }
    None
}

/// Decode a fixed header: (packet type + flags, remaining length, header size)
pub fn decode_fixed_header(buf: &[u8]) -> Option<(u8, u32, usize)> {
    let first = *buf.first()?;
    let (remaining, consumed) = decode_remaining_length(&buf[1..])?;
    Some((first, remaining, 1 + consumed))
}

/// Append a two-byte big-endian length-prefixed string
fn put_utf8_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Build a CONNECT packet: protocol name "MQTT", level 4, clean session,
/// optional username/password, 16-bit keep-alive.
pub fn connect_packet(
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
    keep_alive_seconds: u16,
) -> BytesMut {
    let username = username.filter(|u| !u.is_empty());
    let password = password.filter(|p| !p.is_empty());

    let mut body = BytesMut::new();
    put_utf8_string(&mut body, "MQTT");
    body.put_u8(0x04); // protocol level: 3.1.1

    let mut flags = 0x02; // clean session
    if username.is_some() {
        flags |= 0x80;
    }
    if password.is_some() {
        flags |= 0x40;
    }
    body.put_u8(flags);
    body.put_u16(keep_alive_seconds);

    put_utf8_string(&mut body, client_id);
    if let Some(user) = username {
        put_utf8_string(&mut body, user);
    }
    if let Some(pass) = password {
        put_utf8_string(&mut body, pass);
    }

    frame(CONNECT, &body)
}

/// Build a PUBLISH packet. QoS > 0 carries a packet id; the payload rides
/// verbatim with no length prefix of its own.
pub fn publish_packet(
    topic: &str,
    payload: &[u8],
    qos: QoS,
    retain: bool,
    packet_id: u16,
) -> BytesMut {
    let mut first = PUBLISH | (qos.level() << 1);
    if retain {
        first |= 0x01;
    }

    let mut body = BytesMut::new();
    put_utf8_string(&mut body, topic);
    if qos > QoS::AtMostOnce {
        body.put_u16(packet_id);
    }
    body.put_slice(payload);

    frame(first, &body)
}

/// Build a SUBSCRIBE packet for a single topic filter
pub fn subscribe_packet(topic: &str, qos: QoS, packet_id: u16) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    put_utf8_string(&mut body, topic);
    body.put_u8(qos.level());
    frame(SUBSCRIBE, &body)
}

/// Build an UNSUBSCRIBE packet for a single topic filter
pub fn unsubscribe_packet(topic: &str, packet_id: u16) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    put_utf8_string(&mut body, topic);
    frame(UNSUBSCRIBE, &body)
}

/// Build the two-byte DISCONNECT packet
pub fn disconnect_packet() -> [u8; 2] {
    [DISCONNECT, 0x00]
}

/// Assemble fixed header + body
fn frame(first_byte: u8, body: &[u8]) -> BytesMut {
    let mut packet = BytesMut::with_capacity(body.len() + 5);
    packet.put_u8(first_byte);
    encode_remaining_length(body.len() as u32, &mut packet);
    packet.put_slice(body);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_remaining_length(value, &mut buf);
        buf.to_vec()
    }

    #[test]
    fn remaining_length_known_encodings() {
        // Boundary vectors straight from the MQTT 3.1.1 spec table
        assert_eq!(encode(0), [0x00]);
        assert_eq!(encode(127), [0x7F]);
        assert_eq!(encode(128), [0x80, 0x01]);
        assert_eq!(encode(16_383), [0xFF, 0x7F]);
        assert_eq!(encode(16_384), [0x80, 0x80, 0x01]);
        assert_eq!(encode(2_097_151), [0xFF, 0xFF, 0x7F]);
        assert_eq!(encode(2_097_152), [0x80, 0x80, 0x80, 0x01]);
        assert_eq!(encode(MAX_REMAINING_LENGTH), [0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn remaining_length_round_trip_full_domain() {
        // Boundaries of every group width, plus a stride across the domain
        let boundaries = [
            0,
            1,
            127,
            128,
            129,
            16_383,
            16_384,
            16_385,
            2_097_151,
            2_097_152,
            2_097_153,
            MAX_REMAINING_LENGTH - 1,
            MAX_REMAINING_LENGTH,
        ];
        for &value in &boundaries {
            let bytes = encode(value);
            let (decoded, consumed) = decode_remaining_length(&bytes).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, bytes.len());
        }

        let mut value: u32 = 0;
        while value <= MAX_REMAINING_LENGTH {
            let bytes = encode(value);
            let (decoded, consumed) = decode_remaining_length(&bytes).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, bytes.len());
            value = value.saturating_add(997);
        }
    }

    #[test]
    fn decode_rejects_truncated_varint() {
        assert_eq!(decode_remaining_length(&[0x80]), None);
        assert_eq!(decode_remaining_length(&[]), None);
    }

    #[test]
    fn decode_rejects_overlong_varint() {
        assert_eq!(decode_remaining_length(&[0x80, 0x80, 0x80, 0x80, 0x01]), None);
    }

    #[test]
    fn connect_packet_exact_bytes() {
        // CONNECT, rem-len 12, "MQTT", level 4, clean session, keep-alive 30,
        // client id "cid"
        let packet = connect_packet("cid", None, None, 30);
        assert_eq!(
            packet.as_ref(),
            [
                0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x1E, 0x00,
                0x03, b'c', b'i', b'd'
            ]
        );
    }

    #[test]
    fn connect_packet_with_credentials() {
        let packet = connect_packet("c", Some("u"), Some("p"), 60);
        // flags carry clean session + username + password
        assert_eq!(packet[9], 0x02 | 0x80 | 0x40);
        // payload order: client id, username, password
        let tail = &packet[12..];
        assert_eq!(tail, [0x00, 0x01, b'c', 0x00, 0x01, b'u', 0x00, 0x01, b'p']);
    }

    #[test]
    fn connect_empty_credentials_are_omitted() {
        let with_empty = connect_packet("cid", Some(""), Some(""), 30);
        let without = connect_packet("cid", None, None, 30);
        assert_eq!(with_empty, without);
    }

    #[test]
    fn publish_packet_qos0_exact_bytes() {
        // PUBLISH, rem-len 4, topic "t", payload "m", no packet id at QoS 0
        let packet = publish_packet("t", b"m", QoS::AtMostOnce, false, 1);
        assert_eq!(packet.as_ref(), [0x30, 0x04, 0x00, 0x01, b't', b'm']);
    }

    #[test]
    fn publish_packet_qos1_carries_packet_id() {
        let packet = publish_packet("t", b"m", QoS::AtLeastOnce, false, 0x0102);
        // first byte: 0x30 | qos 1 << 1
        assert_eq!(packet[0], 0x32);
        // topic, then the packet id, then payload
        assert_eq!(&packet[2..], [0x00, 0x01, b't', 0x01, 0x02, b'm']);
    }

    #[test]
    fn publish_retain_sets_bit_zero() {
        let packet = publish_packet("t", b"m", QoS::AtMostOnce, true, 1);
        assert_eq!(packet[0], 0x31);
    }

    #[test]
    fn subscribe_packet_layout() {
        let packet = subscribe_packet("a/b", QoS::AtLeastOnce, 7);
        assert_eq!(packet[0], 0x82);
        // rem-len: packet id (2) + topic prefix (2) + "a/b" (3) + qos (1)
        assert_eq!(packet[1], 8);
        assert_eq!(&packet[2..4], [0x00, 0x07]);
        assert_eq!(packet[packet.len() - 1], 1);
    }

    #[test]
    fn unsubscribe_packet_layout() {
        let packet = unsubscribe_packet("a/b", 7);
        assert_eq!(packet[0], 0xA2);
        assert_eq!(packet[1], 7);
        assert_eq!(&packet[2..4], [0x00, 0x07]);
    }

    #[test]
    fn disconnect_packet_bytes() {
        assert_eq!(disconnect_packet(), [0xE0, 0x00]);
    }

    #[test]
    fn fixed_header_decode() {
        let packet = publish_packet("t", b"m", QoS::AtMostOnce, false, 1);
        let (first, remaining, consumed) = decode_fixed_header(&packet).unwrap();
        assert_eq!(first, 0x30);
        assert_eq!(remaining, 4);
        assert_eq!(consumed, 2);
        // a CONNACK header decodes the same way
        let (first, remaining, _) = decode_fixed_header(&[CONNACK, 0x02, 0x00, 0x00]).unwrap();
        assert_eq!(first, CONNACK);
        assert_eq!(remaining, 2);
    }
}
