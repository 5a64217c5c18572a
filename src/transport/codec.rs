//! MQTT 3.1.1 wire format
//!
//! [`encode`] appends one packet to a buffer, [`decode`] takes one complete
//! packet off the front of a buffer and returns `Ok(None)` while the frame is
//! still incomplete. Both directions are supported for every packet type so the
//! codec can serve a broker as well as a client.

use crate::error::{MqttError, MqttResult};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Message, Packet, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe,
};
use bytes::{Buf, BufMut, BytesMut};

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

/// Largest value the four-byte remaining length can express
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

mod packet_type {
    pub const CONNECT: u8 = 1;
    pub const CONNACK: u8 = 2;
    pub const PUBLISH: u8 = 3;
    pub const PUBACK: u8 = 4;
    pub const PUBREC: u8 = 5;
    pub const PUBREL: u8 = 6;
    pub const PUBCOMP: u8 = 7;
    pub const SUBSCRIBE: u8 = 8;
    pub const SUBACK: u8 = 9;
    pub const UNSUBSCRIBE: u8 = 10;
    pub const UNSUBACK: u8 = 11;
    pub const PINGREQ: u8 = 12;
    pub const PINGRESP: u8 = 13;
    pub const DISCONNECT: u8 = 14;
}

fn malformed(reason: impl Into<String>) -> MqttError {
    MqttError::Codec(reason.into())
}

/// Append the encoded form of `packet` to `dst`
pub fn encode(packet: &Packet, dst: &mut BytesMut) -> MqttResult<()> {
    let mut body = BytesMut::new();
    let header = match packet {
        Packet::Connect(connect) => {
            encode_connect(connect, &mut body)?;
            packet_type::CONNECT << 4
        }
        Packet::ConnAck(ack) => {
            body.put_u8(u8::from(ack.session_present));
            body.put_u8(ack.code.as_u8());
            packet_type::CONNACK << 4
        }
        Packet::Publish(publish) => {
            put_str(&mut body, &publish.topic)?;
            match (publish.qos, publish.packet_id) {
                (QoS::AtMostOnce, _) => {}
                (_, Some(id)) => body.put_u16(id),
                (_, None) => return Err(malformed("PUBLISH above QoS 0 needs a packet id")),
            }
            body.put_slice(&publish.payload);
            (packet_type::PUBLISH << 4)
                | (u8::from(publish.dup) << 3)
                | (publish.qos.as_u8() << 1)
                | u8::from(publish.retain)
        }
        Packet::PubAck(id) => {
            body.put_u16(*id);
            packet_type::PUBACK << 4
        }
        Packet::PubRec(id) => {
            body.put_u16(*id);
            packet_type::PUBREC << 4
        }
        Packet::PubRel(id) => {
            body.put_u16(*id);
            (packet_type::PUBREL << 4) | 0b0010
        }
        Packet::PubComp(id) => {
            body.put_u16(*id);
            packet_type::PUBCOMP << 4
        }
        Packet::Subscribe(subscribe) => {
            body.put_u16(subscribe.packet_id);
            for (filter, qos) in &subscribe.filters {
                put_str(&mut body, filter)?;
                body.put_u8(qos.as_u8());
            }
            (packet_type::SUBSCRIBE << 4) | 0b0010
        }
        Packet::SubAck(ack) => {
            body.put_u16(ack.packet_id);
            for code in &ack.return_codes {
                body.put_u8(match code {
                    SubscribeReturnCode::Success(qos) => qos.as_u8(),
                    SubscribeReturnCode::Failure => 0x80,
                });
            }
            packet_type::SUBACK << 4
        }
        Packet::Unsubscribe(unsubscribe) => {
            body.put_u16(unsubscribe.packet_id);
            for filter in &unsubscribe.filters {
                put_str(&mut body, filter)?;
            }
            (packet_type::UNSUBSCRIBE << 4) | 0b0010
        }
        Packet::UnsubAck(id) => {
            body.put_u16(*id);
            packet_type::UNSUBACK << 4
        }
        Packet::PingReq => packet_type::PINGREQ << 4,
        Packet::PingResp => packet_type::PINGRESP << 4,
        Packet::Disconnect => packet_type::DISCONNECT << 4,
    };

    if body.len() > MAX_REMAINING_LENGTH {
        return Err(malformed(format!("{} too large: {} bytes", packet.name(), body.len())));
    }
    dst.reserve(body.len() + 5);
    dst.put_u8(header);
    put_remaining_length(dst, body.len());
    dst.put_slice(&body);
    Ok(())
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) -> MqttResult<()> {
    put_str(body, PROTOCOL_NAME)?;
    body.put_u8(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0b0000_0010;
    }
    if let Some(will) = &connect.will {
        flags |= 0b0000_0100 | (will.qos.as_u8() << 3);
        if will.retained {
            flags |= 0b0010_0000;
        }
    }
    if connect.password.is_some() {
        flags |= 0b0100_0000;
    }
    if connect.username.is_some() {
        flags |= 0b1000_0000;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    put_str(body, &connect.client_id)?;
    if let Some(will) = &connect.will {
        put_str(body, &will.topic)?;
        put_bytes(body, &will.payload)?;
    }
    if let Some(username) = &connect.username {
        put_str(body, username)?;
    }
    if let Some(password) = &connect.password {
        put_bytes(body, password)?;
    }
    Ok(())
}

fn put_remaining_length(dst: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_bytes(dst: &mut BytesMut, bytes: &[u8]) -> MqttResult<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| malformed(format!("field of {} bytes exceeds 65535", bytes.len())))?;
    dst.put_u16(len);
    dst.put_slice(bytes);
    Ok(())
}

fn put_str(dst: &mut BytesMut, value: &str) -> MqttResult<()> {
    put_bytes(dst, value.as_bytes())
}

/// Read the remaining length starting at `src[1]`.
/// Returns the length and the number of bytes it occupied, or `None` if more
/// bytes are needed.
fn read_remaining_length(src: &[u8]) -> MqttResult<Option<(usize, usize)>> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (index, byte) in src.iter().skip(1).enumerate() {
        if index == 4 {
            return Err(malformed("remaining length longer than four bytes"));
        }
        value += (*byte as usize & 0x7f) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }
    if src.len() > 4 {
        return Err(malformed("remaining length longer than four bytes"));
    }
    Ok(None)
}

/// Take one packet off the front of `src`
pub fn decode(src: &mut BytesMut) -> MqttResult<Option<Packet>> {
    decode_limited(src, MAX_REMAINING_LENGTH)
}

/// Like [`decode`], but rejects frames whose remaining length exceeds
/// `max_packet_size` before buffering them
pub fn decode_limited(src: &mut BytesMut, max_packet_size: usize) -> MqttResult<Option<Packet>> {
    if src.is_empty() {
        return Ok(None);
    }
    let Some((remaining, length_bytes)) = read_remaining_length(src)? else {
        return Ok(None);
    };
    if remaining > max_packet_size {
        return Err(malformed(format!(
            "packet of {remaining} bytes exceeds the {max_packet_size} byte limit"
        )));
    }
    let frame_len = 1 + length_bytes + remaining;
    if src.len() < frame_len {
        src.reserve(frame_len - src.len());
        return Ok(None);
    }

    let mut frame = src.split_to(frame_len);
    let header = frame.get_u8();
    frame.advance(length_bytes);
    let packet = decode_body(header, &mut frame)?;
    if frame.has_remaining() && !matches!(packet, Packet::Publish(_)) {
        return Err(malformed(format!("{} bytes left after {}", frame.remaining(), packet.name())));
    }
    Ok(Some(packet))
}

fn decode_body(header: u8, body: &mut BytesMut) -> MqttResult<Packet> {
    let kind = header >> 4;
    let flags = header & 0x0f;

    let expect_flags = |expected: u8, name: &str| {
        if flags == expected {
            Ok(())
        } else {
            Err(malformed(format!("invalid flags {flags:#06b} on {name}")))
        }
    };

    let packet = match kind {
        packet_type::CONNECT => {
            expect_flags(0, "CONNECT")?;
            Packet::Connect(decode_connect(body)?)
        }
        packet_type::CONNACK => {
            expect_flags(0, "CONNACK")?;
            let session_present = read_u8(body)? & 0x01 == 1;
            let raw = read_u8(body)?;
            let code = ConnectReturnCode::from_u8(raw)
                .ok_or_else(|| malformed(format!("unknown CONNACK return code {raw}")))?;
            Packet::ConnAck(ConnAck {
                session_present,
                code,
            })
        }
        packet_type::PUBLISH => {
            let qos = QoS::try_from((flags >> 1) & 0b11)
                .map_err(|_| malformed("PUBLISH with QoS 3"))?;
            let topic = read_str(body)?;
            let packet_id = match qos {
                QoS::AtMostOnce => None,
                _ => Some(read_u16(body)?),
            };
            Packet::Publish(Publish {
                topic,
                payload: body.split().to_vec(),
                qos,
                retain: flags & 0b0001 != 0,
                dup: flags & 0b1000 != 0,
                packet_id,
            })
        }
        packet_type::PUBACK => {
            expect_flags(0, "PUBACK")?;
            Packet::PubAck(read_u16(body)?)
        }
        packet_type::PUBREC => {
            expect_flags(0, "PUBREC")?;
            Packet::PubRec(read_u16(body)?)
        }
        packet_type::PUBREL => {
            expect_flags(0b0010, "PUBREL")?;
            Packet::PubRel(read_u16(body)?)
        }
        packet_type::PUBCOMP => {
            expect_flags(0, "PUBCOMP")?;
            Packet::PubComp(read_u16(body)?)
        }
        packet_type::SUBSCRIBE => {
            expect_flags(0b0010, "SUBSCRIBE")?;
            let packet_id = read_u16(body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = read_str(body)?;
                let qos = QoS::try_from(read_u8(body)? & 0b11)
                    .map_err(|_| malformed("SUBSCRIBE with QoS 3"))?;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(malformed("SUBSCRIBE without filters"));
            }
            Packet::Subscribe(Subscribe { packet_id, filters })
        }
        packet_type::SUBACK => {
            expect_flags(0, "SUBACK")?;
            let packet_id = read_u16(body)?;
            let mut return_codes = Vec::new();
            while body.has_remaining() {
                let raw = body.get_u8();
                let code = match raw {
                    0x80 => SubscribeReturnCode::Failure,
                    other => SubscribeReturnCode::Success(
                        QoS::try_from(other)
                            .map_err(|_| malformed(format!("invalid SUBACK return code {other}")))?,
                    ),
                };
                return_codes.push(code);
            }
            Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            })
        }
        packet_type::UNSUBSCRIBE => {
            expect_flags(0b0010, "UNSUBSCRIBE")?;
            let packet_id = read_u16(body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                filters.push(read_str(body)?);
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, filters })
        }
        packet_type::UNSUBACK => {
            expect_flags(0, "UNSUBACK")?;
            Packet::UnsubAck(read_u16(body)?)
        }
        packet_type::PINGREQ => Packet::PingReq,
        packet_type::PINGRESP => Packet::PingResp,
        packet_type::DISCONNECT => Packet::Disconnect,
        other => return Err(malformed(format!("unknown packet type {other}"))),
    };
    Ok(packet)
}

fn decode_connect(body: &mut BytesMut) -> MqttResult<Connect> {
    let name = read_str(body)?;
    let level = read_u8(body)?;
    if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
        return Err(malformed(format!("unsupported protocol {name} level {level}")));
    }
    let flags = read_u8(body)?;
    let keep_alive = read_u16(body)?;
    let client_id = read_str(body)?;

    let will = if flags & 0b0000_0100 != 0 {
        let topic = read_str(body)?;
        let payload = read_bytes(body)?;
        let qos = QoS::try_from((flags >> 3) & 0b11).map_err(|_| malformed("will with QoS 3"))?;
        Some(Message::new(topic, payload, qos).with_retained(flags & 0b0010_0000 != 0))
    } else {
        None
    };
    let username = if flags & 0b1000_0000 != 0 {
        Some(read_str(body)?)
    } else {
        None
    };
    let password = if flags & 0b0100_0000 != 0 {
        Some(read_bytes(body)?)
    } else {
        None
    };

    Ok(Connect {
        client_id,
        keep_alive,
        clean_session: flags & 0b0000_0010 != 0,
        username,
        password,
        will,
    })
}

fn read_u8(body: &mut BytesMut) -> MqttResult<u8> {
    if body.remaining() < 1 {
        return Err(malformed("unexpected end of packet"));
    }
    Ok(body.get_u8())
}

fn read_u16(body: &mut BytesMut) -> MqttResult<u16> {
    if body.remaining() < 2 {
        return Err(malformed("unexpected end of packet"));
    }
    Ok(body.get_u16())
}

fn read_bytes(body: &mut BytesMut) -> MqttResult<Vec<u8>> {
    let len = read_u16(body)? as usize;
    if body.remaining() < len {
        return Err(malformed("unexpected end of packet"));
    }
    Ok(body.split_to(len).to_vec())
}

fn read_str(body: &mut BytesMut) -> MqttResult<String> {
    String::from_utf8(read_bytes(body)?).map_err(|_| malformed("invalid UTF-8 string"))
}
