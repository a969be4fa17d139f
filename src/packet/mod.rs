//! The wire model: every message exchanged over a connection is a [Packet].
//!
//! All numbers are in network byte order (BE). Each packet starts with its type tag (i16),
//!  followed by a type specific body:
//!
//! ```ascii
//!   1 Send                 payload_len i32, payload
//!   5 Request              request_id i32, payload_len i32, payload
//!   6 Response             request_id i32, payload_len i32, payload
//!  10 StreamCreate         stream_id i32, payload_len i32, payload
//!  12 StreamCreateSuccess  stream_id i32
//!  14 StreamCreateFail     stream_id i32, code i16
//!  15 StreamClose          stream_id i32, code i16
//!  17 StreamPing           stream_id i32, request_id i32
//!  18 StreamPong           stream_id i32, request_id i32
//!  20 StreamResponse       stream_id i32, payload_len i32, payload
//! 100 ClientClose          payload_len i32, payload
//! 110 ServerClose          payload_len i32, payload
//! 150 Handshake            request_id i32, payload_len i32, payload
//! 151 HandshakeResponse    request_id i32, payload_len i32, payload
//! 200 Ping                 ping_id i32, state_version u8, state_code u8
//! 201 Pong                 -
//! ```
//!
//! A payload length of -1 stands for an empty payload. Frames are not length-prefixed as a whole,
//!  but the type tag determines where the length of the variable part is, so a decoder can tell
//!  an incomplete frame from a complete one without parsing it.

pub mod control_value;
pub mod handshake_code;
pub mod stream_code;

use std::fmt::{Debug, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::packet::stream_code::StreamCode;
use crate::util::buf::BufExt;

#[repr(i16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PacketType {
    Send = 1,
    Request = 5,
    Response = 6,
    StreamCreate = 10,
    StreamCreateSuccess = 12,
    StreamCreateFail = 14,
    StreamClose = 15,
    StreamPing = 17,
    StreamPong = 18,
    StreamResponse = 20,
    ClientClose = 100,
    ServerClose = 110,
    Handshake = 150,
    HandshakeResponse = 151,
    Ping = 200,
    Pong = 201,
}

/// payload length on the wire for 'no payload'
const EMPTY_PAYLOAD_LEN: i32 = -1;

const TYPE_TAG_LEN: usize = size_of::<i16>();

impl PacketType {
    /// Size of the body's fixed part, and the offset of the payload length inside it for
    ///  packet types that carry a payload
    fn fixed_body_layout(self) -> (usize, Option<usize>) {
        use PacketType::*;

        match self {
            Send | ClientClose | ServerClose => (4, Some(0)),
            Request | Response | StreamCreate | StreamResponse | Handshake | HandshakeResponse => (8, Some(4)),
            StreamCreateSuccess => (4, None),
            StreamCreateFail | StreamClose => (6, None),
            StreamPing | StreamPong => (8, None),
            Ping => (6, None),
            Pong => (0, None),
        }
    }
}

#[derive(Clone, Eq, PartialEq)]
pub enum Packet {
    Send { payload: Bytes },
    Request { request_id: i32, payload: Bytes },
    Response { request_id: i32, payload: Bytes },
    StreamCreate { stream_id: i32, payload: Bytes },
    StreamCreateSuccess { stream_id: i32 },
    StreamCreateFail { stream_id: i32, code: StreamCode },
    StreamClose { stream_id: i32, code: StreamCode },
    StreamPing { stream_id: i32, request_id: i32 },
    StreamPong { stream_id: i32, request_id: i32 },
    StreamResponse { stream_id: i32, payload: Bytes },
    ClientClose { payload: Bytes },
    ServerClose { payload: Bytes },
    Handshake { request_id: i32, payload: Bytes },
    HandshakeResponse { request_id: i32, payload: Bytes },
    Ping { ping_id: i32, state_version: u8, state_code: u8 },
    Pong,
}

impl Debug for Packet {
    /// payloads are opaque and potentially big, so only their length is shown
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Packet::Send { payload } => write!(f, "Send{{payload:{}b}}", payload.len()),
            Packet::Request { request_id, payload } => write!(f, "Request{{request_id:{}, payload:{}b}}", request_id, payload.len()),
            Packet::Response { request_id, payload } => write!(f, "Response{{request_id:{}, payload:{}b}}", request_id, payload.len()),
            Packet::StreamCreate { stream_id, payload } => write!(f, "StreamCreate{{stream_id:{}, payload:{}b}}", stream_id, payload.len()),
            Packet::StreamCreateSuccess { stream_id } => write!(f, "StreamCreateSuccess{{stream_id:{}}}", stream_id),
            Packet::StreamCreateFail { stream_id, code } => write!(f, "StreamCreateFail{{stream_id:{}, code:{:?}}}", stream_id, code),
            Packet::StreamClose { stream_id, code } => write!(f, "StreamClose{{stream_id:{}, code:{:?}}}", stream_id, code),
            Packet::StreamPing { stream_id, request_id } => write!(f, "StreamPing{{stream_id:{}, request_id:{}}}", stream_id, request_id),
            Packet::StreamPong { stream_id, request_id } => write!(f, "StreamPong{{stream_id:{}, request_id:{}}}", stream_id, request_id),
            Packet::StreamResponse { stream_id, payload } => write!(f, "StreamResponse{{stream_id:{}, payload:{}b}}", stream_id, payload.len()),
            Packet::ClientClose { payload } => write!(f, "ClientClose{{payload:{}b}}", payload.len()),
            Packet::ServerClose { payload } => write!(f, "ServerClose{{payload:{}b}}", payload.len()),
            Packet::Handshake { request_id, payload } => write!(f, "Handshake{{request_id:{}, payload:{}b}}", request_id, payload.len()),
            Packet::HandshakeResponse { request_id, payload } => write!(f, "HandshakeResponse{{request_id:{}, payload:{}b}}", request_id, payload.len()),
            Packet::Ping { ping_id, state_version, state_code } => write!(f, "Ping{{ping_id:{}, state_version:{}, state_code:{}}}", ping_id, state_version, state_code),
            Packet::Pong => write!(f, "Pong"),
        }
    }
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Send { .. } => PacketType::Send,
            Packet::Request { .. } => PacketType::Request,
            Packet::Response { .. } => PacketType::Response,
            Packet::StreamCreate { .. } => PacketType::StreamCreate,
            Packet::StreamCreateSuccess { .. } => PacketType::StreamCreateSuccess,
            Packet::StreamCreateFail { .. } => PacketType::StreamCreateFail,
            Packet::StreamClose { .. } => PacketType::StreamClose,
            Packet::StreamPing { .. } => PacketType::StreamPing,
            Packet::StreamPong { .. } => PacketType::StreamPong,
            Packet::StreamResponse { .. } => PacketType::StreamResponse,
            Packet::ClientClose { .. } => PacketType::ClientClose,
            Packet::ServerClose { .. } => PacketType::ServerClose,
            Packet::Handshake { .. } => PacketType::Handshake,
            Packet::HandshakeResponse { .. } => PacketType::HandshakeResponse,
            Packet::Ping { .. } => PacketType::Ping,
            Packet::Pong => PacketType::Pong,
        }
    }

    /// the logical stream a packet belongs to, if any
    pub fn stream_id(&self) -> Option<i32> {
        match self {
            Packet::StreamCreate { stream_id, .. } |
            Packet::StreamCreateSuccess { stream_id } |
            Packet::StreamCreateFail { stream_id, .. } |
            Packet::StreamClose { stream_id, .. } |
            Packet::StreamPing { stream_id, .. } |
            Packet::StreamPong { stream_id, .. } |
            Packet::StreamResponse { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i16(self.packet_type().into());

        match self {
            Packet::Send { payload } |
            Packet::ClientClose { payload } |
            Packet::ServerClose { payload } => {
                put_payload(buf, payload);
            }
            Packet::Request { request_id, payload } |
            Packet::Response { request_id, payload } |
            Packet::Handshake { request_id, payload } |
            Packet::HandshakeResponse { request_id, payload } => {
                buf.put_i32(*request_id);
                put_payload(buf, payload);
            }
            Packet::StreamCreate { stream_id, payload } |
            Packet::StreamResponse { stream_id, payload } => {
                buf.put_i32(*stream_id);
                put_payload(buf, payload);
            }
            Packet::StreamCreateSuccess { stream_id } => {
                buf.put_i32(*stream_id);
            }
            Packet::StreamCreateFail { stream_id, code } |
            Packet::StreamClose { stream_id, code } => {
                buf.put_i32(*stream_id);
                buf.put_i16((*code).into());
            }
            Packet::StreamPing { stream_id, request_id } |
            Packet::StreamPong { stream_id, request_id } => {
                buf.put_i32(*stream_id);
                buf.put_i32(*request_id);
            }
            Packet::Ping { ping_id, state_version, state_code } => {
                buf.put_i32(*ping_id);
                buf.put_u8(*state_version);
                buf.put_u8(*state_code);
            }
            Packet::Pong => {}
        }
    }

    /// Decodes the first packet from a receive buffer, consuming its bytes.
    ///
    /// Returns `Ok(None)` if the buffer does not (yet) contain a complete packet - in that case
    ///  the buffer is left untouched. Errors mean that the byte stream is corrupted beyond
    ///  recovery: there is no way to find the start of the next packet.
    pub fn try_decode(buf: &mut BytesMut, max_packet_len: usize) -> anyhow::Result<Option<Packet>> {
        let frame_len = match Self::complete_frame_len(buf, max_packet_len)? {
            Some(len) => len,
            None => return Ok(None),
        };

        let mut frame = buf.split_to(frame_len).freeze();
        let packet_type = PacketType::try_from(frame.get_i16())
            .map_err(|e| anyhow!("invalid packet type: {}", e))?;
        Self::decode_body(packet_type, &mut frame).map(Some)
    }

    fn complete_frame_len(buf: &[u8], max_packet_len: usize) -> anyhow::Result<Option<usize>> {
        if buf.len() < TYPE_TAG_LEN {
            return Ok(None);
        }

        let raw_type = i16::from_be_bytes([buf[0], buf[1]]);
        let packet_type = match PacketType::try_from(raw_type) {
            Ok(t) => t,
            Err(_) => bail!("unknown packet type {}", raw_type),
        };

        let (fixed_len, payload_len_offset) = packet_type.fixed_body_layout();
        let body = &buf[TYPE_TAG_LEN..];
        if body.len() < fixed_len {
            return Ok(None);
        }

        let payload_len = match payload_len_offset {
            None => 0,
            Some(offset) => {
                let raw = i32::from_be_bytes([body[offset], body[offset+1], body[offset+2], body[offset+3]]);
                payload_len_from_raw(raw)?
            }
        };

        let frame_len = TYPE_TAG_LEN + fixed_len + payload_len;
        if frame_len > max_packet_len {
            bail!("{:?} packet of {} bytes exceeds the maximum packet length of {}", packet_type, frame_len, max_packet_len);
        }

        if buf.len() < frame_len {
            return Ok(None);
        }
        Ok(Some(frame_len))
    }

    /// `buf` contains exactly the packet's body
    fn decode_body(packet_type: PacketType, buf: &mut Bytes) -> anyhow::Result<Packet> {
        let packet = match packet_type {
            PacketType::Send => Packet::Send { payload: get_payload(buf)? },
            PacketType::ClientClose => Packet::ClientClose { payload: get_payload(buf)? },
            PacketType::ServerClose => Packet::ServerClose { payload: get_payload(buf)? },
            PacketType::Request => Packet::Request { request_id: buf.try_read_i32()?, payload: get_payload(buf)? },
            PacketType::Response => Packet::Response { request_id: buf.try_read_i32()?, payload: get_payload(buf)? },
            PacketType::Handshake => Packet::Handshake { request_id: buf.try_read_i32()?, payload: get_payload(buf)? },
            PacketType::HandshakeResponse => Packet::HandshakeResponse { request_id: buf.try_read_i32()?, payload: get_payload(buf)? },
            PacketType::StreamCreate => Packet::StreamCreate { stream_id: buf.try_read_i32()?, payload: get_payload(buf)? },
            PacketType::StreamResponse => Packet::StreamResponse { stream_id: buf.try_read_i32()?, payload: get_payload(buf)? },
            PacketType::StreamCreateSuccess => Packet::StreamCreateSuccess { stream_id: buf.try_read_i32()? },
            PacketType::StreamCreateFail => Packet::StreamCreateFail { stream_id: buf.try_read_i32()?, code: StreamCode::from(buf.try_read_i16()?) },
            PacketType::StreamClose => Packet::StreamClose { stream_id: buf.try_read_i32()?, code: StreamCode::from(buf.try_read_i16()?) },
            PacketType::StreamPing => Packet::StreamPing { stream_id: buf.try_read_i32()?, request_id: buf.try_read_i32()? },
            PacketType::StreamPong => Packet::StreamPong { stream_id: buf.try_read_i32()?, request_id: buf.try_read_i32()? },
            PacketType::Ping => Packet::Ping { ping_id: buf.try_read_i32()?, state_version: buf.try_read_u8()?, state_code: buf.try_read_u8()? },
            PacketType::Pong => Packet::Pong,
        };

        if buf.has_remaining() {
            bail!("{} unconsumed bytes after {:?} packet", buf.remaining(), packet_type);
        }
        Ok(packet)
    }
}

fn payload_len_from_raw(raw: i32) -> anyhow::Result<usize> {
    match raw {
        EMPTY_PAYLOAD_LEN => Ok(0),
        len if len >= 0 => Ok(len as usize),
        len => Err(anyhow!("invalid payload length {}", len)),
    }
}

fn put_payload(buf: &mut BytesMut, payload: &Bytes) {
    if payload.is_empty() {
        buf.put_i32(EMPTY_PAYLOAD_LEN);
    }
    else {
        //NB: the max packet length is checked on the receiving side
        buf.put_i32(i32::try_from(payload.len()).unwrap_or(i32::MAX));
        buf.put_slice(payload);
    }
}

fn get_payload(buf: &mut Bytes) -> anyhow::Result<Bytes> {
    let len = payload_len_from_raw(buf.try_read_i32()?)?;
    if buf.remaining() < len {
        bail!("payload length {} exceeds remaining {} bytes", len, buf.remaining());
    }
    Ok(buf.split_to(len))
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn encoded(packet: &Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        buf.to_vec()
    }

    #[rstest]
    #[case::send(Packet::Send { payload: Bytes::from_static(b"abc") }, vec![0,1, 0,0,0,3, b'a',b'b',b'c'])]
    #[case::send_empty(Packet::Send { payload: Bytes::new() }, vec![0,1, 255,255,255,255])]
    #[case::request(Packet::Request { request_id: 7, payload: Bytes::from_static(b"x") }, vec![0,5, 0,0,0,7, 0,0,0,1, b'x'])]
    #[case::response(Packet::Response { request_id: 258, payload: Bytes::from_static(b"yz") }, vec![0,6, 0,0,1,2, 0,0,0,2, b'y',b'z'])]
    #[case::stream_create(Packet::StreamCreate { stream_id: 1, payload: Bytes::from_static(b"q") }, vec![0,10, 0,0,0,1, 0,0,0,1, b'q'])]
    #[case::stream_create_success(Packet::StreamCreateSuccess { stream_id: 3 }, vec![0,12, 0,0,0,3])]
    #[case::stream_create_fail(Packet::StreamCreateFail { stream_id: 3, code: StreamCode::ConnectionUnsupport }, vec![0,14, 0,0,0,3, 0,153])]
    #[case::stream_close(Packet::StreamClose { stream_id: 5, code: StreamCode::Ok }, vec![0,15, 0,0,0,5, 0,0])]
    #[case::stream_ping(Packet::StreamPing { stream_id: 5, request_id: 9 }, vec![0,17, 0,0,0,5, 0,0,0,9])]
    #[case::stream_pong(Packet::StreamPong { stream_id: 5, request_id: 9 }, vec![0,18, 0,0,0,5, 0,0,0,9])]
    #[case::stream_response(Packet::StreamResponse { stream_id: 2, payload: Bytes::from_static(b"d") }, vec![0,20, 0,0,0,2, 0,0,0,1, b'd'])]
    #[case::client_close(Packet::ClientClose { payload: Bytes::new() }, vec![0,100, 255,255,255,255])]
    #[case::server_close(Packet::ServerClose { payload: Bytes::new() }, vec![0,110, 255,255,255,255])]
    #[case::handshake(Packet::Handshake { request_id: 1, payload: Bytes::from_static(b"M") }, vec![0,150, 0,0,0,1, 0,0,0,1, b'M'])]
    #[case::handshake_response(Packet::HandshakeResponse { request_id: 1, payload: Bytes::new() }, vec![0,151, 0,0,0,1, 255,255,255,255])]
    #[case::ping(Packet::Ping { ping_id: 4, state_version: 0, state_code: 11 }, vec![0,200, 0,0,0,4, 0, 11])]
    #[case::pong(Packet::Pong, vec![0,201])]
    fn test_ser_deser(#[case] packet: Packet, #[case] expected: Vec<u8>) {
        assert_eq!(encoded(&packet), expected);

        let mut buf = BytesMut::from(expected.as_slice());
        buf.put_slice(b"\0");
        let decoded = Packet::try_decode(&mut buf, 1024).unwrap();
        assert_eq!(decoded, Some(packet));
        assert_eq!(buf.as_ref(), b"\0");
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::half_type(vec![0])]
    #[case::no_body(vec![0,5])]
    #[case::partial_fixed_part(vec![0,5, 0,0,0,7, 0,0])]
    #[case::partial_payload(vec![0,5, 0,0,0,7, 0,0,0,3, b'a'])]
    #[case::partial_ping(vec![0,200, 0,0,0,4, 0])]
    fn test_decode_incomplete(#[case] raw: Vec<u8>) {
        let mut buf = BytesMut::from(raw.as_slice());
        assert_eq!(Packet::try_decode(&mut buf, 1024).unwrap(), None);
        assert_eq!(buf.as_ref(), raw.as_slice());
    }

    #[rstest]
    #[case::unknown_type(vec![0,99, 0,0,0,0])]
    #[case::negative_payload_len(vec![0,1, 255,255,255,0])]
    #[case::too_long(vec![0,1, 0,0,4,0])]
    fn test_decode_corrupted(#[case] raw: Vec<u8>) {
        let mut buf = BytesMut::from(raw.as_slice());
        assert!(Packet::try_decode(&mut buf, 1024).is_err());
    }

    #[test]
    fn test_decode_consecutive() {
        let mut buf = BytesMut::new();
        Packet::StreamResponse { stream_id: 1, payload: Bytes::from_static(b"first") }.ser(&mut buf);
        Packet::Pong.ser(&mut buf);
        Packet::StreamResponse { stream_id: 3, payload: Bytes::from_static(b"second") }.ser(&mut buf);

        assert_eq!(Packet::try_decode(&mut buf, 1024).unwrap(), Some(Packet::StreamResponse { stream_id: 1, payload: Bytes::from_static(b"first") }));
        assert_eq!(Packet::try_decode(&mut buf, 1024).unwrap(), Some(Packet::Pong));
        assert_eq!(Packet::try_decode(&mut buf, 1024).unwrap(), Some(Packet::StreamResponse { stream_id: 3, payload: Bytes::from_static(b"second") }));
        assert_eq!(Packet::try_decode(&mut buf, 1024).unwrap(), None);
    }

    #[test]
    fn test_decode_unknown_stream_code() {
        let mut buf = BytesMut::from(&[0u8,15, 0,0,0,1, 0,42][..]);
        assert_eq!(
            Packet::try_decode(&mut buf, 1024).unwrap(),
            Some(Packet::StreamClose { stream_id: 1, code: StreamCode::UnknownError }),
        );
    }

    #[rstest]
    #[case::stream(Packet::StreamPing { stream_id: 3, request_id: 1 }, Some(3))]
    #[case::stream_create(Packet::StreamCreate { stream_id: 4, payload: Bytes::new() }, Some(4))]
    #[case::request(Packet::Request { request_id: 3, payload: Bytes::new() }, None)]
    #[case::pong(Packet::Pong, None)]
    fn test_stream_id(#[case] packet: Packet, #[case] expected: Option<i32>) {
        assert_eq!(packet.stream_id(), expected);
    }
}
