//! AMQP protocol headers and frame layout.
//!
//! Frame layout (8 byte header + extended header + body):
//!
//! ```text
//! +---------+---------+---------+------------+
//! |  size   |  doff   |  type   |  channel   |
//! | 4 bytes | 1 byte  | 1 byte  |  2 bytes   |
//! +---------+---------+---------+------------+
//! | extended header (doff * 4 - 8 bytes)     |
//! +------------------------------------------+
//! | performative | payload                   |
//! +------------------------------------------+
//! ```
//!
//! `size` covers the whole frame including the header. A frame with an
//! empty body is a heartbeat.

use crate::codec;
use crate::error::ProtocolError;
use crate::performative::{Performative, Transfer};
use crate::sasl::SaslFrame;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of a protocol header in bytes.
pub const PROTOCOL_HEADER_SIZE: usize = 8;

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

pub const FRAME_TYPE_AMQP: u8 = 0x00;
pub const FRAME_TYPE_SASL: u8 = 0x01;

/// Protocol header sent by each peer before any frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolHeader {
    Amqp,
    Sasl,
}

impl ProtocolHeader {
    pub fn to_bytes(self) -> [u8; PROTOCOL_HEADER_SIZE] {
        let id = match self {
            ProtocolHeader::Amqp => 0,
            ProtocolHeader::Sasl => 3,
        };
        [b'A', b'M', b'Q', b'P', id, 1, 0, 0]
    }

    pub fn from_bytes(raw: [u8; PROTOCOL_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        match raw {
            [b'A', b'M', b'Q', b'P', 0, 1, 0, 0] => Ok(ProtocolHeader::Amqp),
            [b'A', b'M', b'Q', b'P', 3, 1, 0, 0] => Ok(ProtocolHeader::Sasl),
            _ => Err(ProtocolError::InvalidProtocolHeader(raw)),
        }
    }
}

/// Body of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// A performative plus, for transfers, the message payload bytes.
    Amqp {
        performative: Performative,
        payload: Bytes,
    },
    Sasl(SaslFrame),
    /// Heartbeat.
    Empty,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel: u16,
    pub body: FrameBody,
}

impl Frame {
    pub fn amqp(channel: u16, performative: impl Into<Performative>) -> Self {
        Self {
            channel,
            body: FrameBody::Amqp {
                performative: performative.into(),
                payload: Bytes::new(),
            },
        }
    }

    pub fn transfer(channel: u16, transfer: Transfer, payload: Bytes) -> Self {
        Self {
            channel,
            body: FrameBody::Amqp {
                performative: Performative::Transfer(transfer),
                payload,
            },
        }
    }

    pub fn sasl(frame: SaslFrame) -> Self {
        Self {
            channel: 0,
            body: FrameBody::Sasl(frame),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            channel: 0,
            body: FrameBody::Empty,
        }
    }

    /// Short description for frame traces.
    pub fn name(&self) -> &'static str {
        match &self.body {
            FrameBody::Amqp { performative, .. } => performative.name(),
            FrameBody::Sasl(frame) => frame.name(),
            FrameBody::Empty => "empty",
        }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self, max_frame_size: u32) -> Result<BytesMut, ProtocolError> {
        let mut body = BytesMut::new();
        let frame_type = match &self.body {
            FrameBody::Amqp {
                performative,
                payload,
            } => {
                codec::encode(&performative.to_value(), &mut body)?;
                body.put_slice(payload);
                FRAME_TYPE_AMQP
            }
            FrameBody::Sasl(frame) => {
                codec::encode(&frame.to_value(), &mut body)?;
                FRAME_TYPE_SASL
            }
            FrameBody::Empty => FRAME_TYPE_AMQP,
        };

        let total = FRAME_HEADER_SIZE + body.len();
        if total > max_frame_size as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: u32::try_from(total).unwrap_or(u32::MAX),
                max: max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(total as u32);
        buf.put_u8(2);
        buf.put_u8(frame_type);
        buf.put_u16(self.channel);
        buf.put_slice(&body);
        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    /// Header fields are validated as soon as they are available so an
    /// oversized frame is rejected without waiting for its body.
    pub fn decode(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if (size as usize) < FRAME_HEADER_SIZE {
            return Err(ProtocolError::InvalidFrameSize(size));
        }
        if size > max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: max_frame_size,
            });
        }

        let doff = buf[4];
        if doff < 2 || doff as u32 * 4 > size {
            return Err(ProtocolError::InvalidDataOffset(doff));
        }

        let frame_type = buf[5];
        if frame_type != FRAME_TYPE_AMQP && frame_type != FRAME_TYPE_SASL {
            return Err(ProtocolError::UnknownFrameType(frame_type));
        }

        let channel = u16::from_be_bytes([buf[6], buf[7]]);

        if buf.len() < size as usize {
            return Ok(None);
        }

        let mut frame = buf.split_to(size as usize).freeze();
        // Skip the fixed header and any extended header.
        frame.advance(doff as usize * 4);

        let body = if !frame.has_remaining() {
            FrameBody::Empty
        } else if frame_type == FRAME_TYPE_SASL {
            FrameBody::Sasl(SaslFrame::from_value(codec::decode(&mut frame)?)?)
        } else {
            let performative = Performative::from_value(codec::decode(&mut frame)?)?;
            FrameBody::Amqp {
                performative,
                payload: frame,
            }
        };

        Ok(Some(Self { channel, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performative::{Begin, Close, Open};
    use crate::sasl::{SaslCode, SaslOutcome};

    const MAX: u32 = 64 * 1024;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::amqp(0, Open::new("container"));
        let mut buf = frame.encode(MAX).unwrap();
        let decoded = Frame::decode(&mut buf, MAX).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_transfer_payload_kept() {
        let transfer = Transfer {
            handle: 1,
            delivery_id: Some(0),
            delivery_tag: Some(Bytes::from_static(b"t")),
            ..Default::default()
        };
        let payload = Bytes::from_static(&[0x00, 0x53, 0x77, 0x40]);
        let frame = Frame::transfer(3, transfer, payload.clone());
        let mut buf = frame.encode(MAX).unwrap();
        let decoded = Frame::decode(&mut buf, MAX).unwrap().unwrap();
        assert_eq!(decoded.channel, 3);
        match decoded.body {
            FrameBody::Amqp {
                performative: Performative::Transfer(t),
                payload: p,
            } => {
                assert_eq!(t.handle, 1);
                assert_eq!(p, payload);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_wire_form() {
        let buf = Frame::heartbeat().encode(MAX).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 8, 2, 0, 0, 0]);
        let mut buf = buf;
        let decoded = Frame::decode(&mut buf, MAX).unwrap().unwrap();
        assert_eq!(decoded.body, FrameBody::Empty);
    }

    #[test]
    fn test_sasl_frame_type() {
        let frame = Frame::sasl(SaslFrame::Outcome(SaslOutcome {
            code: SaslCode::Ok,
            additional_data: None,
        }));
        let mut buf = frame.encode(MAX).unwrap();
        assert_eq!(buf[5], FRAME_TYPE_SASL);
        assert_eq!(Frame::decode(&mut buf, MAX).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_incomplete_frame() {
        let encoded = Frame::amqp(0, Close::default()).encode(MAX).unwrap();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode(&mut buf, MAX).unwrap().is_none());
        let mut buf = BytesMut::from(&encoded[..5]);
        assert!(Frame::decode(&mut buf, MAX).unwrap().is_none());
    }

    #[test]
    fn test_frame_too_large_rejected_from_header() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 2, 0, 0, 0][..]);
        let result = Frame::decode(&mut buf, 1024);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge {
                size: 65536,
                max: 1024
            })
        ));
    }

    #[test]
    fn test_encode_over_limit() {
        let frame = Frame::transfer(0, Transfer::default(), Bytes::from(vec![0u8; 600]));
        assert!(matches!(
            frame.encode(512),
            Err(ProtocolError::FrameTooLarge { max: 512, .. })
        ));
    }

    #[test]
    fn test_bad_size_and_doff() {
        let mut buf = BytesMut::from(&[0, 0, 0, 4, 2, 0, 0, 0][..]);
        assert!(matches!(
            Frame::decode(&mut buf, MAX),
            Err(ProtocolError::InvalidFrameSize(4))
        ));

        let mut buf = BytesMut::from(&[0, 0, 0, 8, 1, 0, 0, 0][..]);
        assert!(matches!(
            Frame::decode(&mut buf, MAX),
            Err(ProtocolError::InvalidDataOffset(1))
        ));

        let mut buf = BytesMut::from(&[0, 0, 0, 8, 3, 0, 0, 0][..]);
        assert!(matches!(
            Frame::decode(&mut buf, MAX),
            Err(ProtocolError::InvalidDataOffset(3))
        ));
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut buf = BytesMut::from(&[0, 0, 0, 8, 2, 7, 0, 0][..]);
        assert!(matches!(
            Frame::decode(&mut buf, MAX),
            Err(ProtocolError::UnknownFrameType(7))
        ));
    }

    #[test]
    fn test_extended_header_skipped() {
        let mut encoded = Frame::amqp(0, Close::default()).encode(MAX).unwrap();
        let body = encoded.split_off(FRAME_HEADER_SIZE);
        let mut buf = BytesMut::new();
        buf.put_u32((FRAME_HEADER_SIZE + 4 + body.len()) as u32);
        buf.put_u8(3);
        buf.put_u8(FRAME_TYPE_AMQP);
        buf.put_u16(0);
        buf.put_u32(0xdeadbeef);
        buf.put_slice(&body);
        let decoded = Frame::decode(&mut buf, MAX).unwrap().unwrap();
        assert_eq!(decoded, Frame::amqp(0, Close::default()));
    }

    #[test]
    fn test_truncated_performative_inside_frame() {
        // list8 claims 10 bytes but the frame ends after 2
        let mut buf = BytesMut::from(&[0, 0, 0, 13, 2, 0, 0, 0, 0x00, 0x53, 0x18, 0xc0, 10][..]);
        assert!(matches!(
            Frame::decode(&mut buf, MAX),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let first = Frame::amqp(0, Open::new("a"));
        let second = Frame::amqp(
            1,
            Begin {
                remote_channel: Some(0),
                next_outgoing_id: 0,
                incoming_window: 10,
                outgoing_window: 10,
                handle_max: u32::MAX,
                offered_capabilities: vec![],
                desired_capabilities: vec![],
                properties: None,
            },
        );
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first.encode(MAX).unwrap());
        buf.extend_from_slice(&second.encode(MAX).unwrap());

        assert_eq!(Frame::decode(&mut buf, MAX).unwrap().unwrap(), first);
        assert_eq!(Frame::decode(&mut buf, MAX).unwrap().unwrap(), second);
        assert!(Frame::decode(&mut buf, MAX).unwrap().is_none());
    }

    #[test]
    fn test_descriptor_chain_body_rejected() {
        let body_len = 200_000;
        let mut buf = BytesMut::new();
        buf.put_u32(8 + body_len as u32);
        buf.put_u8(2);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_bytes(0x00, body_len);

        assert!(matches!(
            Frame::decode(&mut buf, crate::DEFAULT_MAX_FRAME_SIZE),
            Err(ProtocolError::NestingTooDeep(_))
        ));
    }

    #[test]
    fn test_protocol_headers() {
        assert_eq!(&ProtocolHeader::Amqp.to_bytes(), b"AMQP\x00\x01\x00\x00");
        assert_eq!(&ProtocolHeader::Sasl.to_bytes(), b"AMQP\x03\x01\x00\x00");
        assert!(matches!(
            ProtocolHeader::from_bytes(*b"AMQP\x00\x00\x09\x01"),
            Err(ProtocolError::InvalidProtocolHeader(_))
        ));
    }
}
