//! # Frame
//!
//! WebSocket frame headers as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! Unlike codecs that buffer a whole frame, this module only encodes and
//! decodes the *header*; payload bytes flow through the connection's
//! cursors ([`crate::Conn::write`] / [`crate::Conn::read`]) and never need
//! to be assembled in memory. A frame on the wire is laid out as:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! A *message* is one or more consecutive frames of the same opcode, the
//! last of which carries `fin=true`; non-final frames are *fragments*.
//! Control frames (opcode >= 0x8) are always single-frame and carry at
//! most 125 payload bytes.

use std::fmt;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Result, WebSocketError};

/// WebSocket operation code (OpCode) that determines the semantic meaning
/// and handling of a frame.
///
/// # Data Frame OpCodes
/// - `Continuation`: Continues a fragmented message started by another data frame
/// - `Text`: Contains UTF-8 encoded text data
/// - `Binary`: Contains raw binary data
///
/// # Control Frame OpCodes
/// - `Close`: Initiates or confirms connection closure
/// - `Ping`: Tests connection liveness, requiring a `Pong` response
/// - `Pong`: Responds to a `Ping` frame
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved for future protocol
/// extensions; frames carrying them are rejected as invalid per RFC 6455.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`,
    /// `Ping`, or `Pong`).
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// The type of a message-bearing frame surfaced by [`crate::Conn::next_frame`].
///
/// `Pong` is only surfaced when the connection was configured with
/// [`crate::Options::with_observed_pongs`]; otherwise pong frames are
/// consumed by keepalive bookkeeping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// A frame carrying UTF-8 text. The payload is not validated.
    Text,
    /// A frame carrying binary data.
    Binary,
    /// A pong control frame, exposed for callers that track liveness
    /// themselves.
    Pong,
}

/// Maximum encoded size of a frame header: 2 fixed bytes, up to 8 bytes of
/// extended length and an optional 4-byte mask key.
pub(crate) const MAX_HEADER_SIZE: usize = 14;

/// A decoded WebSocket frame header.
///
/// The payload itself is not part of the header; the connection's cursors
/// stream it separately.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    /// This frame ends the message.
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    /// Mask key when the payload is masked.
    pub mask: Option<[u8; 4]>,
    /// Payload length in bytes.
    pub length: u64,
}

impl Default for Header {
    fn default() -> Self {
        // fin=true so a fresh receive cursor reads as "at a message boundary"
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: OpCode::Continuation,
            mask: None,
            length: 0,
        }
    }
}

impl Header {
    /// Header of a single-frame data message.
    pub fn data(opcode: OpCode, length: u64) -> Self {
        Self {
            fin: true,
            opcode,
            length,
            ..Self::default()
        }
    }

    /// Opening header of a streamed message: non-final with no payload.
    pub fn stream_open(opcode: OpCode) -> Self {
        Self {
            fin: false,
            opcode,
            length: 0,
            ..Self::default()
        }
    }

    /// Continuation fragment header.
    pub fn continuation(fin: bool, length: u64) -> Self {
        Self {
            fin,
            opcode: OpCode::Continuation,
            length,
            ..Self::default()
        }
    }

    /// Control frame header. Control frames are never fragmented.
    pub fn control(opcode: OpCode, length: u64) -> Self {
        Self {
            fin: true,
            opcode,
            length,
            ..Self::default()
        }
    }

    /// Whether all three reserved bits are clear. No extension negotiates
    /// them here, so the receive paths require this.
    pub fn rsv_clear(&self) -> bool {
        !(self.rsv1 || self.rsv2 || self.rsv3)
    }

    /// Formats the header into `head`, choosing the shortest length form
    /// that fits, and returns the encoded size.
    pub fn encode(&self, head: &mut [u8; MAX_HEADER_SIZE]) -> usize {
        head[0] = (self.fin as u8) << 7
            | (self.rsv1 as u8) << 6
            | (self.rsv2 as u8) << 5
            | (self.rsv3 as u8) << 4
            | u8::from(self.opcode);

        let size = if self.length <= 125 {
            head[1] = self.length as u8;
            2
        } else if self.length < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(self.length as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&self.length.to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }

    /// Reads and decodes a frame header from `r`.
    ///
    /// Validates the opcode against RFC 6455; reserved bits are carried
    /// through for the caller to reject.
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf[..2]).await?;

        let fin = buf[0] & 0x80 != 0;
        let rsv1 = buf[0] & 0x40 != 0;
        let rsv2 = buf[0] & 0x20 != 0;
        let rsv3 = buf[0] & 0x10 != 0;
        let opcode = OpCode::try_from(buf[0] & 0x0F)?;
        let masked = buf[1] & 0x80 != 0;

        let length = match buf[1] & 0x7F {
            126 => {
                r.read_exact(&mut buf[..2]).await?;
                u64::from(u16::from_be_bytes([buf[0], buf[1]]))
            }
            127 => {
                r.read_exact(&mut buf[..8]).await?;
                u64::from_be_bytes(buf)
            }
            len => u64::from(len),
        };

        let mask = if masked {
            let mut key = [0u8; 4];
            r.read_exact(&mut key).await?;
            Some(key)
        } else {
            None
        };

        Ok(Self {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            mask,
            length,
        })
    }
}

/// The payload of a close frame received from the peer: a two-byte
/// big-endian status code followed by a UTF-8 reason.
///
/// Carried by [`WebSocketError::ClosedByPeer`] and retrievable later via
/// [`crate::Conn::close_reason`].
#[derive(Debug, Clone)]
pub struct CloseReason {
    payload: Bytes,
}

impl CloseReason {
    pub(crate) fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// The status code of the closure, if the payload carried one.
    /// Close payloads must be either empty or at least two bytes.
    pub fn code(&self) -> Option<u16> {
        let bytes = self.payload.get(0..2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// The reason text of the closure, if present and valid UTF-8.
    pub fn reason(&self) -> Option<&str> {
        std::str::from_utf8(self.payload.get(2..)?).ok()
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (Some(code), Some(reason)) = (self.code(), self.reason()) else {
            return write!(f, "bad close message");
        };

        if reason.is_empty() {
            write!(f, "closed with code {code}")
        } else {
            write!(f, "closed with code {code}: {reason:?}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(header: Header) -> Header {
        let mut head = [0u8; MAX_HEADER_SIZE];
        let size = header.encode(&mut head);

        let mut src = &head[..size];
        let decoded = Header::read_from(&mut src).await.expect("decode");
        assert!(src.is_empty(), "decoder left {} of {size} bytes", src.len());
        decoded
    }

    #[test]
    fn test_opcode_is_control() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());

        assert!(!OpCode::Continuation.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
    }

    #[test]
    fn test_opcode_from_u8_invalid() {
        for code in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
            assert!(matches!(
                OpCode::try_from(code),
                Err(WebSocketError::InvalidOpCode(c)) if c == code
            ));
        }
    }

    #[tokio::test]
    async fn test_header_roundtrip_length_forms() {
        // 7-bit, 16-bit and 64-bit length forms, with and without a mask
        for length in [0u64, 1, 125, 126, 65535, 65536, 1 << 40] {
            for mask in [None, Some([0xAA, 0xBB, 0xCC, 0xDD])] {
                let header = Header {
                    fin: length % 2 == 0,
                    opcode: OpCode::Binary,
                    mask,
                    length,
                    ..Header::default()
                };

                let decoded = roundtrip(header).await;
                assert_eq!(decoded.fin, header.fin);
                assert_eq!(decoded.opcode, header.opcode);
                assert_eq!(decoded.mask, header.mask);
                assert_eq!(decoded.length, header.length, "length {length}");
                assert!(decoded.rsv_clear());
            }
        }
    }

    #[test]
    fn test_header_encoded_sizes() {
        let mut head = [0u8; MAX_HEADER_SIZE];

        assert_eq!(Header::data(OpCode::Text, 125).encode(&mut head), 2);
        assert_eq!(head[1], 125);

        assert_eq!(Header::data(OpCode::Text, 126).encode(&mut head), 4);
        assert_eq!(head[1], 126);

        assert_eq!(Header::data(OpCode::Text, 65535).encode(&mut head), 4);
        assert_eq!(&head[2..4], &[0xFF, 0xFF]);

        assert_eq!(Header::data(OpCode::Text, 65536).encode(&mut head), 10);
        assert_eq!(head[1], 127);
    }

    #[test]
    fn test_header_first_byte_layout() {
        let mut head = [0u8; MAX_HEADER_SIZE];
        Header::data(OpCode::Text, 5).encode(&mut head);
        // FIN set, reserved bits clear, opcode 0x1
        assert_eq!(head[0], 0x81);
        assert_eq!(head[1], 5);

        Header::stream_open(OpCode::Binary).encode(&mut head);
        assert_eq!(head[0], 0x02);
        assert_eq!(head[1], 0);

        Header::continuation(true, 0).encode(&mut head);
        assert_eq!(head[0], 0x80);
    }

    #[tokio::test]
    async fn test_header_rsv_bits_carried() {
        let header = Header {
            rsv1: true,
            ..Header::data(OpCode::Text, 3)
        };
        let decoded = roundtrip(header).await;
        assert!(decoded.rsv1);
        assert!(!decoded.rsv_clear());
    }

    #[test]
    fn test_close_reason_parsing() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"goodbye");
        let reason = CloseReason::new(payload);

        assert_eq!(reason.code(), Some(1000));
        assert_eq!(reason.reason(), Some("goodbye"));
        assert_eq!(reason.to_string(), "closed with code 1000: \"goodbye\"");

        let bare = CloseReason::new(1001u16.to_be_bytes().to_vec());
        assert_eq!(bare.code(), Some(1001));
        assert_eq!(bare.reason(), Some(""));
        assert_eq!(bare.to_string(), "closed with code 1001");

        let empty = CloseReason::new(Bytes::new());
        assert_eq!(empty.code(), None);
        assert_eq!(empty.to_string(), "bad close message");
    }
}
