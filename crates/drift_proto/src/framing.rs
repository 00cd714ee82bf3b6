//! Framed header codec for the session transport.
//!
//! Every chunk of stream data travels as a frame: a fixed 18-byte header
//! followed by `length` payload bytes.
//!
//! ```text
//! 0               4               8
//! +---------------+---------------+
//! | Seq Number    | Ack Number    |
//! +-------+-------+---------------+
//! | Len   | Session Id            |
//! +-------+-----------------------+
//! | Id    |
//! +-------+
//! ```
//!
//! All integers are big-endian. `length` counts payload bytes only; a
//! zero-length frame is a pure acknowledgement. Sequence and ack numbers
//! wrap modulo 2^32 and are compared with signed 32-bit differences.

use std::fmt;
use std::io;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the frame header on the wire.
pub const HEADER_LEN: usize = 18;
/// Size of a session id, both in the header and as the raw first-attach prefix.
pub const SESSION_ID_LEN: usize = 8;
/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = 65_535;

/// Opaque identifier of a logical session, stable across carrier replacement.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub seq: u32,
    pub ack: u32,
    pub length: u16,
    pub session_id: SessionId,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.seq.to_be_bytes());
        buf[4..8].copy_from_slice(&self.ack.to_be_bytes());
        buf[8..10].copy_from_slice(&self.length.to_be_bytes());
        buf[10..18].copy_from_slice(self.session_id.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let mut id = [0u8; SESSION_ID_LEN];
        id.copy_from_slice(&buf[10..18]);
        Self {
            seq: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            ack: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            length: u16::from_be_bytes(buf[8..10].try_into().unwrap()),
            session_id: SessionId::from_bytes(id),
        }
    }
}

/// Read one full header from a carrier.
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Header> {
    let mut buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    Ok(Header::decode(&buf))
}

/// Read the raw 8-byte session id prefix an initiator sends on first attach.
pub async fn read_session_id<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<SessionId> {
    let mut buf = [0u8; SESSION_ID_LEN];
    reader.read_exact(&mut buf).await?;
    Ok(SessionId::from_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id() -> SessionId {
        SessionId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8])
    }

    #[test]
    fn header_layout_is_big_endian() {
        let header = Header {
            seq: 0x0102_0304,
            ack: 0x0506_0708,
            length: 0x0A0B,
            session_id: test_id(),
        };
        let wire = header.encode();
        assert_eq!(
            wire,
            [
                0x01, 0x02, 0x03, 0x04, // seq
                0x05, 0x06, 0x07, 0x08, // ack
                0x0A, 0x0B, // length
                1, 2, 3, 4, 5, 6, 7, 8, // session id
            ]
        );
        assert_eq!(Header::decode(&wire), header);
    }

    #[test]
    fn zero_length_frame_is_valid() {
        let header = Header {
            seq: 0,
            ack: 42,
            length: 0,
            session_id: test_id(),
        };
        let decoded = Header::decode(&header.encode());
        assert_eq!(decoded.length, 0);
        assert_eq!(decoded.ack, 42);
    }

    #[tokio::test]
    async fn read_header_from_stream() {
        let header = Header {
            seq: 5,
            ack: 10,
            length: 3,
            session_id: test_id(),
        };
        let mut wire = header.encode().to_vec();
        wire.extend_from_slice(b"abc");

        let mut reader = wire.as_slice();
        let decoded = read_header(&mut reader).await.unwrap();
        assert_eq!(decoded, header);
        assert_eq!(reader, b"abc");
    }

    #[tokio::test]
    async fn read_header_truncated_is_eof() {
        let mut reader = &[0u8; 5][..];
        let err = read_header(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn session_ids_are_distinct_and_displayable() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert!(!a.to_string().is_empty());
        assert!(!a.to_string().contains('='));
    }

    #[tokio::test]
    async fn session_id_prefix_roundtrip() {
        let id = SessionId::generate();
        let mut reader = id.as_bytes().as_slice();
        let read = read_session_id(&mut reader).await.unwrap();
        assert_eq!(read, id);
    }
}
